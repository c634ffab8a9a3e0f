// Realtime channel client: WebSocket transport task, inbound de-duplication
// and presence tracking.

pub mod channel;
pub mod dedup;
pub mod messages;
pub mod presence;

pub use channel::{spawn_channel, ChannelCommand, ChannelConfig, ChannelNotification};
pub use dedup::RecentEvents;
pub use messages::{emit, join_chat, join_user};
pub use presence::{PresenceInfo, PresenceTracker};
