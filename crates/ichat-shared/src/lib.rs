// Types, wire protocol and cryptographic primitives shared by every ichat crate.

pub mod codec;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod model;
pub mod protocol;
pub mod types;

pub use error::{CryptoError, IdentityError, ProtocolError};
pub use identity::IdentityKeyPair;
pub use model::{
    Conversation, ConversationKind, Message, MessageKind, MessageStatus, Participant,
};
pub use types::{ConnectionMode, ConversationId, MessageId, UserId};
