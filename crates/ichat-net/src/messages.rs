use tokio::sync::mpsc;
use tracing::debug;

use ichat_shared::protocol::OutboundEvent;
use ichat_shared::{ConversationId, UserId};

use crate::channel::ChannelCommand;

/// Validate and hand an event to the channel task.
pub async fn emit(
    cmd_tx: &mpsc::Sender<ChannelCommand>,
    event: OutboundEvent,
) -> anyhow::Result<()> {
    event.validate()?;
    debug!(event = event.name(), "emitting realtime event");

    cmd_tx
        .send(ChannelCommand::Emit(event))
        .await
        .map_err(|_| anyhow::anyhow!("Channel command queue closed"))?;

    Ok(())
}

/// Subscribe to the per-user room. Remembered and replayed on reconnect.
pub async fn join_user(cmd_tx: &mpsc::Sender<ChannelCommand>, user: &UserId) -> anyhow::Result<()> {
    emit(cmd_tx, OutboundEvent::JoinUser(user.clone())).await
}

/// Subscribe to a conversation room. Remembered and replayed on reconnect.
pub async fn join_chat(
    cmd_tx: &mpsc::Sender<ChannelCommand>,
    conversation: &ConversationId,
) -> anyhow::Result<()> {
    emit(cmd_tx, OutboundEvent::JoinChat(conversation.clone())).await
}
