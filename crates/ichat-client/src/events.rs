use serde::Serialize;

use ichat_shared::{ConversationId, MessageId, MessageStatus, UserId};

/// State changes broadcast to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StoreEvent {
    #[serde(rename_all = "camelCase")]
    MessageAdded {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    /// A temp id was replaced by the record store's id, in place.
    #[serde(rename_all = "camelCase")]
    MessageConfirmed {
        conversation_id: ConversationId,
        temp_id: MessageId,
        message_id: MessageId,
    },
    #[serde(rename_all = "camelCase")]
    StatusChanged {
        conversation_id: ConversationId,
        message_id: MessageId,
        status: MessageStatus,
    },
    /// Reactions or translation changed.
    #[serde(rename_all = "camelCase")]
    MessageUpdated {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    #[serde(rename_all = "camelCase")]
    MessagesRemoved {
        conversation_id: ConversationId,
        message_ids: Vec<MessageId>,
    },
    #[serde(rename_all = "camelCase")]
    UnreadChanged {
        conversation_id: ConversationId,
        count: usize,
    },
    #[serde(rename_all = "camelCase")]
    PresenceChanged { user_id: UserId, is_online: bool },
    ConversationsChanged,
}
