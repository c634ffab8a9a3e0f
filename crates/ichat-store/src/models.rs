use chrono::{DateTime, Utc};
use ichat_shared::{ConversationId, MessageId, MessageKind, UserId};
use serde::{Deserialize, Serialize};

/// The identity persisted for the signed-in user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredIdentity {
    pub user_id: UserId,
    pub secret_key: [u8; 32],
    pub public_key: String,
    pub created_at: DateTime<Utc>,
}

/// A message accepted while offline and not yet confirmed by the record store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueuedMessage {
    pub temp_id: MessageId,
    pub conversation_id: ConversationId,
    pub content: String,
    pub kind: MessageKind,
    pub expires_at: Option<DateTime<Utc>>,
    pub enqueued_at: DateTime<Utc>,
}
