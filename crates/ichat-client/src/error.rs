use thiserror::Error;

use ichat_shared::{ConversationId, IdentityError, MessageId};
use ichat_store::StoreError;

/// Failures talking to the record store over HTTP.
#[derive(Error, Debug)]
pub enum RecordStoreError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Record store responded {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid record store response: {0}")]
    Decode(String),
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Local storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Record store error: {0}")]
    Records(#[from] RecordStoreError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Unknown conversation: {0}")]
    UnknownConversation(ConversationId),

    #[error("Unknown message: {0}")]
    UnknownMessage(MessageId),

    #[error("Realtime channel error: {0}")]
    Realtime(String),

    #[error("Realtime channel closed")]
    ChannelClosed,

    #[error("Audio capture error: {0}")]
    Capture(String),

    #[error("Text service error: {0}")]
    TextService(String),
}
