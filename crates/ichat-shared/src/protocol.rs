use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::model::{Message, MessageKind, MessageStatus};
use crate::types::{ConversationId, MessageId, UserId};

/// A message as persisted by the record store and fanned out over the
/// realtime channel. `content` is the wire payload: tagged ciphertext or
/// plaintext. Translations are local-only and never appear here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub id: MessageId,
    #[serde(rename = "chatId")]
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default = "default_status")]
    pub status: MessageStatus,
    #[serde(with = "flexible_time")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, with = "flexible_time::option")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reactions: HashMap<UserId, String>,
}

fn default_status() -> MessageStatus {
    MessageStatus::Sent
}

impl WireMessage {
    /// Build the wire form of a locally held message with the given payload.
    pub fn from_message(message: &Message, payload: String) -> Self {
        Self {
            id: message.id.clone(),
            conversation_id: message.conversation_id.clone(),
            sender_id: message.sender_id.clone(),
            content: payload,
            kind: message.kind,
            status: message.status,
            timestamp: message.timestamp,
            expires_at: message.expires_at,
            reactions: message.reactions.clone(),
        }
    }

    /// Turn into a local message holding `content` as its plaintext.
    pub fn into_message(self, content: String, is_encrypted: bool) -> Message {
        Message {
            id: self.id,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            kind: self.kind,
            content,
            status: self.status,
            timestamp: self.timestamp,
            expires_at: self.expires_at,
            reactions: self.reactions,
            is_encrypted,
            translation: None,
        }
    }
}

/// Body of a create-message request to the record store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReactionUpdate {
    pub id: MessageId,
    #[serde(rename = "chatId")]
    pub conversation_id: ConversationId,
    pub reactions: HashMap<UserId, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyUpdate {
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    #[serde(rename = "chatId")]
    pub conversation_id: ConversationId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryAck {
    #[serde(rename = "chatId")]
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    pub user_id: UserId,
    pub is_online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

/// Events a client emits on the realtime channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundEvent {
    JoinUser(UserId),
    JoinChat(ConversationId),
    SendMessage(WireMessage),
    MarkRead(ReadReceipt),
    AckDelivery(DeliveryAck),
}

/// Events the realtime server pushes to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum InboundEvent {
    ReceiveMessage(WireMessage),
    MessagesRead(ReadReceipt),
    MessageDelivered(DeliveryAck),
    UserStatus(PresenceUpdate),
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinUser(_) => "join_user",
            Self::JoinChat(_) => "join_chat",
            Self::SendMessage(_) => "send_message",
            Self::MarkRead(_) => "mark_read",
            Self::AckDelivery(_) => "ack_delivery",
        }
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        let event = self.name();
        match self {
            Self::JoinUser(user) => require(event, "userId", user.as_str()),
            Self::JoinChat(chat) => require(event, "chatId", chat.as_str()),
            Self::SendMessage(msg) => validate_wire(event, msg),
            Self::MarkRead(receipt) => validate_receipt(event, receipt),
            Self::AckDelivery(ack) => validate_ack(event, ack),
        }
    }

    /// Deserialize and validate a frame received from a client.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let event: Self = serde_json::from_str(text)?;
        event.validate()?;
        Ok(event)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl InboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReceiveMessage(_) => "receive_message",
            Self::MessagesRead(_) => "messages_read",
            Self::MessageDelivered(_) => "message_delivered",
            Self::UserStatus(_) => "user_status",
        }
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        let event = self.name();
        match self {
            Self::ReceiveMessage(msg) => validate_wire(event, msg),
            Self::MessagesRead(receipt) => validate_receipt(event, receipt),
            Self::MessageDelivered(ack) => validate_ack(event, ack),
            Self::UserStatus(update) => require(event, "userId", update.user_id.as_str()),
        }
    }

    /// Deserialize and validate a frame received from the server.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let event: Self = serde_json::from_str(text)?;
        event.validate()?;
        Ok(event)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn require(event: &'static str, field: &'static str, value: &str) -> Result<(), ProtocolError> {
    if value.trim().is_empty() {
        Err(ProtocolError::MissingField { event, field })
    } else {
        Ok(())
    }
}

fn validate_wire(event: &'static str, msg: &WireMessage) -> Result<(), ProtocolError> {
    require(event, "id", msg.id.as_str())?;
    require(event, "chatId", msg.conversation_id.as_str())?;
    require(event, "senderId", msg.sender_id.as_str())
}

fn validate_receipt(event: &'static str, receipt: &ReadReceipt) -> Result<(), ProtocolError> {
    require(event, "chatId", receipt.conversation_id.as_str())?;
    require(event, "userId", receipt.user_id.as_str())
}

fn validate_ack(event: &'static str, ack: &DeliveryAck) -> Result<(), ProtocolError> {
    require(event, "chatId", ack.conversation_id.as_str())?;
    require(event, "messageId", ack.message_id.as_str())?;
    require(event, "userId", ack.user_id.as_str())
}

/// Timestamps arrive either as RFC 3339 or as SQLite's
/// `YYYY-MM-DD HH:MM:SS` (UTC) form. Always written as RFC 3339.
mod flexible_time {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    const SQLITE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn parse(s: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(s, SQLITE_FORMAT)
                    .ok()
                    .map(|naive| naive.and_utc())
            })
    }

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).ok_or_else(|| D::Error::custom(format!("invalid timestamp: {raw}")))
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &Option<DateTime<Utc>>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(dt) => s.serialize_some(&dt.to_rfc3339()),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<String>::deserialize(d)? {
                Some(raw) => parse(&raw)
                    .map(Some)
                    .ok_or_else(|| D::Error::custom(format!("invalid timestamp: {raw}"))),
                None => Ok(None),
            }
        }
    }
}
