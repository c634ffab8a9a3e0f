//! Client-side data model: conversations, participants and messages.
//!
//! A [`Message`] always holds plaintext in `content`. Whether the copy that
//! went over the wire was encrypted is recorded in `is_encrypted`, which is
//! only ever set after the encryption actually happened.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ConversationId, MessageId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Audio,
    Video,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "audio" => Some(Self::Audio),
            "video" => Some(Self::Video),
            _ => None,
        }
    }
}

/// Delivery state of a message.
///
/// ```text
/// queued ──► sent ──► delivered ──► read
///    │        │ └────────────────────▲
///    └──► failed ◄┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Queued,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn can_transition(self, to: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, to),
            (Queued, Sent)
                | (Queued, Failed)
                | (Sent, Delivered)
                | (Sent, Read)
                | (Sent, Failed)
                | (Delivered, Read)
        )
    }

    /// Confirmed by the record store, so peer acknowledgements may apply.
    pub fn is_confirmed(self) -> bool {
        matches!(self, Self::Sent | Self::Delivered | Self::Read)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    pub status: MessageStatus,
    pub timestamp: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// At most one emoji per user.
    pub reactions: HashMap<UserId, String>,
    pub is_encrypted: bool,
    pub translation: Option<String>,
}

impl Message {
    /// Move to `status` if the transition is legal. Returns whether it moved.
    pub fn advance(&mut self, status: MessageStatus) -> bool {
        if self.status.can_transition(status) {
            self.status = status;
            true
        } else {
            false
        }
    }

    /// Setting the same emoji twice clears it; a different emoji replaces it.
    pub fn toggle_reaction(&mut self, user: &UserId, emoji: &str) {
        if self.reactions.get(user).is_some_and(|e| e == emoji) {
            self.reactions.remove(user);
        } else {
            self.reactions.insert(user.clone(), emoji.to_string());
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Direct,
    Group,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: UserId,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Published identity public key (base64), if the user has one.
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub is_online: bool,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub is_request: bool,
}

impl Conversation {
    /// The other party of a strictly two-person direct conversation.
    pub fn peer_of(&self, local: &UserId) -> Option<&Participant> {
        if self.kind != ConversationKind::Direct || self.participants.len() != 2 {
            return None;
        }
        self.participants.iter().find(|p| &p.id != local)
    }

    pub fn has_participant(&self, user: &UserId) -> bool {
        self.participants.iter().any(|p| &p.id == user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn message() -> Message {
        Message {
            id: MessageId::new("1"),
            conversation_id: ConversationId::new("c"),
            sender_id: UserId::new("u1"),
            kind: MessageKind::Text,
            content: "hi".into(),
            status: MessageStatus::Queued,
            timestamp: Utc::now(),
            expires_at: None,
            reactions: HashMap::new(),
            is_encrypted: false,
            translation: None,
        }
    }

    fn participant(id: &str) -> Participant {
        Participant {
            id: UserId::new(id),
            username: id.into(),
            display_name: None,
            public_key: None,
            is_online: false,
            last_seen: None,
        }
    }

    fn any_status() -> impl Strategy<Value = MessageStatus> {
        prop_oneof![
            Just(MessageStatus::Queued),
            Just(MessageStatus::Sent),
            Just(MessageStatus::Delivered),
            Just(MessageStatus::Read),
            Just(MessageStatus::Failed),
        ]
    }

    fn rank(s: MessageStatus) -> u8 {
        match s {
            MessageStatus::Queued => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Delivered => 2,
            MessageStatus::Read => 3,
            MessageStatus::Failed => 4,
        }
    }

    #[test]
    fn test_failed_is_terminal() {
        let mut m = message();
        assert!(m.advance(MessageStatus::Failed));
        for s in [
            MessageStatus::Queued,
            MessageStatus::Sent,
            MessageStatus::Delivered,
            MessageStatus::Read,
        ] {
            assert!(!m.advance(s));
        }
        assert_eq!(m.status, MessageStatus::Failed);
    }

    #[test]
    fn test_failed_only_before_delivery() {
        assert!(MessageStatus::Queued.can_transition(MessageStatus::Failed));
        assert!(MessageStatus::Sent.can_transition(MessageStatus::Failed));
        assert!(!MessageStatus::Delivered.can_transition(MessageStatus::Failed));
        assert!(!MessageStatus::Read.can_transition(MessageStatus::Failed));
    }

    #[test]
    fn test_unconfirmed_message_cannot_be_read() {
        assert!(!MessageStatus::Queued.can_transition(MessageStatus::Read));
        assert!(!MessageStatus::Queued.can_transition(MessageStatus::Delivered));
    }

    proptest! {
        #[test]
        fn prop_status_never_moves_backwards(path in proptest::collection::vec(any_status(), 0..12)) {
            let mut m = message();
            for next in path {
                let before = m.status;
                if m.advance(next) && next != MessageStatus::Failed {
                    prop_assert!(rank(next) > rank(before));
                }
                if before == MessageStatus::Failed {
                    prop_assert_eq!(m.status, MessageStatus::Failed);
                }
            }
        }
    }

    #[test]
    fn test_reaction_toggle() {
        let mut m = message();
        let u = UserId::new("u2");

        m.toggle_reaction(&u, "👍");
        assert_eq!(m.reactions.get(&u).map(String::as_str), Some("👍"));

        m.toggle_reaction(&u, "❤️");
        assert_eq!(m.reactions.get(&u).map(String::as_str), Some("❤️"));
        assert_eq!(m.reactions.len(), 1);

        m.toggle_reaction(&u, "❤️");
        assert!(m.reactions.is_empty());
    }

    #[test]
    fn test_expiry_is_inclusive() {
        let now = Utc::now();
        let mut m = message();
        assert!(!m.is_expired(now));
        m.expires_at = Some(now);
        assert!(m.is_expired(now));
        m.expires_at = Some(now + chrono::Duration::seconds(1));
        assert!(!m.is_expired(now));
    }

    #[test]
    fn test_peer_only_for_pairwise_direct() {
        let me = UserId::new("me");
        let mut conv = Conversation {
            id: ConversationId::new("1"),
            kind: ConversationKind::Direct,
            name: None,
            participants: vec![participant("me"), participant("bob")],
            is_request: false,
        };
        assert_eq!(conv.peer_of(&me).map(|p| p.id.as_str()), Some("bob"));

        conv.participants.push(participant("carol"));
        assert!(conv.peer_of(&me).is_none());

        conv.participants.pop();
        conv.kind = ConversationKind::Group;
        assert!(conv.peer_of(&me).is_none());
    }

    #[test]
    fn test_conversation_deserializes_record_store_shape() {
        let json = r#"{
            "id": "3", "type": "direct", "isRequest": true,
            "participants": [
                {"id": "1", "username": "a", "displayName": "A", "publicKey": "abc", "isOnline": true},
                {"id": "2", "username": "b", "publicKey": null, "lastSeen": "2024-01-01T00:00:00Z"}
            ],
            "unreadCount": 4
        }"#;
        let conv: Conversation = serde_json::from_str(json).unwrap();
        assert!(conv.is_request);
        assert_eq!(conv.participants[0].public_key.as_deref(), Some("abc"));
        assert!(conv.participants[1].last_seen.is_some());
    }
}
