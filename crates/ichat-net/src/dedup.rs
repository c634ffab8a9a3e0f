//! Inbound de-duplication.
//!
//! The realtime channel delivers at least once, and a reconnect can replay
//! recent traffic. [`RecentEvents`] remembers the identities of the last
//! `capacity` non-idempotent events and rejects repeats.

use std::collections::{HashSet, VecDeque};

use ichat_shared::protocol::{DeliveryAck, InboundEvent};
use ichat_shared::{ConversationId, MessageId};

pub const DEFAULT_DEDUP_WINDOW: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum EventKey {
    Message(ConversationId, MessageId),
    Delivery(DeliveryAck),
}

#[derive(Debug)]
pub struct RecentEvents {
    capacity: usize,
    order: VecDeque<EventKey>,
    seen: HashSet<EventKey>,
}

impl RecentEvents {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Record `event`. Returns `false` if it was already seen within the
    /// window and should be dropped.
    pub fn observe(&mut self, event: &InboundEvent) -> bool {
        let key = match event {
            InboundEvent::ReceiveMessage(msg) => {
                EventKey::Message(msg.conversation_id.clone(), msg.id.clone())
            }
            InboundEvent::MessageDelivered(ack) => EventKey::Delivery(ack.clone()),
            // Idempotent on the receiving side.
            InboundEvent::MessagesRead(_) | InboundEvent::UserStatus(_) => return true,
        };

        if !self.seen.insert(key.clone()) {
            return false;
        }

        self.order.push_back(key);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for RecentEvents {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ichat_shared::protocol::{ReadReceipt, WireMessage};
    use ichat_shared::{MessageKind, MessageStatus, UserId};

    fn receive(id: &str) -> InboundEvent {
        InboundEvent::ReceiveMessage(WireMessage {
            id: MessageId::new(id),
            conversation_id: ConversationId::new("1"),
            sender_id: UserId::new("2"),
            content: "x".into(),
            kind: MessageKind::Text,
            status: MessageStatus::Sent,
            timestamp: Utc::now(),
            expires_at: None,
            reactions: Default::default(),
        })
    }

    #[test]
    fn test_duplicate_message_rejected() {
        let mut recent = RecentEvents::default();
        assert!(recent.observe(&receive("10")));
        assert!(!recent.observe(&receive("10")));
        assert!(recent.observe(&receive("11")));
        assert_eq!(recent.len(), 2);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut recent = RecentEvents::new(2);
        recent.observe(&receive("1"));
        recent.observe(&receive("2"));
        recent.observe(&receive("3"));
        assert_eq!(recent.len(), 2);
        // "1" fell out of the window.
        assert!(recent.observe(&receive("1")));
        assert!(!recent.observe(&receive("3")));
    }

    #[test]
    fn test_read_receipts_pass_through() {
        let mut recent = RecentEvents::default();
        let read = InboundEvent::MessagesRead(ReadReceipt {
            conversation_id: ConversationId::new("1"),
            user_id: UserId::new("2"),
        });
        assert!(recent.observe(&read));
        assert!(recent.observe(&read));
        assert!(recent.is_empty());
    }

    #[test]
    fn test_delivery_acks_keyed_by_user() {
        let mut recent = RecentEvents::default();
        let ack = |user: &str| {
            InboundEvent::MessageDelivered(DeliveryAck {
                conversation_id: ConversationId::new("1"),
                message_id: MessageId::new("9"),
                user_id: UserId::new(user),
            })
        };
        assert!(recent.observe(&ack("2")));
        assert!(recent.observe(&ack("3")));
        assert!(!recent.observe(&ack("2")));
    }
}
