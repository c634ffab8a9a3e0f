//! Per-conversation message timelines and the send/receive pipelines.
//!
//! Every message in a timeline holds plaintext. What went over the wire is
//! decided per send (ciphertext when a shared key exists, plaintext otherwise)
//! and recorded in `Message::is_encrypted`. Optimistic inserts keep their
//! position when the record store confirms them; later events never reorder
//! a timeline.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use ichat_net::{emit, join_chat, ChannelCommand, PresenceInfo, PresenceTracker};
use ichat_shared::codec;
use ichat_shared::constants::DECRYPTION_FAILED_SENTINEL;
use ichat_shared::protocol::{
    DeliveryAck, InboundEvent, NewMessage, OutboundEvent, PresenceUpdate, ReadReceipt, WireMessage,
};
use ichat_shared::{
    ConnectionMode, Conversation, ConversationId, Message, MessageId, MessageKind, MessageStatus,
    UserId,
};
use ichat_store::QueuedMessage;

use crate::assist::TextService;
use crate::error::{ClientError, RecordStoreError};
use crate::events::StoreEvent;
use crate::keys::{KeyManager, SharedKey};
use crate::offline::{OfflineQueue, ReplayOutcome, ReplaySink};
use crate::records::RecordStore;

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Confirmed by the record store under this id.
    Sent(MessageId),
    /// Offline: held in the offline queue under this temp id.
    Queued(MessageId),
    /// The record store rejected it while online. The message stays in its
    /// timeline as `failed` until [`MessageStore::resend_failed`].
    Failed(MessageId),
}

/// Absolute expiry for a time-to-live. A zero TTL means "never expires".
pub fn expires_in(ttl: std::time::Duration) -> Option<DateTime<Utc>> {
    if ttl.is_zero() {
        return None;
    }
    chrono::Duration::from_std(ttl).ok().map(|d| Utc::now() + d)
}

#[derive(Debug, Default)]
struct Timeline {
    messages: Vec<Message>,
    /// Every id ever appended, including evicted ones.
    known: HashSet<MessageId>,
    unread: HashSet<MessageId>,
}

impl Timeline {
    fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| &m.id == id)
    }

    fn get_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| &m.id == id)
    }

    /// Append unless the id was seen before.
    fn push(&mut self, message: Message) -> bool {
        if !self.known.insert(message.id.clone()) {
            return false;
        }
        self.messages.push(message);
        true
    }

    fn unread_count(&self, now: DateTime<Utc>) -> usize {
        self.messages
            .iter()
            .filter(|m| self.unread.contains(&m.id) && !m.is_expired(now))
            .count()
    }
}

#[derive(Default)]
struct State {
    conversations: HashMap<ConversationId, Conversation>,
    timelines: HashMap<ConversationId, Timeline>,
    active: Option<ConversationId>,
    /// Temp ids with a send attempt currently awaiting the record store.
    in_flight: HashSet<MessageId>,
    presence: PresenceTracker,
}

/// Everything a [`MessageStore`] talks to.
pub struct MessageStoreParts {
    pub local_user: UserId,
    pub assistant_id: UserId,
    pub language: String,
    pub keys: Arc<KeyManager>,
    pub records: Arc<dyn RecordStore>,
    pub text: Option<Arc<dyn TextService>>,
    pub queue: Arc<OfflineQueue>,
    pub channel: mpsc::Sender<ChannelCommand>,
    pub connectivity: watch::Receiver<ConnectionMode>,
}

pub struct MessageStore {
    local_user: UserId,
    assistant_id: UserId,
    language: String,
    keys: Arc<KeyManager>,
    records: Arc<dyn RecordStore>,
    text: Option<Arc<dyn TextService>>,
    queue: Arc<OfflineQueue>,
    channel: mpsc::Sender<ChannelCommand>,
    connectivity: watch::Receiver<ConnectionMode>,
    events: broadcast::Sender<StoreEvent>,
    state: Mutex<State>,
}

struct Route {
    key: Option<SharedKey>,
    assistant: bool,
}

/// Marks a temp id as in flight until dropped.
struct InFlight<'a> {
    store: &'a MessageStore,
    id: MessageId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.store.state().in_flight.remove(&self.id);
    }
}

impl MessageStore {
    pub fn new(parts: MessageStoreParts) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            local_user: parts.local_user,
            assistant_id: parts.assistant_id,
            language: parts.language,
            keys: parts.keys,
            records: parts.records,
            text: parts.text,
            queue: parts.queue,
            channel: parts.channel,
            connectivity: parts.connectivity,
            events,
            state: Mutex::new(State::default()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.borrow().is_online()
    }

    // -- conversations ------------------------------------------------------

    /// Reload the conversation list from the record store.
    pub async fn refresh_conversations(&self) -> Result<usize, ClientError> {
        let conversations = self.records.list_conversations().await?;
        let count = conversations.len();
        self.set_conversations(conversations);
        Ok(count)
    }

    pub fn set_conversations(&self, conversations: Vec<Conversation>) {
        {
            let mut state = self.state();
            state.conversations = conversations
                .into_iter()
                .map(|c| (c.id.clone(), c))
                .collect();
        }
        self.notify(StoreEvent::ConversationsChanged);
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.state().conversations.values().cloned().collect()
    }

    pub fn conversation(&self, id: &ConversationId) -> Option<Conversation> {
        self.state().conversations.get(id).cloned()
    }

    pub fn active_conversation(&self) -> Option<ConversationId> {
        self.state().active.clone()
    }

    /// Make `conversation` the active one: subscribe to its room, send a read
    /// receipt, reset its unread count and merge in the server history.
    pub async fn open_conversation(
        &self,
        conversation: &ConversationId,
    ) -> Result<Vec<Message>, ClientError> {
        {
            let mut state = self.state();
            state.active = Some(conversation.clone());
            state
                .timelines
                .entry(conversation.clone())
                .or_default()
                .unread
                .clear();
        }
        self.notify(StoreEvent::UnreadChanged {
            conversation_id: conversation.clone(),
            count: 0,
        });

        if let Err(e) = join_chat(&self.channel, conversation).await {
            warn!(conversation = %conversation, error = %e, "join_chat not sent");
        }
        self.publish(OutboundEvent::MarkRead(ReadReceipt {
            conversation_id: conversation.clone(),
            user_id: self.local_user.clone(),
        }))
        .await;
        if let Err(e) = self.records.mark_read(conversation).await {
            warn!(conversation = %conversation, error = %e, "mark read not persisted");
        }

        let now = Utc::now();
        let history: Vec<Message> = self
            .records
            .list_messages(conversation)
            .await?
            .into_iter()
            .filter(|w| !w.expires_at.is_some_and(|at| at <= now))
            .map(|w| self.open_wire(w))
            .collect();
        debug!(conversation = %conversation, count = history.len(), "history fetched");

        self.merge_history(conversation, history);
        Ok(self.visible_messages(conversation))
    }

    pub fn close_conversation(&self) {
        self.state().active = None;
    }

    /// Drop a conversation and everything cached for it, shared key included.
    pub fn remove_conversation(&self, conversation: &ConversationId) {
        {
            let mut state = self.state();
            state.conversations.remove(conversation);
            state.timelines.remove(conversation);
            if state.active.as_ref() == Some(conversation) {
                state.active = None;
            }
        }
        self.keys.forget(conversation);
        self.notify(StoreEvent::ConversationsChanged);
    }

    // -- send pipeline -------------------------------------------------------

    /// Submit a new message.
    ///
    /// It appears at the tail of the timeline immediately as `queued`. Offline,
    /// it is persisted to the offline queue and the call returns. Online, it
    /// is encrypted when possible, persisted by the record store, reconciled
    /// in place and published to the conversation room.
    pub async fn send(
        &self,
        conversation: &ConversationId,
        content: &str,
        kind: MessageKind,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<SendOutcome, ClientError> {
        let temp_id = MessageId::temporary();
        let now = Utc::now();
        self.insert_local(Message {
            id: temp_id.clone(),
            conversation_id: conversation.clone(),
            sender_id: self.local_user.clone(),
            kind,
            content: content.to_string(),
            status: MessageStatus::Queued,
            timestamp: now,
            expires_at,
            reactions: HashMap::new(),
            is_encrypted: false,
            translation: None,
        });

        if !self.is_online() {
            let entry = QueuedMessage {
                temp_id: temp_id.clone(),
                conversation_id: conversation.clone(),
                content: content.to_string(),
                kind,
                expires_at,
                enqueued_at: now,
            };
            if let Err(e) = self.queue.enqueue(entry) {
                self.set_status(conversation, &temp_id, MessageStatus::Failed);
                return Err(e);
            }
            return Ok(SendOutcome::Queued(temp_id));
        }

        match self
            .deliver(conversation, &temp_id, content, kind, expires_at)
            .await
        {
            Ok(id) => Ok(SendOutcome::Sent(id)),
            Err(e) => {
                warn!(conversation = %conversation, temp_id = %temp_id, error = %e, "send failed");
                self.set_status(conversation, &temp_id, MessageStatus::Failed);
                Ok(SendOutcome::Failed(temp_id))
            }
        }
    }

    /// Replace a failed message with a fresh send of the same content.
    pub async fn resend_failed(
        &self,
        conversation: &ConversationId,
        message_id: &MessageId,
    ) -> Result<SendOutcome, ClientError> {
        let failed = {
            let mut state = self.state();
            let timeline = state
                .timelines
                .get_mut(conversation)
                .ok_or_else(|| ClientError::UnknownConversation(conversation.clone()))?;
            let pos = timeline
                .position(message_id)
                .filter(|&p| timeline.messages[p].status == MessageStatus::Failed)
                .ok_or_else(|| ClientError::UnknownMessage(message_id.clone()))?;
            timeline.known.remove(message_id);
            timeline.messages.remove(pos)
        };
        self.notify(StoreEvent::MessagesRemoved {
            conversation_id: conversation.clone(),
            message_ids: vec![message_id.clone()],
        });

        self.send(conversation, &failed.content, failed.kind, failed.expires_at)
            .await
    }

    /// Re-insert messages still waiting in the offline queue, e.g. after a
    /// restart. Returns how many were restored.
    pub fn restore_queued(&self, entries: &[QueuedMessage]) -> usize {
        let mut restored = 0;
        for entry in entries {
            if self.ensure_queued_message(entry) {
                restored += 1;
            }
        }
        if restored > 0 {
            info!(count = restored, "restored queued messages");
        }
        restored
    }

    async fn deliver(
        &self,
        conversation: &ConversationId,
        temp_id: &MessageId,
        content: &str,
        kind: MessageKind,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<MessageId, RecordStoreError> {
        let route = self.route(conversation, kind);

        let (payload, encrypted) = match route.key {
            Some(key) => match codec::encrypt(content, &key) {
                Ok(wire) => (wire, true),
                Err(e) => {
                    warn!(conversation = %conversation, error = %e, "encryption failed, sending in the clear");
                    (content.to_string(), false)
                }
            },
            None => (content.to_string(), false),
        };

        let mut saved = self
            .records
            .create_message(
                conversation,
                &NewMessage {
                    content: payload,
                    kind,
                    expires_at,
                },
            )
            .await?;
        if expires_at.is_some() {
            saved.expires_at = expires_at;
        }

        let id = saved.id.clone();
        self.reconcile(conversation, temp_id, &saved, encrypted);
        info!(
            conversation = %conversation,
            message = %id,
            encrypted,
            "message sent"
        );

        self.publish(OutboundEvent::SendMessage(saved)).await;

        if route.assistant && kind == MessageKind::Text {
            self.assistant_reply(conversation, content).await;
        }

        Ok(id)
    }

    /// Swap the temp id for the confirmed one, keeping position and plaintext.
    fn reconcile(
        &self,
        conversation: &ConversationId,
        temp_id: &MessageId,
        saved: &WireMessage,
        encrypted: bool,
    ) {
        let event = {
            let mut state = self.state();
            let timeline = state.timelines.entry(conversation.clone()).or_default();
            let Some(pos) = timeline.position(temp_id) else {
                timeline.known.insert(saved.id.clone());
                debug!(temp_id = %temp_id, "message gone before confirmation");
                return;
            };
            timeline.known.remove(temp_id);

            if timeline.known.contains(&saved.id) {
                // The confirmed copy already arrived over the realtime channel.
                timeline.messages.remove(pos);
                StoreEvent::MessagesRemoved {
                    conversation_id: conversation.clone(),
                    message_ids: vec![temp_id.clone()],
                }
            } else {
                timeline.known.insert(saved.id.clone());
                let message = &mut timeline.messages[pos];
                message.id = saved.id.clone();
                message.timestamp = saved.timestamp;
                message.expires_at = saved.expires_at;
                message.reactions = saved.reactions.clone();
                message.is_encrypted = encrypted;
                message.advance(MessageStatus::Sent);
                StoreEvent::MessageConfirmed {
                    conversation_id: conversation.clone(),
                    temp_id: temp_id.clone(),
                    message_id: saved.id.clone(),
                }
            }
        };
        self.notify(event);
    }

    fn route(&self, conversation: &ConversationId, kind: MessageKind) -> Route {
        let Some(conv) = self.conversation(conversation) else {
            return Route {
                key: None,
                assistant: false,
            };
        };
        let assistant = conv.has_participant(&self.assistant_id);
        let key = if kind == MessageKind::Text && !assistant {
            self.keys.derive_for(&conv, &self.local_user)
        } else {
            None
        };
        Route { key, assistant }
    }

    async fn assistant_reply(&self, conversation: &ConversationId, prompt: &str) {
        let Some(text) = &self.text else {
            return;
        };

        let reply = match text.reply(prompt).await {
            Ok(Some(reply)) => reply,
            Ok(None) => return,
            Err(e) => {
                warn!(conversation = %conversation, error = %e, "assistant reply failed");
                return;
            }
        };

        let new = NewMessage {
            content: reply.clone(),
            kind: MessageKind::Text,
            expires_at: None,
        };
        match self.records.create_message(conversation, &new).await {
            Ok(saved) => {
                let mut message = saved.into_message(reply, false);
                message.sender_id = self.assistant_id.clone();
                self.insert_local(message);
            }
            Err(e) => warn!(conversation = %conversation, error = %e, "assistant reply not persisted"),
        }
    }

    // -- receive pipeline ----------------------------------------------------

    /// Feed one inbound message through de-dup, decryption and append.
    /// Returns whether it was appended.
    pub async fn receive(&self, wire: WireMessage) -> bool {
        let conversation = wire.conversation_id.clone();
        let (duplicate, known_conversation) = {
            let mut state = self.state();
            let known_conversation = state.conversations.contains_key(&conversation);
            let timeline = state.timelines.entry(conversation.clone()).or_default();
            let duplicate = timeline.known.contains(&wire.id);
            if !duplicate && wire.expires_at.is_some_and(|at| at <= Utc::now()) {
                timeline.known.insert(wire.id.clone());
                debug!(message = %wire.id, "dropping already expired message");
                return false;
            }
            (duplicate, known_conversation)
        };
        if duplicate {
            debug!(message = %wire.id, "duplicate message ignored");
            return false;
        }

        if !known_conversation {
            if let Err(e) = self.refresh_conversations().await {
                warn!(conversation = %conversation, error = %e, "conversation refresh failed");
            }
        }

        let message = self.open_wire(wire);
        let message_id = message.id.clone();
        let from_peer = message.sender_id != self.local_user;

        let (active, unread) = {
            let mut state = self.state();
            let active = state.active.as_ref() == Some(&conversation);
            let timeline = state.timelines.entry(conversation.clone()).or_default();
            if !timeline.push(message) {
                return false;
            }
            if from_peer && !active {
                timeline.unread.insert(message_id.clone());
            }
            (active, timeline.unread_count(Utc::now()))
        };

        self.notify(StoreEvent::MessageAdded {
            conversation_id: conversation.clone(),
            message_id: message_id.clone(),
        });

        if from_peer {
            self.publish(OutboundEvent::AckDelivery(DeliveryAck {
                conversation_id: conversation.clone(),
                message_id,
                user_id: self.local_user.clone(),
            }))
            .await;

            if active {
                self.publish(OutboundEvent::MarkRead(ReadReceipt {
                    conversation_id: conversation,
                    user_id: self.local_user.clone(),
                }))
                .await;
            } else {
                self.notify(StoreEvent::UnreadChanged {
                    conversation_id: conversation,
                    count: unread,
                });
            }
        }
        true
    }

    /// Route a validated realtime event.
    pub async fn apply(&self, event: InboundEvent) {
        match event {
            InboundEvent::ReceiveMessage(wire) => {
                self.receive(wire).await;
            }
            InboundEvent::MessagesRead(receipt) => self.apply_read(&receipt),
            InboundEvent::MessageDelivered(ack) => self.apply_delivered(&ack),
            InboundEvent::UserStatus(update) => self.apply_presence(&update),
        }
    }

    fn apply_read(&self, receipt: &ReadReceipt) {
        if receipt.user_id == self.local_user {
            return;
        }

        let mut changed = Vec::new();
        {
            let mut state = self.state();
            if let Some(timeline) = state.timelines.get_mut(&receipt.conversation_id) {
                for message in timeline
                    .messages
                    .iter_mut()
                    .filter(|m| m.sender_id == self.local_user && m.status.is_confirmed())
                {
                    if message.advance(MessageStatus::Read) {
                        changed.push(message.id.clone());
                    }
                }
            }
        }

        for message_id in changed {
            self.notify(StoreEvent::StatusChanged {
                conversation_id: receipt.conversation_id.clone(),
                message_id,
                status: MessageStatus::Read,
            });
        }
    }

    fn apply_delivered(&self, ack: &DeliveryAck) {
        if ack.user_id == self.local_user {
            return;
        }

        let advanced = {
            let mut state = self.state();
            state
                .timelines
                .get_mut(&ack.conversation_id)
                .and_then(|t| t.get_mut(&ack.message_id))
                .filter(|m| m.sender_id == self.local_user)
                .is_some_and(|m| m.advance(MessageStatus::Delivered))
        };

        if advanced {
            self.notify(StoreEvent::StatusChanged {
                conversation_id: ack.conversation_id.clone(),
                message_id: ack.message_id.clone(),
                status: MessageStatus::Delivered,
            });
        }
    }

    fn apply_presence(&self, update: &PresenceUpdate) {
        {
            let mut guard = self.state();
            let state = &mut *guard;
            state.presence.apply(update);
            for participant in state
                .conversations
                .values_mut()
                .flat_map(|c| c.participants.iter_mut())
                .filter(|p| p.id == update.user_id)
            {
                participant.is_online = update.is_online;
                if update.last_seen.is_some() {
                    participant.last_seen = update.last_seen;
                }
            }
        }
        self.notify(StoreEvent::PresenceChanged {
            user_id: update.user_id.clone(),
            is_online: update.is_online,
        });
    }

    pub fn presence(&self, user: &UserId) -> Option<PresenceInfo> {
        self.state().presence.get(user).cloned()
    }

    // -- reactions and translation --------------------------------------------

    /// Toggle the local user's reaction, then mirror it to the record store.
    pub async fn react(
        &self,
        conversation: &ConversationId,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<(), ClientError> {
        let pending = {
            let mut state = self.state();
            let message = state
                .timelines
                .get_mut(conversation)
                .and_then(|t| t.get_mut(message_id))
                .ok_or_else(|| ClientError::UnknownMessage(message_id.clone()))?;
            message.toggle_reaction(&self.local_user, emoji);
            message.id.is_temporary()
        };
        self.notify_updated(conversation, message_id);

        if pending {
            return Ok(());
        }

        match self.records.react(message_id, emoji).await {
            Ok(update) => {
                let mut state = self.state();
                if let Some(message) = state
                    .timelines
                    .get_mut(conversation)
                    .and_then(|t| t.get_mut(message_id))
                {
                    message.reactions = update.reactions;
                }
                drop(state);
                self.notify_updated(conversation, message_id);
            }
            Err(e) => warn!(message = %message_id, error = %e, "reaction not persisted"),
        }
        Ok(())
    }

    /// Translate a message into the configured language and attach the result
    /// locally. Translations are never sent anywhere.
    pub async fn translate(
        &self,
        conversation: &ConversationId,
        message_id: &MessageId,
    ) -> Result<String, ClientError> {
        let text = self
            .text
            .as_ref()
            .ok_or_else(|| ClientError::TextService("no text service configured".into()))?;

        let content = self
            .find(conversation, message_id)
            .map(|m| m.content)
            .ok_or_else(|| ClientError::UnknownMessage(message_id.clone()))?;

        let translation = text.translate(&content, &self.language).await?;

        {
            let mut state = self.state();
            let message = state
                .timelines
                .get_mut(conversation)
                .and_then(|t| t.get_mut(message_id))
                .ok_or_else(|| ClientError::UnknownMessage(message_id.clone()))?;
            message.translation = Some(translation.clone());
        }
        self.notify_updated(conversation, message_id);
        Ok(translation)
    }

    // -- expiry and read paths -----------------------------------------------

    /// Remove every message whose expiry is at or before `now`.
    /// Returns how many were removed.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let mut removed = Vec::new();
        {
            let mut state = self.state();
            for (conversation, timeline) in state.timelines.iter_mut() {
                let expired: Vec<MessageId> = timeline
                    .messages
                    .iter()
                    .filter(|m| m.is_expired(now))
                    .map(|m| m.id.clone())
                    .collect();
                if expired.is_empty() {
                    continue;
                }
                timeline.messages.retain(|m| !m.is_expired(now));
                for id in &expired {
                    timeline.unread.remove(id);
                }
                removed.push((conversation.clone(), expired));
            }
        }

        let mut count = 0;
        for (conversation_id, message_ids) in removed {
            count += message_ids.len();
            debug!(conversation = %conversation_id, count = message_ids.len(), "messages expired");
            self.notify(StoreEvent::MessagesRemoved {
                conversation_id,
                message_ids,
            });
        }
        count
    }

    pub fn visible_messages(&self, conversation: &ConversationId) -> Vec<Message> {
        self.visible_messages_at(conversation, Utc::now())
    }

    pub fn visible_messages_at(
        &self,
        conversation: &ConversationId,
        now: DateTime<Utc>,
    ) -> Vec<Message> {
        self.state()
            .timelines
            .get(conversation)
            .map(|t| {
                t.messages
                    .iter()
                    .filter(|m| !m.is_expired(now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn last_message(&self, conversation: &ConversationId) -> Option<Message> {
        let now = Utc::now();
        self.state()
            .timelines
            .get(conversation)
            .and_then(|t| t.messages.iter().rev().find(|m| !m.is_expired(now)).cloned())
    }

    pub fn unread_count(&self, conversation: &ConversationId) -> usize {
        let now = Utc::now();
        self.state()
            .timelines
            .get(conversation)
            .map_or(0, |t| t.unread_count(now))
    }

    pub fn total_unread(&self) -> usize {
        let now = Utc::now();
        self.state()
            .timelines
            .values()
            .map(|t| t.unread_count(now))
            .sum()
    }

    pub fn find(&self, conversation: &ConversationId, message_id: &MessageId) -> Option<Message> {
        self.state()
            .timelines
            .get(conversation)
            .and_then(|t| t.messages.iter().find(|m| &m.id == message_id).cloned())
    }

    // -- helpers -------------------------------------------------------------

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, event: StoreEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn notify_updated(&self, conversation: &ConversationId, message_id: &MessageId) {
        self.notify(StoreEvent::MessageUpdated {
            conversation_id: conversation.clone(),
            message_id: message_id.clone(),
        });
    }

    async fn publish(&self, event: OutboundEvent) {
        let name = event.name();
        if let Err(e) = emit(&self.channel, event).await {
            warn!(event = name, error = %e, "realtime event not published");
        }
    }

    fn insert_local(&self, message: Message) {
        let conversation_id = message.conversation_id.clone();
        let message_id = message.id.clone();
        let inserted = self
            .state()
            .timelines
            .entry(conversation_id.clone())
            .or_default()
            .push(message);
        if inserted {
            self.notify(StoreEvent::MessageAdded {
                conversation_id,
                message_id,
            });
        }
    }

    fn ensure_queued_message(&self, entry: &QueuedMessage) -> bool {
        let exists = self
            .state()
            .timelines
            .get(&entry.conversation_id)
            .is_some_and(|t| t.known.contains(&entry.temp_id));
        if exists {
            return false;
        }

        self.insert_local(Message {
            id: entry.temp_id.clone(),
            conversation_id: entry.conversation_id.clone(),
            sender_id: self.local_user.clone(),
            kind: entry.kind,
            content: entry.content.clone(),
            status: MessageStatus::Queued,
            timestamp: entry.enqueued_at,
            expires_at: entry.expires_at,
            reactions: HashMap::new(),
            is_encrypted: false,
            translation: None,
        });
        true
    }

    fn set_status(&self, conversation: &ConversationId, message_id: &MessageId, status: MessageStatus) {
        let advanced = self
            .state()
            .timelines
            .get_mut(conversation)
            .and_then(|t| t.get_mut(message_id))
            .is_some_and(|m| m.advance(status));
        if advanced {
            self.notify(StoreEvent::StatusChanged {
                conversation_id: conversation.clone(),
                message_id: message_id.clone(),
                status,
            });
        }
    }

    fn claim(&self, temp_id: &MessageId) -> Option<InFlight<'_>> {
        if self.state().in_flight.insert(temp_id.clone()) {
            Some(InFlight {
                store: self,
                id: temp_id.clone(),
            })
        } else {
            None
        }
    }

    fn key_for(&self, conversation: &ConversationId) -> Option<SharedKey> {
        match self.conversation(conversation) {
            Some(conv) => self.keys.derive_for(&conv, &self.local_user),
            None => self.keys.derive(conversation, None),
        }
    }

    /// Turn a wire message into a local one, decrypting tagged payloads. A
    /// payload that cannot be decrypted keeps its id and timestamp and shows
    /// the failure sentinel.
    fn open_wire(&self, wire: WireMessage) -> Message {
        if !codec::is_encrypted(&wire.content) {
            let content = wire.content.clone();
            return wire.into_message(content, false);
        }

        let content = match self.key_for(&wire.conversation_id) {
            Some(key) => codec::decrypt(&wire.content, &key),
            None => {
                debug!(conversation = %wire.conversation_id, message = %wire.id, "no key for encrypted message");
                DECRYPTION_FAILED_SENTINEL.to_string()
            }
        };
        wire.into_message(content, true)
    }

    /// Server history is authoritative for confirmed messages. Local copies
    /// of confirmed messages keep their plaintext and translation; unconfirmed
    /// local messages stay at the tail in their original order.
    fn merge_history(&self, conversation: &ConversationId, history: Vec<Message>) {
        let mut state = self.state();
        let timeline = state.timelines.entry(conversation.clone()).or_default();

        let mut local: HashMap<MessageId, Message> = HashMap::new();
        let mut pending = Vec::new();
        for message in std::mem::take(&mut timeline.messages) {
            if message.id.is_temporary() {
                pending.push(message);
            } else {
                local.insert(message.id.clone(), message);
            }
        }

        let mut merged = Vec::with_capacity(history.len() + pending.len());
        for fetched in history {
            let message = match local.remove(&fetched.id) {
                Some(mut existing) => {
                    existing.advance(fetched.status);
                    existing.reactions = fetched.reactions;
                    existing
                }
                None => fetched,
            };
            timeline.known.insert(message.id.clone());
            merged.push(message);
        }
        merged.extend(pending);
        timeline.messages = merged;
    }
}

#[async_trait]
impl ReplaySink for MessageStore {
    async fn replay(&self, entry: &QueuedMessage) -> ReplayOutcome {
        if entry.expires_at.is_some_and(|at| at <= Utc::now()) {
            return ReplayOutcome::Expired;
        }
        if !self.is_online() {
            return ReplayOutcome::Deferred;
        }
        let Some(_in_flight) = self.claim(&entry.temp_id) else {
            debug!(temp_id = %entry.temp_id, "send already in flight");
            return ReplayOutcome::Deferred;
        };

        self.ensure_queued_message(entry);
        match self
            .deliver(
                &entry.conversation_id,
                &entry.temp_id,
                &entry.content,
                entry.kind,
                entry.expires_at,
            )
            .await
        {
            Ok(_) => ReplayOutcome::Sent,
            Err(e) => {
                warn!(temp_id = %entry.temp_id, error = %e, "replay failed, keeping queued");
                ReplayOutcome::Failed
            }
        }
    }

    fn is_online(&self) -> bool {
        MessageStore::is_online(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    use chrono::Duration;
    use ichat_shared::protocol::ReactionUpdate;
    use ichat_shared::{ConversationKind, IdentityKeyPair, Participant};
    use ichat_store::Database;

    use crate::error::RecordStoreError;

    #[derive(Default)]
    struct MemoryRecords {
        next_id: AtomicU64,
        fail: AtomicBool,
        conversations: Mutex<Vec<Conversation>>,
        history: Mutex<Vec<WireMessage>>,
        created: Mutex<Vec<NewMessage>>,
    }

    impl MemoryRecords {
        fn created(&self) -> Vec<NewMessage> {
            self.created.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RecordStore for MemoryRecords {
        async fn list_conversations(&self) -> Result<Vec<Conversation>, RecordStoreError> {
            Ok(self.conversations.lock().unwrap().clone())
        }

        async fn list_messages(
            &self,
            _conversation: &ConversationId,
        ) -> Result<Vec<WireMessage>, RecordStoreError> {
            Ok(self.history.lock().unwrap().clone())
        }

        async fn create_message(
            &self,
            conversation: &ConversationId,
            message: &NewMessage,
        ) -> Result<WireMessage, RecordStoreError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(RecordStoreError::Status {
                    status: 500,
                    body: "down".into(),
                });
            }
            self.created.lock().unwrap().push(message.clone());
            let id = 100 + self.next_id.fetch_add(1, Ordering::SeqCst);
            Ok(WireMessage {
                id: MessageId::new(id.to_string()),
                conversation_id: conversation.clone(),
                sender_id: UserId::new("1"),
                content: message.content.clone(),
                kind: message.kind,
                status: MessageStatus::Sent,
                timestamp: Utc::now(),
                expires_at: message.expires_at,
                reactions: HashMap::new(),
            })
        }

        async fn mark_read(&self, _conversation: &ConversationId) -> Result<(), RecordStoreError> {
            Ok(())
        }

        async fn react(
            &self,
            message: &MessageId,
            emoji: &str,
        ) -> Result<ReactionUpdate, RecordStoreError> {
            Ok(ReactionUpdate {
                id: message.clone(),
                conversation_id: ConversationId::new("1"),
                reactions: HashMap::from([(UserId::new("1"), emoji.to_string())]),
            })
        }

        async fn update_public_key(&self, _public_key: &str) -> Result<(), RecordStoreError> {
            Ok(())
        }
    }

    struct Harness {
        store: MessageStore,
        records: Arc<MemoryRecords>,
        commands: mpsc::Receiver<ChannelCommand>,
        mode: watch::Sender<ConnectionMode>,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        fn published(&mut self) -> Vec<OutboundEvent> {
            let mut events = Vec::new();
            while let Ok(ChannelCommand::Emit(event)) = self.commands.try_recv() {
                events.push(event);
            }
            events
        }
    }

    fn participant(id: &str, key: Option<String>) -> Participant {
        Participant {
            id: UserId::new(id),
            username: id.into(),
            display_name: None,
            public_key: key,
            is_online: false,
            last_seen: None,
        }
    }

    fn direct(peer_key: Option<String>) -> Conversation {
        Conversation {
            id: ConversationId::new("1"),
            kind: ConversationKind::Direct,
            name: None,
            participants: vec![participant("1", None), participant("2", peer_key)],
            is_request: false,
        }
    }

    fn harness(mode: ConnectionMode) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Mutex::new(
            Database::open_at(&dir.path().join("test.db")).unwrap(),
        ));
        let records = Arc::new(MemoryRecords::default());
        let (channel, commands) = mpsc::channel(256);
        let (mode_tx, connectivity) = watch::channel(mode);
        let store = MessageStore::new(MessageStoreParts {
            local_user: UserId::new("1"),
            assistant_id: UserId::new("0"),
            language: "English".into(),
            keys: Arc::new(KeyManager::generate()),
            records: records.clone(),
            text: None,
            queue: Arc::new(OfflineQueue::load(db).unwrap()),
            channel,
            connectivity,
        });
        Harness {
            store,
            records,
            commands,
            mode: mode_tx,
            _dir: dir,
        }
    }

    fn incoming(id: &str, sender: &str, content: &str) -> WireMessage {
        WireMessage {
            id: MessageId::new(id),
            conversation_id: ConversationId::new("1"),
            sender_id: UserId::new(sender),
            content: content.into(),
            kind: MessageKind::Text,
            status: MessageStatus::Sent,
            timestamp: Utc::now(),
            expires_at: None,
            reactions: HashMap::new(),
        }
    }

    fn conv() -> ConversationId {
        ConversationId::new("1")
    }

    #[tokio::test]
    async fn test_online_send_reconciles_in_place() {
        let mut h = harness(ConnectionMode::Online);
        h.store.set_conversations(vec![direct(None)]);
        h.store.receive(incoming("50", "2", "earlier")).await;

        let outcome = h
            .store
            .send(&conv(), "hello", MessageKind::Text, None)
            .await
            .unwrap();
        let SendOutcome::Sent(id) = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };

        let messages = h.store.visible_messages(&conv());
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].id, id);
        assert_eq!(messages[1].content, "hello");
        assert_eq!(messages[1].status, MessageStatus::Sent);
        assert!(!messages[1].is_encrypted);
        assert!(h
            .published()
            .iter()
            .any(|e| matches!(e, OutboundEvent::SendMessage(w) if w.id == id)));
    }

    #[tokio::test]
    async fn test_encrypts_when_peer_key_known() {
        let peer = IdentityKeyPair::generate();
        let h = harness(ConnectionMode::Online);
        h.store
            .set_conversations(vec![direct(Some(peer.public_key_b64()))]);

        h.store
            .send(&conv(), "secret", MessageKind::Text, None)
            .await
            .unwrap();

        let created = h.records.created();
        assert!(codec::is_encrypted(&created[0].content));
        let local = h.store.visible_messages(&conv());
        assert_eq!(local[0].content, "secret");
        assert!(local[0].is_encrypted);
    }

    #[tokio::test]
    async fn test_non_text_is_sent_in_clear() {
        let peer = IdentityKeyPair::generate();
        let h = harness(ConnectionMode::Online);
        h.store
            .set_conversations(vec![direct(Some(peer.public_key_b64()))]);

        h.store
            .send(&conv(), "data:image/png;base64,AAAA", MessageKind::Image, None)
            .await
            .unwrap();

        assert_eq!(h.records.created()[0].content, "data:image/png;base64,AAAA");
    }

    #[tokio::test]
    async fn test_transport_failure_marks_failed() {
        let h = harness(ConnectionMode::Online);
        h.records.fail.store(true, Ordering::SeqCst);

        let outcome = h
            .store
            .send(&conv(), "hi", MessageKind::Text, None)
            .await
            .unwrap();
        let SendOutcome::Failed(temp_id) = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(
            h.store.find(&conv(), &temp_id).unwrap().status,
            MessageStatus::Failed
        );

        h.records.fail.store(false, Ordering::SeqCst);
        let retry = h.store.resend_failed(&conv(), &temp_id).await.unwrap();
        assert!(matches!(retry, SendOutcome::Sent(_)));
        assert!(h.store.find(&conv(), &temp_id).is_none());
        assert_eq!(h.store.visible_messages(&conv()).len(), 1);
    }

    #[tokio::test]
    async fn test_offline_send_is_queued() {
        let h = harness(ConnectionMode::Offline);

        let outcome = h
            .store
            .send(&conv(), "later", MessageKind::Text, None)
            .await
            .unwrap();
        let SendOutcome::Queued(temp_id) = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert!(h.store.queue.contains(&temp_id));
        assert!(h.records.created().is_empty());
        assert_eq!(
            h.store.find(&conv(), &temp_id).unwrap().status,
            MessageStatus::Queued
        );

        h.mode.send_replace(ConnectionMode::Online);
        let report = h.store.queue.drain(&h.store).await;
        assert_eq!(report.sent, 1);
        let messages = h.store.visible_messages(&conv());
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status, MessageStatus::Sent);
        assert!(!messages[0].id.is_temporary());
    }

    #[tokio::test]
    async fn test_duplicate_receive_ignored() {
        let mut h = harness(ConnectionMode::Online);
        h.store.set_conversations(vec![direct(None)]);

        assert!(h.store.receive(incoming("42", "2", "hi")).await);
        assert!(!h.store.receive(incoming("42", "2", "hi")).await);

        assert_eq!(h.store.visible_messages(&conv()).len(), 1);
        assert_eq!(h.store.unread_count(&conv()), 1);
        let acks = h
            .published()
            .into_iter()
            .filter(|e| matches!(e, OutboundEvent::AckDelivery(_)))
            .count();
        assert_eq!(acks, 1);
    }

    #[tokio::test]
    async fn test_undecryptable_shows_sentinel() {
        let h = harness(ConnectionMode::Online);
        h.store.set_conversations(vec![direct(None)]);

        let wire = incoming("7", "2", "ENC:AAAA:BBBB");
        let timestamp = wire.timestamp;
        h.store.receive(wire).await;

        let m = h.store.find(&conv(), &MessageId::new("7")).unwrap();
        assert_eq!(m.content, DECRYPTION_FAILED_SENTINEL);
        assert_eq!(m.timestamp, timestamp);
        assert!(m.is_encrypted);
    }

    #[tokio::test]
    async fn test_read_receipt_only_advances_confirmed_own_messages() {
        let h = harness(ConnectionMode::Online);
        h.store.set_conversations(vec![direct(None)]);
        h.store.receive(incoming("5", "2", "theirs")).await;
        let SendOutcome::Sent(sent) = h
            .store
            .send(&conv(), "mine", MessageKind::Text, None)
            .await
            .unwrap()
        else {
            panic!("send failed");
        };
        h.mode.send_replace(ConnectionMode::Offline);
        let SendOutcome::Queued(queued) = h
            .store
            .send(&conv(), "pending", MessageKind::Text, None)
            .await
            .unwrap()
        else {
            panic!("send not queued");
        };

        // A receipt from ourselves (another device) is ignored.
        h.store
            .apply(InboundEvent::MessagesRead(ReadReceipt {
                conversation_id: conv(),
                user_id: UserId::new("1"),
            }))
            .await;
        assert_eq!(h.store.find(&conv(), &sent).unwrap().status, MessageStatus::Sent);

        h.store
            .apply(InboundEvent::MessagesRead(ReadReceipt {
                conversation_id: conv(),
                user_id: UserId::new("2"),
            }))
            .await;
        assert_eq!(h.store.find(&conv(), &sent).unwrap().status, MessageStatus::Read);
        assert_eq!(
            h.store.find(&conv(), &queued).unwrap().status,
            MessageStatus::Queued
        );
        assert_eq!(
            h.store.find(&conv(), &MessageId::new("5")).unwrap().status,
            MessageStatus::Sent
        );

        // Delivered after read does not move it backwards.
        h.store
            .apply(InboundEvent::MessageDelivered(DeliveryAck {
                conversation_id: conv(),
                message_id: sent.clone(),
                user_id: UserId::new("2"),
            }))
            .await;
        assert_eq!(h.store.find(&conv(), &sent).unwrap().status, MessageStatus::Read);
    }

    #[tokio::test]
    async fn test_expired_messages_hidden_and_evicted() {
        let h = harness(ConnectionMode::Online);
        h.store.set_conversations(vec![direct(None)]);
        let mut wire = incoming("9", "2", "soon gone");
        wire.expires_at = Some(Utc::now() + Duration::seconds(10));
        h.store.receive(wire).await;
        assert_eq!(h.store.unread_count(&conv()), 1);

        let later = Utc::now() + Duration::seconds(11);
        assert!(h.store.visible_messages_at(&conv(), later).is_empty());

        assert_eq!(h.store.evict_expired(later), 1);
        assert!(h.store.visible_messages(&conv()).is_empty());
        assert_eq!(h.store.unread_count(&conv()), 0);
        // A late duplicate of an evicted message does not come back.
        assert!(!h.store.receive(incoming("9", "2", "soon gone")).await);
    }

    #[tokio::test]
    async fn test_already_expired_message_dropped_on_receive() {
        let h = harness(ConnectionMode::Online);
        let mut wire = incoming("3", "2", "stale");
        wire.expires_at = Some(Utc::now() - Duration::seconds(1));

        assert!(!h.store.receive(wire).await);
        assert!(h.store.visible_messages(&conv()).is_empty());
    }

    #[tokio::test]
    async fn test_open_conversation_merges_history() {
        let h = harness(ConnectionMode::Online);
        h.store.set_conversations(vec![direct(None)]);
        h.store.receive(incoming("2", "2", "second")).await;
        h.mode.send_replace(ConnectionMode::Offline);
        h.store
            .send(&conv(), "pending", MessageKind::Text, None)
            .await
            .unwrap();

        let mut read = incoming("2", "2", "second");
        read.status = MessageStatus::Read;
        read.reactions = HashMap::from([(UserId::new("1"), "👍".to_string())]);
        *h.records.history.lock().unwrap() = vec![incoming("1", "2", "first"), read];

        let messages = h.store.open_conversation(&conv()).await.unwrap();
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["first", "second", "pending"]);
        assert_eq!(messages[1].status, MessageStatus::Read);
        assert_eq!(messages[1].reactions.len(), 1);
        assert_eq!(h.store.unread_count(&conv()), 0);
        assert_eq!(h.store.active_conversation(), Some(conv()));
    }

    #[tokio::test]
    async fn test_active_conversation_sends_read_receipt() {
        let mut h = harness(ConnectionMode::Online);
        h.store.set_conversations(vec![direct(None)]);
        h.store.open_conversation(&conv()).await.unwrap();
        h.published();

        h.store.receive(incoming("8", "2", "hi")).await;
        let events = h.published();
        assert!(matches!(events[0], OutboundEvent::AckDelivery(_)));
        assert!(matches!(events[1], OutboundEvent::MarkRead(_)));
        assert_eq!(h.store.unread_count(&conv()), 0);
    }

    #[tokio::test]
    async fn test_reaction_toggle_and_sync() {
        let h = harness(ConnectionMode::Online);
        h.store.receive(incoming("4", "2", "hi")).await;
        let id = MessageId::new("4");

        h.store.react(&conv(), &id, "🔥").await.unwrap();
        let m = h.store.find(&conv(), &id).unwrap();
        assert_eq!(m.reactions.get(&UserId::new("1")).map(String::as_str), Some("🔥"));

        assert!(matches!(
            h.store.react(&conv(), &MessageId::new("nope"), "🔥").await,
            Err(ClientError::UnknownMessage(_))
        ));
    }

    #[tokio::test]
    async fn test_translate_requires_text_service() {
        let h = harness(ConnectionMode::Online);
        h.store.receive(incoming("4", "2", "hola")).await;
        assert!(matches!(
            h.store.translate(&conv(), &MessageId::new("4")).await,
            Err(ClientError::TextService(_))
        ));
    }

    #[tokio::test]
    async fn test_presence_updates_participants() {
        let h = harness(ConnectionMode::Online);
        h.store.set_conversations(vec![direct(None)]);
        let seen = Utc::now();

        h.store
            .apply(InboundEvent::UserStatus(PresenceUpdate {
                user_id: UserId::new("2"),
                is_online: false,
                last_seen: Some(seen),
            }))
            .await;

        let peer = h.store.conversation(&conv()).unwrap().participants[1].clone();
        assert!(!peer.is_online);
        assert_eq!(peer.last_seen, Some(seen));
        assert_eq!(h.store.presence(&UserId::new("2")).unwrap().last_seen, Some(seen));
    }

    #[test]
    fn test_zero_ttl_never_expires() {
        assert!(expires_in(std::time::Duration::ZERO).is_none());
        assert!(expires_in(std::time::Duration::from_secs(10)).unwrap() > Utc::now());
    }
}
