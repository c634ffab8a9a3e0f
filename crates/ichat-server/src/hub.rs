//! Realtime relay hub: connections, rooms and presence.
//!
//! Each connection owns an outbox; the socket task drains it. Rooms are named
//! `user:<id>` and `chat:<id>`. Fan-out goes to every member of a room,
//! sender included. Payloads are relayed as-is and never inspected.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use ichat_shared::protocol::{InboundEvent, OutboundEvent, PresenceUpdate};
use ichat_shared::UserId;

pub type ConnectionId = u64;

const OUTBOX_CAPACITY: usize = 256;

struct Connection {
    outbox: mpsc::Sender<String>,
    user: Option<UserId>,
    rooms: HashSet<String>,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<ConnectionId, Connection>,
    rooms: HashMap<String, HashSet<ConnectionId>>,
    sessions: HashMap<UserId, HashSet<ConnectionId>>,
}

impl HubState {
    fn join(&mut self, conn: ConnectionId, room: String) {
        let Some(connection) = self.connections.get_mut(&conn) else {
            return;
        };
        if connection.rooms.insert(room.clone()) {
            self.rooms.entry(room).or_default().insert(conn);
        }
    }

    fn deliver(&self, conn: ConnectionId, frame: &str) {
        if let Some(connection) = self.connections.get(&conn) {
            if connection.outbox.try_send(frame.to_string()).is_err() {
                debug!(conn, "Dropping frame for slow connection");
            }
        }
    }

    fn to_room(&self, room: &str, frame: &str) -> usize {
        let Some(members) = self.rooms.get(room) else {
            return 0;
        };
        for &conn in members {
            self.deliver(conn, frame);
        }
        members.len()
    }

    fn to_everyone(&self, frame: &str) {
        for &conn in self.connections.keys() {
            self.deliver(conn, frame);
        }
    }
}

#[derive(Clone, Default)]
pub struct Hub {
    state: Arc<RwLock<HubState>>,
    next_id: Arc<AtomicU64>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Frames for it arrive on the returned receiver.
    pub async fn connect(&self) -> (ConnectionId, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (outbox, rx) = mpsc::channel(OUTBOX_CAPACITY);
        let mut state = self.state.write().await;
        state.connections.insert(
            id,
            Connection {
                outbox,
                user: None,
                rooms: HashSet::new(),
            },
        );
        debug!(conn = id, total = state.connections.len(), "Connection registered");
        (id, rx)
    }

    /// Apply one validated client event.
    pub async fn handle(&self, conn: ConnectionId, event: OutboundEvent) {
        let mut state = self.state.write().await;
        if !state.connections.contains_key(&conn) {
            return;
        }

        let relayed = match event {
            OutboundEvent::JoinUser(user) => {
                state.join(conn, user.room());
                if let Some(connection) = state.connections.get_mut(&conn) {
                    connection.user = Some(user.clone());
                }
                state.sessions.entry(user.clone()).or_default().insert(conn);
                info!(conn, user = %user, "User online");
                let status = InboundEvent::UserStatus(PresenceUpdate {
                    user_id: user,
                    is_online: true,
                    last_seen: None,
                });
                if let Some(frame) = encode(&status) {
                    state.to_everyone(&frame);
                }
                return;
            }
            OutboundEvent::JoinChat(chat) => {
                debug!(conn, chat = %chat, "Joined chat room");
                state.join(conn, chat.room());
                return;
            }
            OutboundEvent::SendMessage(message) => {
                (message.conversation_id.room(), InboundEvent::ReceiveMessage(message))
            }
            OutboundEvent::MarkRead(receipt) => {
                (receipt.conversation_id.room(), InboundEvent::MessagesRead(receipt))
            }
            OutboundEvent::AckDelivery(ack) => {
                (ack.conversation_id.room(), InboundEvent::MessageDelivered(ack))
            }
        };

        let (room, event) = relayed;
        if let Some(frame) = encode(&event) {
            let members = state.to_room(&room, &frame);
            debug!(conn, room = %room, event = event.name(), members, "Relayed event");
        }
    }

    /// Drop a connection. A user's last connection going away broadcasts
    /// them as offline with a last-seen time.
    pub async fn disconnect(&self, conn: ConnectionId) {
        let mut state = self.state.write().await;
        let Some(connection) = state.connections.remove(&conn) else {
            return;
        };

        for room in &connection.rooms {
            let now_empty = state.rooms.get_mut(room).is_some_and(|members| {
                members.remove(&conn);
                members.is_empty()
            });
            if now_empty {
                state.rooms.remove(room);
            }
        }

        let Some(user) = connection.user else {
            return;
        };
        let last = state.sessions.get_mut(&user).is_some_and(|sessions| {
            sessions.remove(&conn);
            sessions.is_empty()
        });
        if !last {
            return;
        }

        state.sessions.remove(&user);
        info!(conn, user = %user, "User offline");
        let status = InboundEvent::UserStatus(PresenceUpdate {
            user_id: user,
            is_online: false,
            last_seen: Some(Utc::now()),
        });
        if let Some(frame) = encode(&status) {
            state.to_everyone(&frame);
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    pub async fn online_users(&self) -> usize {
        self.state.read().await.sessions.len()
    }

    pub async fn room_size(&self, room: &str) -> usize {
        self.state
            .read()
            .await
            .rooms
            .get(room)
            .map_or(0, HashSet::len)
    }
}

fn encode(event: &InboundEvent) -> Option<String> {
    match event.to_json() {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!(event = event.name(), error = %e, "Failed to encode event");
            None
        }
    }
}
