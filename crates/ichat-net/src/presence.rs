//! Presence tracking.
//!
//! Keeps the latest `user_status` seen for every user: whether they are
//! online and, once they have gone offline, when they were last seen.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use ichat_shared::protocol::PresenceUpdate;
use ichat_shared::UserId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceInfo {
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
    users: HashMap<UserId, PresenceInfo>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a presence update. A missing `last_seen` keeps the previously
    /// known value.
    pub fn apply(&mut self, update: &PresenceUpdate) {
        let entry = self
            .users
            .entry(update.user_id.clone())
            .or_insert(PresenceInfo {
                is_online: false,
                last_seen: None,
            });

        entry.is_online = update.is_online;
        if update.last_seen.is_some() {
            entry.last_seen = update.last_seen;
        }

        debug!(
            user = %update.user_id,
            online = update.is_online,
            "presence updated"
        );
    }

    pub fn get(&self, user: &UserId) -> Option<&PresenceInfo> {
        self.users.get(user)
    }

    pub fn is_online(&self, user: &UserId) -> bool {
        self.users.get(user).is_some_and(|p| p.is_online)
    }

    pub fn last_seen(&self, user: &UserId) -> Option<DateTime<Utc>> {
        self.users.get(user).and_then(|p| p.last_seen)
    }

    pub fn online_count(&self) -> usize {
        self.users.values().filter(|p| p.is_online).count()
    }
}
