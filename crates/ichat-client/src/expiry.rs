//! Background eviction of expired messages.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::messages::MessageStore;

/// Periodically evicts expired messages from a [`MessageStore`]. Stops when
/// dropped.
pub struct ExpiryMonitor {
    handle: JoinHandle<()>,
}

impl ExpiryMonitor {
    pub fn spawn(store: Arc<MessageStore>, tick: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let removed = store.evict_expired(Utc::now());
                if removed > 0 {
                    debug!(removed, "expiry tick");
                }
            }
        });
        Self { handle }
    }

    pub fn stop(&self) {
        self.handle.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for ExpiryMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
