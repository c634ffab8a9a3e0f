//! Durable FIFO of messages accepted while offline.
//!
//! The in-memory list mirrors the `offline_queue` table; every mutation is
//! written through before it is applied in memory. Entries leave the queue
//! only after the record store confirmed them, or once they have expired.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use ichat_shared::MessageId;
use ichat_store::{Database, QueuedMessage};

use crate::error::ClientError;

/// Result of replaying one queued entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// Confirmed by the record store.
    Sent,
    /// Not attempted (offline, or a send for this temp id is in flight).
    Deferred,
    /// Attempted and rejected; stays queued for the next drain.
    Failed,
    /// Past its expiry; dropped without sending.
    Expired,
}

/// Where queued entries are replayed to.
#[async_trait]
pub trait ReplaySink: Send + Sync {
    async fn replay(&self, entry: &QueuedMessage) -> ReplayOutcome;

    fn is_online(&self) -> bool;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub sent: usize,
    pub failed: usize,
    pub deferred: usize,
    pub expired: usize,
    pub remaining: usize,
    /// Connectivity was lost before every entry was attempted.
    pub interrupted: bool,
    /// Another drain was already running; nothing was attempted.
    pub skipped: bool,
}

pub struct OfflineQueue {
    db: Arc<Mutex<Database>>,
    entries: Mutex<Vec<QueuedMessage>>,
    draining: AtomicBool,
}

impl OfflineQueue {
    /// Reload persisted entries in enqueue order.
    pub fn load(db: Arc<Mutex<Database>>) -> Result<Self, ClientError> {
        let entries = lock(&db).list_queued_messages()?;
        if !entries.is_empty() {
            info!(count = entries.len(), "restored offline queue");
        }
        Ok(Self {
            db,
            entries: Mutex::new(entries),
            draining: AtomicBool::new(false),
        })
    }

    /// Append an entry. Re-enqueueing a temp id keeps its original position.
    pub fn enqueue(&self, entry: QueuedMessage) -> Result<(), ClientError> {
        lock(&self.db).enqueue_message(&entry)?;

        let mut entries = lock(&self.entries);
        if !entries.iter().any(|e| e.temp_id == entry.temp_id) {
            debug!(temp_id = %entry.temp_id, conversation = %entry.conversation_id, "queued offline message");
            entries.push(entry);
        }
        Ok(())
    }

    pub fn remove(&self, temp_id: &MessageId) -> Result<bool, ClientError> {
        lock(&self.db).dequeue_message(temp_id)?;

        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|e| &e.temp_id != temp_id);
        Ok(entries.len() < before)
    }

    pub fn entries(&self) -> Vec<QueuedMessage> {
        lock(&self.entries).clone()
    }

    pub fn contains(&self, temp_id: &MessageId) -> bool {
        lock(&self.entries).iter().any(|e| &e.temp_id == temp_id)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// Replay every entry through `sink`, one at a time, in enqueue order.
    ///
    /// A failed entry stays at its position and later entries are still
    /// attempted. Losing connectivity stops the drain. At most one drain runs
    /// at a time; a concurrent call returns immediately with `skipped` set.
    pub async fn drain(&self, sink: &dyn ReplaySink) -> DrainReport {
        let mut report = DrainReport::default();

        if self.draining.swap(true, Ordering::AcqRel) {
            debug!("drain already in progress");
            report.skipped = true;
            report.remaining = self.len();
            return report;
        }
        let _guard = DrainGuard(&self.draining);

        let snapshot = self.entries();
        if !snapshot.is_empty() {
            info!(count = snapshot.len(), "draining offline queue");
        }

        for entry in &snapshot {
            if !sink.is_online() {
                report.interrupted = true;
                break;
            }

            let outcome = if entry.expires_at.is_some_and(|at| at <= Utc::now()) {
                ReplayOutcome::Expired
            } else {
                sink.replay(entry).await
            };

            match outcome {
                ReplayOutcome::Sent => report.sent += 1,
                ReplayOutcome::Expired => report.expired += 1,
                ReplayOutcome::Failed => report.failed += 1,
                ReplayOutcome::Deferred => report.deferred += 1,
            }

            if matches!(outcome, ReplayOutcome::Sent | ReplayOutcome::Expired) {
                if let Err(e) = self.remove(&entry.temp_id) {
                    warn!(temp_id = %entry.temp_id, error = %e, "failed to dequeue replayed message");
                }
            }
        }

        report.remaining = self.len();
        info!(
            sent = report.sent,
            failed = report.failed,
            expired = report.expired,
            remaining = report.remaining,
            interrupted = report.interrupted,
            "offline queue drain finished"
        );
        report
    }
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
