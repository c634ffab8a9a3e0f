//! Persistence for the offline send queue.
//!
//! Entries are keyed by temp id and replayed in `seq` (enqueue) order.

use ichat_shared::{ConversationId, MessageId, MessageKind};
use rusqlite::params;

use crate::database::{conversion_error, parse_timestamp, Database};
use crate::error::{Result, StoreError};
use crate::models::QueuedMessage;

impl Database {
    /// Persist a queued message. Enqueueing an already-queued temp id is a
    /// no-op, so the entry keeps its original position.
    pub fn enqueue_message(&self, entry: &QueuedMessage) -> Result<bool> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO offline_queue
                (temp_id, conversation_id, content, kind, expires_at, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.temp_id.as_str(),
                entry.conversation_id.as_str(),
                entry.content,
                entry.kind.as_str(),
                entry.expires_at.map(|t| t.to_rfc3339()),
                entry.enqueued_at.to_rfc3339(),
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn dequeue_message(&self, temp_id: &MessageId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM offline_queue WHERE temp_id = ?1",
            params![temp_id.as_str()],
        )?;
        Ok(affected > 0)
    }

    pub fn list_queued_messages(&self) -> Result<Vec<QueuedMessage>> {
        let mut stmt = self.conn().prepare(
            "SELECT temp_id, conversation_id, content, kind, expires_at, enqueued_at
             FROM offline_queue
             ORDER BY seq ASC",
        )?;

        let rows = stmt.query_map([], row_to_queued)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn get_queued_message(&self, temp_id: &MessageId) -> Result<QueuedMessage> {
        self.conn()
            .query_row(
                "SELECT temp_id, conversation_id, content, kind, expires_at, enqueued_at
                 FROM offline_queue WHERE temp_id = ?1",
                params![temp_id.as_str()],
                row_to_queued,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }
}

fn row_to_queued(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueuedMessage> {
    let temp_id: String = row.get(0)?;
    let conversation_id: String = row.get(1)?;
    let content: String = row.get(2)?;
    let kind_str: String = row.get(3)?;
    let expires_at: Option<String> = row.get(4)?;
    let enqueued_at: String = row.get(5)?;

    let kind = MessageKind::parse(&kind_str).ok_or_else(|| {
        conversion_error(
            3,
            StoreError::InvalidRecord(format!("unknown message kind: {kind_str}")),
        )
    })?;

    Ok(QueuedMessage {
        temp_id: MessageId::new(temp_id),
        conversation_id: ConversationId::new(conversation_id),
        content,
        kind,
        expires_at: expires_at
            .as_deref()
            .map(|raw| parse_timestamp(4, raw))
            .transpose()?,
        enqueued_at: parse_timestamp(5, &enqueued_at)?,
    })
}
