//! v001: local identity and the offline send queue.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- Exactly one row: the identity of the user signed in on this device.
CREATE TABLE IF NOT EXISTS local_identity (
    id          INTEGER PRIMARY KEY CHECK (id = 1),
    user_id     TEXT NOT NULL,
    secret_key  TEXT NOT NULL,                -- hex-encoded 32-byte X25519 secret
    public_key  TEXT NOT NULL,                -- base64, as published to peers
    created_at  TEXT NOT NULL                 -- RFC-3339
);

CREATE TABLE IF NOT EXISTS offline_queue (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
    temp_id         TEXT NOT NULL UNIQUE,
    conversation_id TEXT NOT NULL,
    content         TEXT NOT NULL,            -- plaintext, encrypted at replay
    kind            TEXT NOT NULL,
    expires_at      TEXT,
    enqueued_at     TEXT NOT NULL
);
"#;

pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
