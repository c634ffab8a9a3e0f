use chrono::Utc;
use ichat_shared::UserId;
use rusqlite::{params, OptionalExtension};

use crate::database::{conversion_error, parse_timestamp, Database};
use crate::error::Result;
use crate::models::StoredIdentity;

impl Database {
    /// Replace the stored identity with `identity`.
    pub fn save_identity(&self, identity: &StoredIdentity) -> Result<()> {
        self.conn().execute(
            "INSERT INTO local_identity (id, user_id, secret_key, public_key, created_at)
             VALUES (1, ?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                user_id = excluded.user_id,
                secret_key = excluded.secret_key,
                public_key = excluded.public_key,
                created_at = excluded.created_at",
            params![
                identity.user_id.as_str(),
                hex::encode(identity.secret_key),
                identity.public_key,
                identity.created_at.to_rfc3339(),
            ],
        )?;
        tracing::debug!(user = %identity.user_id, "identity saved");
        Ok(())
    }

    /// The stored identity, if one exists for `user`.
    ///
    /// An identity stored for a different user is ignored: it cannot decrypt
    /// anything addressed to `user`.
    pub fn load_identity(&self, user: &UserId) -> Result<Option<StoredIdentity>> {
        let identity = self
            .conn()
            .query_row(
                "SELECT user_id, secret_key, public_key, created_at
                 FROM local_identity WHERE id = 1",
                [],
                row_to_identity,
            )
            .optional()?;

        Ok(identity.filter(|id| &id.user_id == user))
    }

    pub fn clear_identity(&self) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM local_identity WHERE id = 1", [])?;
        Ok(affected > 0)
    }
}

impl StoredIdentity {
    /// A fresh record stamped with the current time.
    pub fn new(user_id: UserId, secret_key: [u8; 32], public_key: String) -> Self {
        Self {
            user_id,
            secret_key,
            public_key,
            created_at: Utc::now(),
        }
    }
}

fn row_to_identity(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredIdentity> {
    let user_id: String = row.get(0)?;
    let secret_hex: String = row.get(1)?;
    let public_key: String = row.get(2)?;
    let created_at: String = row.get(3)?;

    let mut secret_key = [0u8; 32];
    hex::decode_to_slice(&secret_hex, &mut secret_key).map_err(|e| conversion_error(1, e))?;

    Ok(StoredIdentity {
        user_id: UserId::new(user_id),
        secret_key,
        public_key,
        created_at: parse_timestamp(3, &created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn save_and_load_identity() {
        let (_dir, db) = open();
        let user = UserId::new("7");
        assert!(db.load_identity(&user).unwrap().is_none());

        let stored = StoredIdentity::new(user.clone(), [9u8; 32], "cHVi".into());
        db.save_identity(&stored).unwrap();

        let loaded = db.load_identity(&user).unwrap().unwrap();
        assert_eq!(loaded.secret_key, [9u8; 32]);
        assert_eq!(loaded.public_key, "cHVi");
    }

    #[test]
    fn save_replaces_previous_identity() {
        let (_dir, db) = open();
        let user = UserId::new("7");
        db.save_identity(&StoredIdentity::new(user.clone(), [1u8; 32], "a".into()))
            .unwrap();
        db.save_identity(&StoredIdentity::new(user.clone(), [2u8; 32], "b".into()))
            .unwrap();

        let loaded = db.load_identity(&user).unwrap().unwrap();
        assert_eq!(loaded.secret_key, [2u8; 32]);
    }

    #[test]
    fn identity_of_other_user_is_ignored() {
        let (_dir, db) = open();
        db.save_identity(&StoredIdentity::new(UserId::new("1"), [1u8; 32], "a".into()))
            .unwrap();
        assert!(db.load_identity(&UserId::new("2")).unwrap().is_none());
    }

    #[test]
    fn clear_identity_removes_row() {
        let (_dir, db) = open();
        let user = UserId::new("1");
        db.save_identity(&StoredIdentity::new(user.clone(), [1u8; 32], "a".into()))
            .unwrap();
        assert!(db.clear_identity().unwrap());
        assert!(!db.clear_identity().unwrap());
        assert!(db.load_identity(&user).unwrap().is_none());
    }
}
