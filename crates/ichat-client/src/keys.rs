//! Identity ownership and the per-conversation shared-key cache.
//!
//! Shared keys live only in memory for the lifetime of the process and are
//! dropped when their conversation is torn down. Derivation failures are not
//! errors: they mean "no key", and the caller sends in the clear.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use ichat_shared::crypto::SymmetricKey;
use ichat_shared::{Conversation, ConversationId, IdentityKeyPair, UserId};
use ichat_store::{Database, StoredIdentity};

use crate::error::ClientError;

pub type SharedKey = SymmetricKey;

pub struct KeyManager {
    identity: IdentityKeyPair,
    cache: Mutex<HashMap<ConversationId, SharedKey>>,
}

impl KeyManager {
    pub fn new(identity: IdentityKeyPair) -> Self {
        Self {
            identity,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// A manager around a freshly generated identity.
    pub fn generate() -> Self {
        Self::new(IdentityKeyPair::generate())
    }

    /// Load `user`'s identity from local storage, generating and persisting a
    /// new one if none is stored. The flag is `true` when a new identity was
    /// generated; its public key must then be published, and anything sent
    /// to the previous key can no longer be decrypted here.
    pub fn load_or_generate(db: &Database, user: &UserId) -> Result<(Self, bool), ClientError> {
        if let Some(stored) = db.load_identity(user)? {
            let identity = IdentityKeyPair::from_secret_bytes(stored.secret_key);
            debug!(user = %user, "loaded stored identity");
            return Ok((Self::new(identity), false));
        }

        let identity = IdentityKeyPair::generate();
        db.save_identity(&StoredIdentity::new(
            user.clone(),
            identity.secret_bytes(),
            identity.public_key_b64(),
        ))?;
        info!(user = %user, "no stored private key, generated a new identity");

        Ok((Self::new(identity), true))
    }

    pub fn public_key_b64(&self) -> String {
        self.identity.public_key_b64()
    }

    /// The shared key for `conversation`, deriving and caching it on first use.
    pub fn derive(
        &self,
        conversation: &ConversationId,
        peer_public_key: Option<&str>,
    ) -> Option<SharedKey> {
        if let Some(key) = self.cache().get(conversation) {
            return Some(*key);
        }

        let peer_public_key = peer_public_key?;
        match self.identity.shared_key(peer_public_key, conversation) {
            Ok(key) => {
                self.cache().insert(conversation.clone(), key);
                debug!(conversation = %conversation, "derived shared key");
                Some(key)
            }
            Err(e) => {
                debug!(conversation = %conversation, error = %e, "shared key unavailable");
                None
            }
        }
    }

    /// Derive for a known conversation. Only strictly two-party direct
    /// conversations whose peer has published a key get one.
    pub fn derive_for(&self, conversation: &Conversation, local: &UserId) -> Option<SharedKey> {
        let peer = conversation.peer_of(local)?;
        self.derive(&conversation.id, peer.public_key.as_deref())
    }

    pub fn forget(&self, conversation: &ConversationId) {
        if self.cache().remove(conversation).is_some() {
            debug!(conversation = %conversation, "dropped shared key");
        }
    }

    pub fn cached_count(&self) -> usize {
        self.cache().len()
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<ConversationId, SharedKey>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ichat_shared::{ConversationKind, Participant};

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

    fn direct(id: &str, peer_key: Option<String>) -> Conversation {
        Conversation {
            id: ConversationId::new(id),
            kind: ConversationKind::Direct,
            name: None,
            participants: vec![participant("me", None), participant("peer", peer_key)],
            is_request: false,
        }
    }

    #[test]
    fn test_derive_caches_per_conversation() {
        let me = KeyManager::generate();
        let peer = IdentityKeyPair::generate();
        let conv = direct("1", Some(peer.public_key_b64()));

        let k1 = me.derive_for(&conv, &UserId::new("me")).unwrap();
        assert_eq!(me.cached_count(), 1);
        // Cached: no peer key needed the second time.
        assert_eq!(me.derive(&conv.id, None), Some(k1));
        assert_eq!(
            k1,
            peer.shared_key(&me.public_key_b64(), &conv.id).unwrap()
        );
    }

    #[test]
    fn test_unavailable_without_peer_key() {
        let me = KeyManager::generate();
        let conv = direct("1", None);
        assert!(me.derive_for(&conv, &UserId::new("me")).is_none());
        assert_eq!(me.cached_count(), 0);
    }

    #[test]
    fn test_unavailable_for_groups() {
        let me = KeyManager::generate();
        let peer = IdentityKeyPair::generate();
        let mut conv = direct("1", Some(peer.public_key_b64()));
        conv.kind = ConversationKind::Group;
        assert!(me.derive_for(&conv, &UserId::new("me")).is_none());
    }

    #[test]
    fn test_invalid_peer_key_is_not_fatal() {
        let me = KeyManager::generate();
        assert!(me
            .derive(&ConversationId::new("1"), Some("garbage"))
            .is_none());
    }

    #[test]
    fn test_forget_drops_key() {
        let me = KeyManager::generate();
        let peer = IdentityKeyPair::generate();
        let conv = ConversationId::new("1");
        me.derive(&conv, Some(&peer.public_key_b64())).unwrap();
        me.forget(&conv);
        assert_eq!(me.cached_count(), 0);
        assert!(me.derive(&conv, None).is_none());
    }

    #[test]
    fn test_load_or_generate_persists_identity() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        let user = UserId::new("7");

        let (first, generated) = KeyManager::load_or_generate(&db, &user).unwrap();
        assert!(generated);

        let (second, generated) = KeyManager::load_or_generate(&db, &user).unwrap();
        assert!(!generated);
        assert_eq!(first.public_key_b64(), second.public_key_b64());

        db.clear_identity().unwrap();
        let (third, generated) = KeyManager::load_or_generate(&db, &user).unwrap();
        assert!(generated);
        assert_ne!(first.public_key_b64(), third.public_key_b64());
    }
}
