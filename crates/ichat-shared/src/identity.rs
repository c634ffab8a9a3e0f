use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::constants::{PUBKEY_SIZE, SECRET_KEY_SIZE};
use crate::crypto::{derive_conversation_key, SymmetricKey};
use crate::error::{CryptoError, IdentityError};
use crate::types::ConversationId;

/// The local user's long-term X25519 key pair.
///
/// The secret half never leaves the device. The public half is published to
/// peers through the record store as standard base64 of the 32 raw bytes.
#[derive(Clone)]
pub struct IdentityKeyPair {
    secret: StaticSecret,
}

impl IdentityKeyPair {
    /// Generate a new random identity
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Restore identity from secret key bytes
    pub fn from_secret_bytes(secret: [u8; SECRET_KEY_SIZE]) -> Self {
        Self {
            secret: StaticSecret::from(secret),
        }
    }

    /// Restore identity from a secret of unchecked length (e.g. read from disk)
    pub fn from_secret_slice(secret: &[u8]) -> Result<Self, IdentityError> {
        let bytes: [u8; SECRET_KEY_SIZE] = secret
            .try_into()
            .map_err(|_| IdentityError::InvalidKeyBytes(secret.len()))?;
        Ok(Self::from_secret_bytes(bytes))
    }

    pub fn secret_bytes(&self) -> [u8; SECRET_KEY_SIZE] {
        self.secret.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; PUBKEY_SIZE] {
        PublicKey::from(&self.secret).to_bytes()
    }

    /// The public key blob as published to peers.
    pub fn public_key_b64(&self) -> String {
        STANDARD.encode(self.public_key_bytes())
    }

    /// Derive the symmetric key for one pairwise conversation.
    ///
    /// Both peers arrive at the same key: X25519 is symmetric and the
    /// conversation id is mixed into the KDF by both sides.
    pub fn shared_key(
        &self,
        peer_public_b64: &str,
        conversation_id: &ConversationId,
    ) -> Result<SymmetricKey, CryptoError> {
        let peer = decode_public_key(peer_public_b64)?;
        let shared = self.secret.diffie_hellman(&peer);
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidPublicKey);
        }
        Ok(derive_conversation_key(
            shared.as_bytes(),
            conversation_id.as_str().as_bytes(),
        ))
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public_key", &self.public_key_b64())
            .finish_non_exhaustive()
    }
}

fn decode_public_key(b64: &str) -> Result<PublicKey, CryptoError> {
    let bytes = STANDARD
        .decode(b64.trim())
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    let arr: [u8; PUBKEY_SIZE] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength)?;
    Ok(PublicKey::from(arr))
}
