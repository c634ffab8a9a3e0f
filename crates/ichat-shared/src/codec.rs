//! Wire encoding of encrypted message bodies.
//!
//! An encrypted body travels as the three-part string
//! `ENC:<nonce base64>:<ciphertext base64>`. Anything without the `ENC:`
//! prefix is plaintext (legacy, unencrypted or non-text content) and passes
//! through decryption untouched.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::constants::{DECRYPTION_FAILED_SENTINEL, ENCRYPTED_TAG};
use crate::crypto::{self, SymmetricKey};
use crate::error::CryptoError;

/// Whether a wire payload carries the encryption tag.
pub fn is_encrypted(wire: &str) -> bool {
    wire.strip_prefix(ENCRYPTED_TAG)
        .is_some_and(|rest| rest.starts_with(':'))
}

/// Encrypt `plaintext` into a tagged wire string under a fresh nonce.
pub fn encrypt(plaintext: &str, key: &SymmetricKey) -> Result<String, CryptoError> {
    let (nonce, ciphertext) = crypto::seal(key, plaintext.as_bytes())?;
    Ok(format!(
        "{ENCRYPTED_TAG}:{}:{}",
        STANDARD.encode(nonce),
        STANDARD.encode(ciphertext)
    ))
}

/// Decrypt a wire payload, reporting failures.
///
/// Untagged input is returned unchanged.
pub fn try_decrypt(wire: &str, key: &SymmetricKey) -> Result<String, CryptoError> {
    if !is_encrypted(wire) {
        return Ok(wire.to_string());
    }

    let mut parts = wire.splitn(3, ':').skip(1);
    let (Some(nonce_b64), Some(ciphertext_b64)) = (parts.next(), parts.next()) else {
        return Err(CryptoError::MalformedPayload);
    };

    let nonce = STANDARD
        .decode(nonce_b64)
        .map_err(|_| CryptoError::MalformedPayload)?;
    let ciphertext = STANDARD
        .decode(ciphertext_b64)
        .map_err(|_| CryptoError::MalformedPayload)?;

    let plaintext = crypto::open(key, &nonce, &ciphertext)?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptionFailed)
}

/// Decrypt a wire payload for display. Never fails: an undecryptable payload
/// yields [`DECRYPTION_FAILED_SENTINEL`].
pub fn decrypt(wire: &str, key: &SymmetricKey) -> String {
    try_decrypt(wire, key).unwrap_or_else(|_| DECRYPTION_FAILED_SENTINEL.to_string())
}
