use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Invalid peer public key")]
    InvalidPublicKey,

    #[error("Malformed encrypted payload")]
    MalformedPayload,
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Invalid key bytes: expected 32 bytes, got {0}")]
    InvalidKeyBytes(usize),
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed event: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Event `{event}` is missing required field `{field}`")]
    MissingField {
        event: &'static str,
        field: &'static str,
    },
}
