/// Application name
pub const APP_NAME: &str = "ichat";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// X25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// X25519 secret key size in bytes
pub const SECRET_KEY_SIZE: usize = 32;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Tag prepended to every encrypted wire payload: `ENC:<nonce>:<ciphertext>`
pub const ENCRYPTED_TAG: &str = "ENC";

/// Shown in place of plaintext when a tagged payload cannot be decrypted
pub const DECRYPTION_FAILED_SENTINEL: &str = "🔒 Decryption Error";

/// Prefix of client-generated message ids awaiting server confirmation
pub const TEMP_ID_PREFIX: &str = "temp_";

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_CONVERSATION_KEY: &str = "ichat-conversation-key-v1";

/// Default realtime and record-store port
pub const DEFAULT_HTTP_PORT: u16 = 5000;

/// Granularity of the client-side expiry sweep in milliseconds
pub const EXPIRY_TICK_MS: u64 = 1_000;

/// User id of the built-in assistant account
pub const DEFAULT_ASSISTANT_ID: &str = "0";
