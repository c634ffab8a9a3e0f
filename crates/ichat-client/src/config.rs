//! Client configuration loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use ichat_shared::constants::{DEFAULT_ASSISTANT_ID, DEFAULT_HTTP_PORT, EXPIRY_TICK_MS};
use ichat_shared::UserId;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Record store base URL.
    /// Env: `ICHAT_API_URL`
    pub api_url: String,

    /// Realtime channel endpoint.
    /// Env: `ICHAT_WS_URL`
    pub ws_url: String,

    /// Session token sent as `x-auth-token`.
    /// Env: `ICHAT_AUTH_TOKEN`
    pub auth_token: Option<String>,

    /// The signed-in user.
    /// Env: `ICHAT_USER_ID`
    pub user_id: UserId,

    /// Directory holding `ichat.db`. `None` uses the platform data directory.
    /// Env: `ICHAT_DATA_DIR`
    pub data_dir: Option<PathBuf>,

    /// Env: `ICHAT_EXPIRY_TICK_MS`
    pub expiry_tick: Duration,

    /// User id of the assistant account.
    /// Env: `ICHAT_ASSISTANT_ID`
    pub assistant_id: UserId,

    /// Target language for translations.
    /// Env: `ICHAT_LANGUAGE`
    pub language: String,

    /// Env: `ICHAT_RECONNECT_MS`
    pub reconnect_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: format!("http://127.0.0.1:{DEFAULT_HTTP_PORT}/api"),
            ws_url: format!("ws://127.0.0.1:{DEFAULT_HTTP_PORT}/ws"),
            auth_token: None,
            user_id: UserId::new(""),
            data_dir: None,
            expiry_tick: Duration::from_millis(EXPIRY_TICK_MS),
            assistant_id: UserId::new(DEFAULT_ASSISTANT_ID),
            language: "English".to_string(),
            reconnect_delay: Duration::from_millis(2_000),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("ICHAT_API_URL") {
            config.api_url = url.trim_end_matches('/').to_string();
        }

        if let Some(url) = lookup("ICHAT_WS_URL") {
            config.ws_url = url;
        }

        if let Some(token) = lookup("ICHAT_AUTH_TOKEN") {
            if !token.is_empty() {
                config.auth_token = Some(token);
            }
        }

        if let Some(id) = lookup("ICHAT_USER_ID") {
            config.user_id = UserId::new(id);
        }

        if let Some(dir) = lookup("ICHAT_DATA_DIR") {
            config.data_dir = Some(PathBuf::from(dir));
        }

        if let Some(val) = lookup("ICHAT_EXPIRY_TICK_MS") {
            match val.parse::<u64>() {
                Ok(ms) if ms > 0 => config.expiry_tick = Duration::from_millis(ms),
                _ => tracing::warn!(value = %val, "Invalid ICHAT_EXPIRY_TICK_MS, using default"),
            }
        }

        if let Some(id) = lookup("ICHAT_ASSISTANT_ID") {
            config.assistant_id = UserId::new(id);
        }

        if let Some(lang) = lookup("ICHAT_LANGUAGE") {
            config.language = lang;
        }

        if let Some(val) = lookup("ICHAT_RECONNECT_MS") {
            match val.parse::<u64>() {
                Ok(ms) => config.reconnect_delay = Duration::from_millis(ms),
                Err(_) => tracing::warn!(value = %val, "Invalid ICHAT_RECONNECT_MS, using default"),
            }
        }

        config
    }
}
