//! Server configuration loaded from environment variables.
//!
//! Every setting has a default so the hub starts with zero configuration for
//! local development.

use std::net::SocketAddr;

use ichat_shared::constants::DEFAULT_HTTP_PORT;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP and WebSocket listener.
    /// Env: `HTTP_ADDR`
    pub http_addr: SocketAddr,

    /// Human-readable name reported by `/info`.
    /// Env: `INSTANCE_NAME`
    pub instance_name: String,

    /// Maximum number of concurrent realtime connections (0 = unlimited).
    /// Env: `MAX_CONNECTIONS`
    pub max_connections: usize,

    /// Sustained WebSocket upgrades per second per client IP.
    /// Env: `RATE_LIMIT_PER_SEC`
    pub rate_limit_per_sec: f64,

    /// Upgrade burst allowed per client IP.
    /// Env: `RATE_LIMIT_BURST`
    pub rate_limit_burst: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            instance_name: "ichat relay".to_string(),
            max_connections: 0,
            rate_limit_per_sec: 10.0,
            rate_limit_burst: 30.0,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default"),
            }
        }

        if let Some(name) = lookup("INSTANCE_NAME") {
            config.instance_name = name;
        }

        if let Some(val) = lookup("MAX_CONNECTIONS") {
            match val.parse::<usize>() {
                Ok(n) => config.max_connections = n,
                Err(_) => tracing::warn!(value = %val, "Invalid MAX_CONNECTIONS, using default"),
            }
        }

        for (key, slot) in [
            ("RATE_LIMIT_PER_SEC", &mut config.rate_limit_per_sec),
            ("RATE_LIMIT_BURST", &mut config.rate_limit_burst),
        ] {
            if let Some(val) = lookup(key) {
                match val.parse::<f64>() {
                    Ok(n) if n > 0.0 => *slot = n,
                    _ => tracing::warn!(key, value = %val, "Invalid rate limit, using default"),
                }
            }
        }

        config
    }
}
