//! # ichat-server
//!
//! Realtime relay hub for ichat clients.
//!
//! This binary provides:
//! - a **WebSocket endpoint** (`/ws`) speaking the ichat realtime event
//!   protocol, with per-user and per-conversation rooms
//! - **presence**: users are announced online on `join_user` and offline,
//!   with a last-seen time, when their last connection drops
//! - `/health` and `/info` endpoints
//! - **per-IP rate limiting** of WebSocket upgrades
//!
//! Message payloads are relayed untouched; the hub never decrypts anything.

mod api;
mod config;
mod error;
mod hub;
mod rate_limit;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::hub::Hub;
use crate::rate_limit::RateLimiter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ichat_server=debug")),
        )
        .init();

    info!("Starting ichat relay v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    let rate_limiter = RateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst);
    let http_addr = config.http_addr;
    let state = AppState {
        hub: Hub::new(),
        rate_limiter: rate_limiter.clone(),
        config: Arc::new(config),
    };

    // Evict buckets idle for more than ten minutes.
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            rate_limiter.purge_idle(Duration::from_secs(600)).await;
        }
    });

    tokio::select! {
        result = api::serve(state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
