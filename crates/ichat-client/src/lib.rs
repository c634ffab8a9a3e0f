//! # ichat-client
//!
//! Headless client core for ichat: the identity key and shared-key cache,
//! per-conversation message timelines with their send and receive pipelines,
//! the durable offline queue and expiry of ephemeral messages.
//!
//! [`Client::start`] wires those parts to a record store and the realtime
//! channel. UI layers observe changes through [`MessageStore::subscribe`].

pub mod assist;
pub mod config;
pub mod error;
pub mod events;
pub mod expiry;
pub mod keys;
pub mod messages;
pub mod offline;
pub mod recording;
pub mod records;
pub mod sync_bridge;

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use ichat_net::{join_user, spawn_channel, ChannelCommand, ChannelConfig};
use ichat_shared::ConnectionMode;
use ichat_store::Database;

pub use assist::TextService;
pub use config::ClientConfig;
pub use error::{ClientError, RecordStoreError};
pub use events::StoreEvent;
pub use expiry::ExpiryMonitor;
pub use keys::KeyManager;
pub use messages::{expires_in, MessageStore, MessageStoreParts, SendOutcome};
pub use offline::{DrainReport, OfflineQueue, ReplayOutcome, ReplaySink};
pub use recording::{AudioCapture, RecordingSession};
pub use records::{HttpRecordStore, RecordStore};

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the default
/// filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("ichat_client=debug,ichat_net=debug,ichat_store=info,warn")
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}

/// A running client.
pub struct Client {
    store: Arc<MessageStore>,
    queue: Arc<OfflineQueue>,
    keys: Arc<KeyManager>,
    channel: mpsc::Sender<ChannelCommand>,
    bridge: JoinHandle<()>,
    expiry: ExpiryMonitor,
}

impl Client {
    /// Start against the HTTP record store named in `config`.
    pub async fn connect(
        config: ClientConfig,
        text: Option<Arc<dyn TextService>>,
    ) -> Result<Self, ClientError> {
        let records = Arc::new(HttpRecordStore::new(
            config.api_url.clone(),
            config.auth_token.clone(),
        ));
        Self::start(config, records, text).await
    }

    pub async fn start(
        config: ClientConfig,
        records: Arc<dyn RecordStore>,
        text: Option<Arc<dyn TextService>>,
    ) -> Result<Self, ClientError> {
        info!(user = %config.user_id, "Starting ichat client");

        let db = match &config.data_dir {
            Some(dir) => Database::open_in(dir)?,
            None => Database::new()?,
        };

        let (keys, generated) = KeyManager::load_or_generate(&db, &config.user_id)?;
        let keys = Arc::new(keys);
        if generated {
            if let Err(e) = records.update_public_key(&keys.public_key_b64()).await {
                warn!(error = %e, "Failed to publish new public key");
            }
        }

        let db = Arc::new(Mutex::new(db));
        let queue = Arc::new(OfflineQueue::load(db)?);

        let (channel, notif_rx) = spawn_channel(ChannelConfig {
            url: config.ws_url.clone(),
            reconnect_delay: config.reconnect_delay,
            ..ChannelConfig::default()
        })
        .map_err(|e| ClientError::Realtime(e.to_string()))?;

        let (mode_tx, mode_rx) = watch::channel(ConnectionMode::Offline);
        let store = Arc::new(MessageStore::new(MessageStoreParts {
            local_user: config.user_id.clone(),
            assistant_id: config.assistant_id.clone(),
            language: config.language.clone(),
            keys: keys.clone(),
            records,
            text,
            queue: queue.clone(),
            channel: channel.clone(),
            connectivity: mode_rx,
        }));

        join_user(&channel, &config.user_id)
            .await
            .map_err(|_| ClientError::ChannelClosed)?;

        match store.refresh_conversations().await {
            Ok(count) => info!(count, "Loaded conversations"),
            Err(e) => warn!(error = %e, "Failed to load conversations"),
        }
        store.restore_queued(&queue.entries());

        let bridge = sync_bridge::spawn_bridge(store.clone(), queue.clone(), mode_tx, notif_rx);
        let expiry = ExpiryMonitor::spawn(store.clone(), config.expiry_tick);

        Ok(Self {
            store,
            queue,
            keys,
            channel,
            bridge,
            expiry,
        })
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    pub fn public_key(&self) -> String {
        self.keys.public_key_b64()
    }

    /// Close the realtime channel and stop background work.
    pub async fn shutdown(self) {
        let _ = self.channel.send(ChannelCommand::Shutdown).await;
        self.expiry.stop();
        self.bridge.abort();
        info!("ichat client stopped");
    }
}
