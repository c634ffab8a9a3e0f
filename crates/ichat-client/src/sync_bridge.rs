use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ichat_net::ChannelNotification;
use ichat_shared::ConnectionMode;

use crate::messages::MessageStore;
use crate::offline::OfflineQueue;

/// Spawn the loop that feeds channel notifications into the message store.
///
/// Connectivity changes are published on `connectivity`; every transition
/// from offline to online starts one drain of the offline queue.
pub fn spawn_bridge(
    store: Arc<MessageStore>,
    queue: Arc<OfflineQueue>,
    connectivity: watch::Sender<ConnectionMode>,
    notif_rx: mpsc::Receiver<ChannelNotification>,
) -> JoinHandle<()> {
    tokio::spawn(notification_loop(store, queue, connectivity, notif_rx))
}

async fn notification_loop(
    store: Arc<MessageStore>,
    queue: Arc<OfflineQueue>,
    connectivity: watch::Sender<ConnectionMode>,
    mut notif_rx: mpsc::Receiver<ChannelNotification>,
) {
    info!("Channel notification bridge started");

    while let Some(notification) = notif_rx.recv().await {
        match notification {
            ChannelNotification::Connected => {
                let previous = connectivity.send_replace(ConnectionMode::Online);
                if previous.is_online() {
                    continue;
                }
                info!(queued = queue.len(), "Back online");
                let (store, queue) = (store.clone(), queue.clone());
                tokio::spawn(async move {
                    let report = queue.drain(store.as_ref()).await;
                    debug!(?report, "Reconnect drain done");
                });
            }

            ChannelNotification::Disconnected => {
                if connectivity
                    .send_replace(ConnectionMode::Offline)
                    .is_online()
                {
                    info!("Gone offline");
                }
            }

            ChannelNotification::Event(event) => {
                debug!(event = event.name(), "Event received on bridge");
                store.apply(event).await;
            }
        }
    }

    connectivity.send_replace(ConnectionMode::Offline);
    warn!("Channel notification loop ended");
}
