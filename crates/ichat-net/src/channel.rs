//! Realtime channel task with tokio mpsc command/notification channels.
//!
//! One background task owns the WebSocket connection to the relay hub.
//! It reconnects after a fixed delay whenever the connection drops and
//! re-subscribes to every room joined so far. Application code never touches
//! the socket: it sends [`ChannelCommand`]s and consumes
//! [`ChannelNotification`]s.

use std::time::Duration;

use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use ichat_shared::protocol::{InboundEvent, OutboundEvent};

use crate::dedup::{RecentEvents, DEFAULT_DEDUP_WINDOW};

/// Commands sent *into* the channel task.
#[derive(Debug)]
pub enum ChannelCommand {
    /// Send an event to the hub. Dropped if currently disconnected.
    Emit(OutboundEvent),
    Shutdown,
}

/// Notifications sent *from* the channel task.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelNotification {
    Connected,
    Disconnected,
    /// A validated, de-duplicated inbound event.
    Event(InboundEvent),
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// WebSocket endpoint of the relay hub, e.g. `ws://127.0.0.1:5000/ws`.
    pub url: String,
    pub reconnect_delay: Duration,
    pub dedup_window: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:5000/ws".into(),
            reconnect_delay: Duration::from_secs(2),
            dedup_window: DEFAULT_DEDUP_WINDOW,
        }
    }
}

enum SessionEnd {
    Dropped,
    Shutdown,
}

/// Spawn the channel task.
///
/// Returns `(command_tx, notification_rx)`. The task exits on
/// [`ChannelCommand::Shutdown`] or once every command sender is dropped.
pub fn spawn_channel(
    config: ChannelConfig,
) -> anyhow::Result<(mpsc::Sender<ChannelCommand>, mpsc::Receiver<ChannelNotification>)> {
    config.url.as_str().into_client_request()?;

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<ChannelCommand>(256);
    let (notif_tx, notif_rx) = mpsc::channel::<ChannelNotification>(256);

    tokio::spawn(async move {
        let mut joins: Vec<OutboundEvent> = Vec::new();
        let mut recent = RecentEvents::new(config.dedup_window);

        loop {
            let stream = match connect_async(config.url.as_str()).await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    debug!(url = %config.url, error = %e, "Realtime connect failed");
                    if wait_for_retry(&mut cmd_rx, &mut joins, config.reconnect_delay).await {
                        break;
                    }
                    continue;
                }
            };

            info!(url = %config.url, "Realtime channel connected");
            let (mut write, mut read) = stream.split();

            let mut replayed = true;
            for join in &joins {
                if let Err(e) = send_event(&mut write, join).await {
                    warn!(error = %e, "Failed to replay room subscription");
                    replayed = false;
                    break;
                }
            }

            let end = if replayed {
                let _ = notif_tx.send(ChannelNotification::Connected).await;
                let end = loop {
                    tokio::select! {
                        cmd = cmd_rx.recv() => match cmd {
                            Some(ChannelCommand::Emit(event)) => {
                                remember_join(&mut joins, &event);
                                if let Err(e) = send_event(&mut write, &event).await {
                                    warn!(event = event.name(), error = %e, "Realtime send failed");
                                    break SessionEnd::Dropped;
                                }
                            }
                            Some(ChannelCommand::Shutdown) | None => {
                                let _ = write.close().await;
                                break SessionEnd::Shutdown;
                            }
                        },

                        frame = read.next() => match frame {
                            Some(Ok(WsMessage::Text(text))) => {
                                match InboundEvent::parse(&text) {
                                    Ok(event) if recent.observe(&event) => {
                                        let _ = notif_tx.send(ChannelNotification::Event(event)).await;
                                    }
                                    Ok(event) => {
                                        debug!(event = event.name(), "Dropping duplicate inbound event");
                                    }
                                    Err(e) => {
                                        warn!(error = %e, len = text.len(), "Dropping invalid inbound frame");
                                    }
                                }
                            }
                            Some(Ok(WsMessage::Close(_))) | None => break SessionEnd::Dropped,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(error = %e, "Realtime connection error");
                                break SessionEnd::Dropped;
                            }
                        },
                    }
                };
                info!("Realtime channel disconnected");
                let _ = notif_tx.send(ChannelNotification::Disconnected).await;
                end
            } else {
                SessionEnd::Dropped
            };

            if matches!(end, SessionEnd::Shutdown)
                || wait_for_retry(&mut cmd_rx, &mut joins, config.reconnect_delay).await
            {
                break;
            }
        }

        info!("Realtime channel task terminated");
    });

    Ok((cmd_tx, notif_rx))
}

/// Sleep out the reconnect delay while still serving commands.
/// Returns `true` if the task should stop.
async fn wait_for_retry(
    cmd_rx: &mut mpsc::Receiver<ChannelCommand>,
    joins: &mut Vec<OutboundEvent>,
    delay: Duration,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            cmd = cmd_rx.recv() => match cmd {
                Some(ChannelCommand::Emit(event)) => {
                    remember_join(joins, &event);
                    debug!(event = event.name(), "Offline, dropping realtime event");
                }
                Some(ChannelCommand::Shutdown) | None => return true,
            },
        }
    }
}

fn remember_join(joins: &mut Vec<OutboundEvent>, event: &OutboundEvent) {
    match event {
        OutboundEvent::JoinUser(_) => {
            joins.retain(|j| !matches!(j, OutboundEvent::JoinUser(_)));
            joins.insert(0, event.clone());
        }
        OutboundEvent::JoinChat(_) => {
            if !joins.contains(event) {
                joins.push(event.clone());
            }
        }
        _ => {}
    }
}

async fn send_event<S>(sink: &mut S, event: &OutboundEvent) -> anyhow::Result<()>
where
    S: Sink<WsMessage> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let json = event.to_json()?;
    sink.send(WsMessage::Text(json)).await?;
    Ok(())
}
