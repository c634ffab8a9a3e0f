use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    extract::State,
    http::{Method, Uri},
    middleware,
    response::Response,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use ichat_shared::protocol::OutboundEvent;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::hub::{ConnectionId, Hub};
use crate::rate_limit::{rate_limit_middleware, RateLimiter};

#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub rate_limiter: RateLimiter,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    let realtime = Router::new()
        .route("/ws", get(ws_upgrade))
        .route_layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .merge(realtime)
        .fallback(not_found)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    connections: usize,
    online_users: usize,
    max_connections: usize,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        connections: state.hub.connection_count().await,
        online_users: state.hub.online_users().await,
        max_connections: state.config.max_connections,
    })
}

async fn not_found(uri: Uri) -> ServerError {
    ServerError::NotFound(uri.path().to_string())
}

async fn ws_upgrade(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Result<Response, ServerError> {
    let max = state.config.max_connections;
    if max > 0 && state.hub.connection_count().await >= max {
        warn!(max, "Rejecting realtime connection, limit reached");
        return Err(ServerError::TooManyConnections(max));
    }

    Ok(ws.on_upgrade(move |socket| serve_socket(socket, state.hub)))
}

async fn serve_socket(socket: WebSocket, hub: Hub) {
    let (conn, mut outbox) = hub.connect().await;
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbox.recv().await {
            if sink.send(WsMessage::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => handle_frame(&hub, conn, &text).await,
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(conn, error = %e, "Socket error");
                break;
            }
        }
    }

    hub.disconnect(conn).await;
    writer.abort();
    debug!(conn, "Socket closed");
}

async fn handle_frame(hub: &Hub, conn: ConnectionId, text: &str) {
    match OutboundEvent::parse(text) {
        Ok(event) => hub.handle(conn, event).await,
        Err(e) => warn!(conn, error = %e, len = text.len(), "Dropping invalid frame"),
    }
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Starting HTTP server");
    serve_on(listener, state).await
}

async fn serve_on(listener: tokio::net::TcpListener, state: AppState) -> anyhow::Result<()> {
    let app = build_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use tokio::time::timeout;
    use tower::ServiceExt;

    use ichat_net::{emit, join_chat, spawn_channel, ChannelConfig, ChannelNotification};
    use ichat_shared::protocol::{InboundEvent, WireMessage};
    use ichat_shared::{ConversationId, MessageId, MessageKind, MessageStatus, UserId};

    fn state(config: ServerConfig) -> AppState {
        AppState {
            hub: Hub::new(),
            rate_limiter: RateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst),
            config: Arc::new(config),
        }
    }

    async fn get_json(app: Router, path: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health_and_info() {
        let app = build_router(state(ServerConfig::default()));

        let (status, body) = get_json(app.clone(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = get_json(app, "/info").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "ichat relay");
        assert_eq!(body["connections"], 0);
    }

    #[tokio::test]
    async fn test_unknown_route_is_json_404() {
        let app = build_router(state(ServerConfig::default()));
        let (status, body) = get_json(app, "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Not found: /nope");
    }

    async fn next_event(
        rx: &mut tokio::sync::mpsc::Receiver<ChannelNotification>,
    ) -> ChannelNotification {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_channel_clients_exchange_messages() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app_state = state(ServerConfig::default());
        let hub = app_state.hub.clone();
        tokio::spawn(serve_on(listener, app_state));

        let config = ChannelConfig {
            url: format!("ws://{addr}/ws"),
            reconnect_delay: Duration::from_millis(50),
            ..ChannelConfig::default()
        };
        let (alice_tx, mut alice_rx) = spawn_channel(config.clone()).unwrap();
        let (bob_tx, mut bob_rx) = spawn_channel(config).unwrap();
        assert_eq!(next_event(&mut alice_rx).await, ChannelNotification::Connected);
        assert_eq!(next_event(&mut bob_rx).await, ChannelNotification::Connected);

        let chat = ConversationId::new("1");
        join_chat(&alice_tx, &chat).await.unwrap();
        join_chat(&bob_tx, &chat).await.unwrap();
        while hub.room_size("chat:1").await < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let wire = WireMessage {
            id: MessageId::new("11"),
            conversation_id: chat,
            sender_id: UserId::new("1"),
            content: "ENC:bm9uY2U=:Y3Q=".into(),
            kind: MessageKind::Text,
            status: MessageStatus::Sent,
            timestamp: Utc::now(),
            expires_at: None,
            reactions: Default::default(),
        };
        emit(&alice_tx, OutboundEvent::SendMessage(wire.clone()))
            .await
            .unwrap();

        let expected = ChannelNotification::Event(InboundEvent::ReceiveMessage(wire));
        assert_eq!(next_event(&mut bob_rx).await, expected);
        assert_eq!(next_event(&mut alice_rx).await, expected);
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app_state = state(ServerConfig {
            max_connections: 1,
            ..ServerConfig::default()
        });
        let hub = app_state.hub.clone();
        tokio::spawn(serve_on(listener, app_state));

        let config = ChannelConfig {
            url: format!("ws://{addr}/ws"),
            reconnect_delay: Duration::from_secs(60),
            ..ChannelConfig::default()
        };
        let (_first_tx, mut first_rx) = spawn_channel(config.clone()).unwrap();
        assert_eq!(next_event(&mut first_rx).await, ChannelNotification::Connected);
        while hub.connection_count().await < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let (_second_tx, mut second_rx) = spawn_channel(config).unwrap();
        assert!(timeout(Duration::from_millis(300), second_rx.recv())
            .await
            .is_err());
    }
}
