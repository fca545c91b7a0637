use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use convoy_core::events::TaskEvent;
use convoy_engine::ChannelEvent;

use crate::client::{self, ClientId, ClientRegistry};
use crate::event_bridge;
use crate::handlers::HandlerState;
use crate::link;
use crate::rpc::{RpcRequest, RpcResponse};

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
    pub max_send_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9810,
            max_send_queue: 256,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler_state: Arc<HandlerState>,
    pub client_registry: Arc<ClientRegistry>,
    pub message_tx: mpsc::Sender<(ClientId, String)>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/link", get(link_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle that keeps the background
/// tasks alive.
pub async fn start(
    config: ServerConfig,
    handler_state: Arc<HandlerState>,
    task_events: broadcast::Receiver<TaskEvent>,
) -> Result<ServerHandle, std::io::Error> {
    let client_registry = Arc::new(ClientRegistry::new(config.max_send_queue));

    let bridge_handle = event_bridge::create_bridge(Arc::clone(&client_registry), task_events);

    let _cleanup = client::start_cleanup_task(
        Arc::clone(&client_registry),
        std::time::Duration::from_secs(60),
    );

    // Channel health cascades into instance failure.
    let _channel_watch = spawn_channel_watch(Arc::clone(&handler_state));
    let _health_monitor = Arc::clone(&handler_state.channels).spawn_health_monitor();

    let (msg_tx, msg_rx) = mpsc::channel::<(ClientId, String)>(1024);

    let app_state = AppState {
        handler_state: Arc::clone(&handler_state),
        client_registry: Arc::clone(&client_registry),
        message_tx: msg_tx,
    };

    let rpc_handle = tokio::spawn(process_rpc_messages(
        msg_rx,
        handler_state,
        client_registry,
    ));

    let router = build_router(app_state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    info!(port = local_addr.port(), "convoy server started");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server_handle,
        _bridge: bridge_handle,
        _rpc: rpc_handle,
        _cleanup,
        _channel_watch,
        _health_monitor,
    })
}

/// Handle returned by `start()` — keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
    _bridge: tokio::task::JoinHandle<()>,
    _rpc: tokio::task::JoinHandle<()>,
    _cleanup: tokio::task::JoinHandle<()>,
    _channel_watch: tokio::task::JoinHandle<()>,
    _health_monitor: tokio::task::JoinHandle<()>,
}

/// Requester WebSocket upgrade.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (client_id, rx) = state.client_registry.register();
    info!(client_id = %client_id, "requester client connected");

    client::handle_ws_connection(
        socket,
        client_id,
        rx,
        state.client_registry,
        state.message_tx,
    )
    .await;
}

/// Instance-link WebSocket upgrade.
async fn link_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| link::handle_link(socket, state.handler_state))
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let resp = crate::handlers::dispatch(
        &state.handler_state,
        &state.client_registry,
        None,
        "health",
        &serde_json::json!({}),
        None,
    )
    .await;

    let status = if resp.success {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };

    (status, axum::Json(resp.result.unwrap_or_default()))
}

/// Process incoming RPC messages from requester clients.
async fn process_rpc_messages(
    mut rx: mpsc::Receiver<(ClientId, String)>,
    state: Arc<HandlerState>,
    registry: Arc<ClientRegistry>,
) {
    while let Some((client_id, raw_message)) = rx.recv().await {
        let request: RpcRequest = match serde_json::from_str(&raw_message) {
            Ok(req) => req,
            Err(_) => {
                let resp = RpcResponse::parse_error();
                if let Ok(json) = serde_json::to_string(&resp) {
                    registry.send_to(&client_id, json);
                }
                continue;
            }
        };

        let params = request.params.unwrap_or(serde_json::json!({}));
        let response = crate::handlers::dispatch(
            &state,
            &registry,
            Some(&client_id),
            &request.method,
            &params,
            request.id,
        )
        .await;

        if let Ok(json) = serde_json::to_string(&response) {
            registry.send_to(&client_id, json);
        }
    }
}

/// Cascade lost channels into instance failures: the registry notifies the
/// session manager, which force-terminates the bound session.
fn spawn_channel_watch(state: Arc<HandlerState>) -> tokio::task::JoinHandle<()> {
    let mut rx = state.channels.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(ChannelEvent::Lost { channel_id, instance_id, reason }) => {
                    warn!(
                        channel_id = %channel_id,
                        instance_id = %instance_id,
                        reason = %reason,
                        "channel lost"
                    );
                    if let Err(e) = state.registry.mark_failed(&instance_id, &reason) {
                        warn!(instance_id = %instance_id, error = %e, "failed to retire instance");
                    }
                    state.channels.remove(&channel_id);
                }
                Ok(ChannelEvent::Unhealthy { channel_id, .. }) => {
                    warn!(channel_id = %channel_id, "channel unhealthy, awaiting re-check");
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "channel watch lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::tests::{ready_instance, setup, test_config};

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let (handler_state, _clients) = setup(test_config());
        let (_instance, _rx) = ready_instance(&handler_state);
        let (task_tx, task_rx) = broadcast::channel::<TaskEvent>(64);
        drop(task_tx);

        let config = ServerConfig {
            port: 0, // random port
            ..Default::default()
        };

        let handle = start(config, handler_state, task_rx).await.unwrap();
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["ready_instances"], 1);
    }

    #[tokio::test]
    async fn channel_loss_cascades_to_session_termination() {
        let (handler_state, _clients) = setup(test_config());
        let (instance_id, _rx) = ready_instance(&handler_state);

        let session = handler_state
            .sessions
            .create(&convoy_core::ids::UserId::new())
            .await
            .unwrap();

        let _watch = spawn_channel_watch(Arc::clone(&handler_state));

        // The monitor confirms the silence and reports the channel lost.
        let channel = handler_state.channels.for_instance(&instance_id).unwrap();
        handler_state
            .channels
            .report_lost(&channel, "missed heartbeats");

        tokio::time::sleep(std::time::Duration::from_millis(80)).await;

        let stored = handler_state.sessions.get(&session.id).unwrap();
        assert_eq!(stored.state, convoy_store::sessions::SessionState::Terminated);
        assert_eq!(stored.ended_reason.as_deref(), Some("instance lost"));
        assert!(handler_state.channels.for_instance(&instance_id).is_none());
    }

    #[tokio::test]
    async fn instance_loss_mid_task_ends_subscriber_stream() {
        use futures::StreamExt;

        let (handler_state, _clients) = setup(test_config());
        let (instance_id, _instance_rx) = ready_instance(&handler_state);
        let _watch = spawn_channel_watch(Arc::clone(&handler_state));

        let session = handler_state
            .sessions
            .create(&convoy_core::ids::UserId::new())
            .await
            .unwrap();
        let task = handler_state
            .router
            .submit(&session.id, vec![serde_json::json!({"action": "noop"})])
            .await
            .unwrap();
        let stream = handler_state.router.subscribe(&task.id).unwrap();

        // The channel dies while the task is in flight.
        let channel = handler_state.channels.for_instance(&instance_id).unwrap();
        handler_state.channels.report_lost(&channel, "missed heartbeats");

        // The stream terminates with a failure event instead of hanging.
        let events: Vec<_> = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            stream.collect::<Vec<_>>(),
        )
        .await
        .expect("subscriber stream hung after instance loss");
        match events.last().unwrap() {
            convoy_core::events::TaskEvent::Failed { reason, .. } => {
                assert_eq!(reason, "instance lost")
            }
            other => panic!("expected failure, got {}", other.event_type()),
        }
    }

    #[tokio::test]
    async fn build_router_creates_routes() {
        let (handler_state, client_registry) = setup(test_config());
        let (msg_tx, _) = mpsc::channel(32);

        let state = AppState {
            handler_state,
            client_registry,
            message_tx: msg_tx,
        };

        let _router = build_router(state);
    }
}
