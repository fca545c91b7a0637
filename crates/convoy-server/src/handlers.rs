//! RPC method handlers for the requester boundary.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;

use convoy_core::ids::{InstanceId, SessionId, TaskId, UserId};
use convoy_core::protocol::CommandMessage;
use convoy_engine::{ChannelManager, SessionManager, TaskRouter};
use convoy_fleet::registry::InstanceRegistry;

use crate::client::{ClientId, ClientRegistry};
use crate::event_bridge;
use crate::rpc::{self, RpcResponse};

/// Shared state available to all RPC handlers and the instance link layer.
pub struct HandlerState {
    pub sessions: Arc<SessionManager>,
    pub router: Arc<TaskRouter>,
    pub registry: Arc<InstanceRegistry>,
    pub channels: Arc<ChannelManager>,
    /// In-order instance messages headed for the router's fan-in loop.
    pub inbound_tx: mpsc::Sender<(InstanceId, CommandMessage)>,
}

impl HandlerState {
    pub fn new(
        sessions: Arc<SessionManager>,
        router: Arc<TaskRouter>,
        registry: Arc<InstanceRegistry>,
        channels: Arc<ChannelManager>,
        inbound_tx: mpsc::Sender<(InstanceId, CommandMessage)>,
    ) -> Self {
        Self { sessions, router, registry, channels, inbound_tx }
    }
}

/// Dispatch an RPC method to the appropriate handler. `client` is present
/// for WebSocket requests and enables subscription methods.
pub async fn dispatch(
    state: &Arc<HandlerState>,
    clients: &Arc<ClientRegistry>,
    client: Option<&ClientId>,
    method: &str,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    match method {
        // Session
        "session.create" => session_create(state, params, id).await,
        "session.get" => session_get(state, params, id),
        "session.end" => session_end(state, params, id),
        "session.watch" => session_watch(clients, client, params, id),

        // Task
        "task.submit" => task_submit(state, params, id).await,
        "task.cancel" => task_cancel(state, params, id).await,
        "task.get" => task_get(state, params, id),
        "task.subscribe" => task_subscribe(state, clients, client, params, id),

        // System
        "system.ping" | "health" => health(state, id),
        "fleet.status" => fleet_status(state, id),

        _ => RpcResponse::method_not_found(id, method),
    }
}

// ── Session handlers ──

async fn session_create(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let user_id = match rpc::require_str(params, "user_id") {
        Ok(u) => UserId::from_raw(u),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    match state.sessions.create(&user_id).await {
        Ok(session) => RpcResponse::success(
            id,
            serde_json::json!({
                "session_id": session.id,
                "state": session.state,
                "instance_id": session.instance_id,
            }),
        ),
        Err(e) => RpcResponse::from_orchestrator_error(id, &e),
    }
}

fn session_get(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let session_id = match rpc::require_str(params, "session_id") {
        Ok(s) => SessionId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    match state.sessions.get(&session_id) {
        Some(session) => RpcResponse::success(
            id,
            serde_json::json!({
                "session_id": session.id,
                "user_id": session.user_id,
                "state": session.state,
                "instance_id": session.instance_id,
                "ended_reason": session.ended_reason,
            }),
        ),
        None => RpcResponse::error(id, "VALIDATION", format!("unknown session {session_id}")),
    }
}

fn session_end(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let session_id = match rpc::require_str(params, "session_id") {
        Ok(s) => SessionId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    match state.sessions.terminate(&session_id, "client request") {
        Ok(()) => RpcResponse::success(id, serde_json::json!({"ok": true})),
        Err(e) => RpcResponse::from_orchestrator_error(id, &e),
    }
}

fn session_watch(
    clients: &Arc<ClientRegistry>,
    client: Option<&ClientId>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let Some(client_id) = client else {
        return RpcResponse::invalid_params(id, "session.watch requires a WebSocket connection");
    };
    let session_id = match rpc::require_str(params, "session_id") {
        Ok(s) => SessionId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    clients.set_watching(client_id, session_id);
    RpcResponse::success(id, serde_json::json!({"ok": true}))
}

// ── Task handlers ──

async fn task_submit(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let session_id = match rpc::require_str(params, "session_id") {
        Ok(s) => SessionId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let steps = match rpc::require_array(params, "steps") {
        Ok(steps) => steps.clone(),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    match state.router.submit(&session_id, steps).await {
        Ok(task) => RpcResponse::success(
            id,
            serde_json::json!({
                "task_id": task.id,
                "seq": task.seq,
                "status": task.status,
            }),
        ),
        Err(e) => RpcResponse::from_orchestrator_error(id, &e),
    }
}

async fn task_cancel(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let task_id = match rpc::require_str(params, "task_id") {
        Ok(t) => TaskId::from_raw(t),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    match state.router.cancel(&task_id).await {
        Ok(()) => RpcResponse::success(id, serde_json::json!({"ok": true})),
        Err(e) => RpcResponse::from_orchestrator_error(id, &e),
    }
}

fn task_get(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let task_id = match rpc::require_str(params, "task_id") {
        Ok(t) => TaskId::from_raw(t),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    match state.router.task(&task_id) {
        Some(task) => RpcResponse::success(
            id,
            serde_json::json!({
                "task_id": task.id,
                "session_id": task.session_id,
                "seq": task.seq,
                "status": task.status,
            }),
        ),
        None => RpcResponse::error(id, "VALIDATION", format!("unknown task {task_id}")),
    }
}

/// Stream a task's updates to the requesting client: the retained history
/// replays first, then live events until the terminal one.
fn task_subscribe(
    state: &Arc<HandlerState>,
    clients: &Arc<ClientRegistry>,
    client: Option<&ClientId>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let Some(client_id) = client else {
        return RpcResponse::invalid_params(id, "task.subscribe requires a WebSocket connection");
    };
    let task_id = match rpc::require_str(params, "task_id") {
        Ok(t) => TaskId::from_raw(t),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    let mut stream = match state.router.subscribe(&task_id) {
        Ok(stream) => stream,
        Err(e) => return RpcResponse::from_orchestrator_error(id, &e),
    };

    let clients = Arc::clone(clients);
    let client_id = client_id.clone();
    let forward_task_id = task_id.clone();
    tokio::spawn(async move {
        while let Some(event) = stream.next().await {
            if let Some(json) = event_bridge::serialize_event(&event) {
                if !clients.send_to(&client_id, json) {
                    debug!(task_id = %forward_task_id, "subscriber gone, dropping stream");
                    break;
                }
            }
        }
    });

    RpcResponse::success(id, serde_json::json!({"subscribed": true, "task_id": task_id}))
}

// ── System handlers ──

fn health(state: &Arc<HandlerState>, id: Option<serde_json::Value>) -> RpcResponse {
    RpcResponse::success(
        id,
        serde_json::json!({
            "status": "healthy",
            "ready_instances": state.registry.ready_count(),
            "active_sessions": state.sessions.active_count(),
            "channels": state.channels.count(),
        }),
    )
}

fn fleet_status(state: &Arc<HandlerState>, id: Option<serde_json::Value>) -> RpcResponse {
    RpcResponse::success(
        id,
        serde_json::json!({
            "ready": state.registry.ready_count(),
            "leased": state.registry.leased_count(),
            "pending": state.registry.pending_count(),
            "waiting_claims": state.registry.waiting_claims(),
        }),
    )
}
