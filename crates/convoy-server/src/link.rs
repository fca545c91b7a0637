//! Instance link — the WebSocket endpoint in-environment clients connect to.
//!
//! The first frame must be a `hello` carrying the instance id and the last
//! orchestrator sequence the client durably processed. A fresh hello opens a
//! logical channel and completes the readiness handshake; a reconnect
//! resumes the existing logical channel, replaying unacknowledged messages.
//! Losing the socket detaches the transport only — the logical channel (and
//! the instance's lease) survives until the reconnect window closes.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use convoy_core::errors::OrchestratorError;
use convoy_core::ids::InstanceId;
use convoy_core::protocol::{CommandMessage, CommandPayload};
use convoy_store::instances::InstanceState;
use tokio::sync::mpsc;

use crate::handlers::HandlerState;

/// Drive one instance WebSocket connection for its lifetime.
pub async fn handle_link(socket: WebSocket, state: Arc<HandlerState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // The handshake frame decides everything else.
    let (instance_id, last_seq) = loop {
        match ws_rx.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                match serde_json::from_str::<CommandMessage>(&text) {
                    Ok(CommandMessage {
                        payload: CommandPayload::Hello { instance_id, last_seq },
                        ..
                    }) => break (instance_id, last_seq),
                    Ok(other) => {
                        warn!(kind = other.payload.kind(), "expected hello as first frame");
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "malformed handshake frame");
                        return;
                    }
                }
            }
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
            _ => return,
        }
    };

    let Some(instance) = state.registry.get(&instance_id) else {
        warn!(instance_id = %instance_id, "hello from unknown instance");
        return;
    };
    if !instance.state.is_live() {
        warn!(instance_id = %instance_id, state = %instance.state, "hello from retired instance");
        return;
    }

    // Resume the existing logical channel if one is open, otherwise this is
    // a fresh attach.
    let channel = match state.channels.for_instance(&instance_id) {
        Some(existing) => existing,
        None => state.channels.open(&instance_id),
    };

    let (tx, mut rx) = mpsc::channel::<CommandMessage>(512);
    match channel.attach(tx, last_seq) {
        Ok(replayed) => {
            info!(instance_id = %instance_id, last_seq, replayed, "instance link established");
        }
        Err(e) => {
            // A resume point outside the retention window (or one we cannot
            // verify after a restart) loses the channel and the instance.
            warn!(instance_id = %instance_id, error = %e, "resume rejected");
            state.channels.report_lost(&channel, "reconnection window exceeded");
            if let Err(e) = fail_instance(&state, &instance_id, "reconnection window exceeded") {
                warn!(instance_id = %instance_id, error = %e, "failed to retire instance");
            }
            return;
        }
    }

    // Lifecycle: a warming instance becomes ready (handshake complete); a
    // recovered ready instance re-enters the pool; a leased instance just
    // regains its transport.
    let result = match instance.state {
        InstanceState::Warming | InstanceState::Ready => {
            state.registry.mark_ready(&instance_id, channel.id().clone())
        }
        _ => state.registry.attach_channel(&instance_id, channel.id().clone()),
    };
    if let Err(e) = result {
        warn!(instance_id = %instance_id, error = %e, "handshake state update failed");
        channel.detach();
        return;
    }

    // Writer: drain the logical channel's transport queue into the socket.
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let Ok(json) = serde_json::to_string(&msg) else {
                continue;
            };
            if ws_tx.send(WsMessage::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Reader: sequence-check inbound frames and hand deliveries to the
    // router's fan-in queue.
    let reader_channel = Arc::clone(&channel);
    let reader_state = Arc::clone(&state);
    let reader_instance = instance_id.clone();
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    let frame: CommandMessage = match serde_json::from_str(&text) {
                        Ok(frame) => frame,
                        Err(e) => {
                            debug!(instance_id = %reader_instance, error = %e, "malformed frame");
                            continue;
                        }
                    };
                    if let Some(delivered) =
                        reader_state.channels.handle_frame(&reader_channel, frame)
                    {
                        if reader_state
                            .inbound_tx
                            .send((reader_instance.clone(), delivered))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    // Physical transport gone; the logical channel stays resumable.
    channel.detach();
    info!(instance_id = %instance_id, channel_id = %channel.id(), "instance link dropped");
}

fn fail_instance(
    state: &Arc<HandlerState>,
    instance_id: &InstanceId,
    reason: &str,
) -> Result<(), OrchestratorError> {
    state.registry.mark_failed(instance_id, reason)?;
    Ok(())
}
