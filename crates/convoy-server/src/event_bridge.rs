use std::sync::Arc;

use tokio::sync::broadcast;

use convoy_core::events::TaskEvent;

use crate::client::ClientRegistry;

/// Forwards the router's task-event broadcast to requester clients watching
/// the event's session.
pub struct EventBridge {
    registry: Arc<ClientRegistry>,
}

impl EventBridge {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self { registry }
    }

    /// Start the bridge task.
    pub fn start(&self, mut rx: broadcast::Receiver<TaskEvent>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(&self.registry);

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Some(json) = serialize_event(&event) {
                            registry.broadcast_to_session(event.session_id(), &json);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "event bridge lagged, dropped events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("event bridge channel closed");
                        break;
                    }
                }
            }
        })
    }
}

/// Create an event bridge wired to a broadcast channel.
pub fn create_bridge(
    registry: Arc<ClientRegistry>,
    rx: broadcast::Receiver<TaskEvent>,
) -> tokio::task::JoinHandle<()> {
    let bridge = EventBridge::new(registry);
    bridge.start(rx)
}

/// Serialize a task event for the requester wire.
pub fn serialize_event(event: &TaskEvent) -> Option<String> {
    serde_json::to_string(event).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::ids::{SessionId, TaskId};

    #[test]
    fn serialize_dispatched_event() {
        let event = TaskEvent::Dispatched {
            session_id: SessionId::new(),
            task_id: TaskId::new(),
            task_seq: 1,
        };
        let json = serialize_event(&event).unwrap();
        assert!(json.contains("\"type\":\"dispatched\""));
        assert!(json.contains("\"task_seq\":1"));
    }

    #[tokio::test]
    async fn bridge_forwards_to_watching_clients() {
        let registry = Arc::new(ClientRegistry::new(32));
        let (tx, rx) = broadcast::channel(64);

        let (client_id, mut client_rx) = registry.register();
        let session_id = SessionId::new();
        registry.set_watching(&client_id, session_id.clone());

        let handle = create_bridge(Arc::clone(&registry), rx);

        tx.send(TaskEvent::Started {
            session_id: session_id.clone(),
            task_id: TaskId::new(),
        })
        .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let msg = client_rx.try_recv().unwrap();
        assert!(msg.contains("started"));

        handle.abort();
    }

    #[tokio::test]
    async fn bridge_ignores_unrelated_sessions() {
        let registry = Arc::new(ClientRegistry::new(32));
        let (tx, rx) = broadcast::channel(64);

        let (client_id, mut client_rx) = registry.register();
        registry.set_watching(&client_id, SessionId::new());

        let _handle = create_bridge(Arc::clone(&registry), rx);

        tx.send(TaskEvent::Started {
            session_id: SessionId::new(),
            task_id: TaskId::new(),
        })
        .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(client_rx.try_recv().is_err());
    }
}
