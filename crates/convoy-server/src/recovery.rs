//! Restart reconciliation.
//!
//! Session and instance records survive an orchestrator restart; channel
//! state does not. Recovery re-seeds the in-memory registries from the
//! store, gives every live instance a reconnect grace window, and closes
//! out sessions whose queued claims died with the old process. Instances
//! that never reconnect are failed by the pool controller's stage sweep,
//! which cascades into force-terminating their sessions.

use tracing::info;

use convoy_core::errors::OrchestratorError;
use convoy_engine::SessionManager;
use convoy_fleet::registry::InstanceRegistry;
use convoy_store::instances::InstanceRepo;
use convoy_store::sessions::{SessionRepo, SessionState};
use convoy_store::Database;

#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub instances: usize,
    pub sessions: usize,
    pub pending_closed: usize,
}

/// Reconcile persisted state into the in-memory registries. Call before the
/// server starts accepting claims.
pub fn recover(
    db: &Database,
    registry: &InstanceRegistry,
    sessions: &SessionManager,
) -> Result<RecoveryReport, OrchestratorError> {
    let mut report = RecoveryReport::default();

    let instance_repo = InstanceRepo::new(db.clone());
    for row in instance_repo.live().map_err(internal)? {
        registry.restore(&row);
        report.instances += 1;
    }

    let session_repo = SessionRepo::new(db.clone());
    for row in session_repo.live().map_err(internal)? {
        if row.state == SessionState::Pending {
            report.pending_closed += 1;
        }
        sessions.restore(&row)?;
        report.sessions += 1;
    }

    info!(
        instances = report.instances,
        sessions = report.sessions,
        pending_closed = report.pending_closed,
        "recovery complete"
    );
    Ok(report)
}

fn internal(e: convoy_store::StoreError) -> OrchestratorError {
    OrchestratorError::Internal(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::broadcast;

    use convoy_core::config::CoreConfig;
    use convoy_core::ids::{ChannelId, InstanceId, SessionId, UserId};
    use convoy_store::instances::InstanceState;

    fn stack(
        db: &Database,
        config: &CoreConfig,
    ) -> (Arc<InstanceRegistry>, Arc<SessionManager>) {
        let (fleet_tx, _) = broadcast::channel(64);
        let (session_tx, _) = broadcast::channel(64);
        let registry = Arc::new(InstanceRegistry::new(
            db.clone(),
            fleet_tx,
            config.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(
            db.clone(),
            Arc::clone(&registry),
            session_tx,
            config.clone(),
        ));
        (registry, sessions)
    }

    #[tokio::test]
    async fn recovery_reseeds_live_rows_and_closes_pending() {
        let db = Database::in_memory().unwrap();
        let config = CoreConfig {
            reconnect_grace: Duration::from_millis(50),
            ..Default::default()
        };

        // First process lifetime: one ready instance, one active session on
        // a second instance, one pending session.
        let instance_repo = InstanceRepo::new(db.clone());
        let session_repo = SessionRepo::new(db.clone());

        let ready_vm = InstanceId::new();
        instance_repo.create(&ready_vm, 2, 4096, 20).unwrap();
        instance_repo
            .update_placement(&ready_vm, InstanceState::Ready, None, true)
            .unwrap();

        let leased_vm = InstanceId::new();
        let active_session = SessionId::new();
        instance_repo.create(&leased_vm, 2, 4096, 20).unwrap();
        instance_repo
            .update_placement(&leased_vm, InstanceState::Leased, Some(&active_session), false)
            .unwrap();
        session_repo.create(&active_session, &UserId::new()).unwrap();
        session_repo
            .update_binding(&active_session, SessionState::Active, Some(&leased_vm), None)
            .unwrap();

        let pending_session = SessionId::new();
        session_repo.create(&pending_session, &UserId::new()).unwrap();

        // Second process lifetime.
        let (registry, sessions) = stack(&db, &config);
        let report = recover(&db, &registry, &sessions).unwrap();

        assert_eq!(report.instances, 2);
        assert_eq!(report.sessions, 2);
        assert_eq!(report.pending_closed, 1);

        // The recovered ready instance is not claimable until it reconnects.
        assert_eq!(registry.ready_count(), 0);

        // The active session kept its binding.
        let restored = sessions.get(&active_session).unwrap();
        assert_eq!(restored.state, SessionState::Active);
        assert_eq!(restored.instance_id.as_ref(), Some(&leased_vm));

        // The pending session was closed out.
        let closed = sessions.get(&pending_session).unwrap();
        assert_eq!(closed.state, SessionState::Terminated);
        assert_eq!(closed.ended_reason.as_deref(), Some("orchestrator restart"));
    }

    #[tokio::test]
    async fn recovered_instance_reenters_pool_on_reconnect() {
        let db = Database::in_memory().unwrap();
        let config = CoreConfig::default();

        let instance_repo = InstanceRepo::new(db.clone());
        let vm = InstanceId::new();
        instance_repo.create(&vm, 2, 4096, 20).unwrap();
        instance_repo
            .update_placement(&vm, InstanceState::Ready, None, true)
            .unwrap();

        let (registry, sessions) = stack(&db, &config);
        recover(&db, &registry, &sessions).unwrap();

        // Handshake after the restart restores claimability.
        registry.mark_ready(&vm, ChannelId::new()).unwrap();
        assert_eq!(registry.ready_count(), 1);
    }

    #[tokio::test]
    async fn unreachable_recovered_instance_goes_overdue() {
        let db = Database::in_memory().unwrap();
        let config = CoreConfig {
            reconnect_grace: Duration::from_millis(20),
            ..Default::default()
        };

        let instance_repo = InstanceRepo::new(db.clone());
        let vm = InstanceId::new();
        instance_repo.create(&vm, 2, 4096, 20).unwrap();
        instance_repo
            .update_placement(&vm, InstanceState::Leased, Some(&SessionId::new()), false)
            .unwrap();

        let (registry, sessions) = stack(&db, &config);
        recover(&db, &registry, &sessions).unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        let overdue = registry.stage_overdue(std::time::Instant::now());
        assert_eq!(overdue, vec![vm]);
    }
}
