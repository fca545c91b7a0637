//! Instance registry — source of truth for worker-instance lifecycle and
//! capacity.
//!
//! All mutations go through registry methods, which enforce the lifecycle
//! state machine, keep the warm pool consistent with instance state, and
//! write every transition through to the store. The pool lock is always
//! acquired before any instance entry so claim, offer, and failure paths
//! cannot deadlock against each other.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tracing::{info, warn};

use convoy_core::config::CoreConfig;
use convoy_core::errors::OrchestratorError;
use convoy_core::events::FleetEvent;
use convoy_core::ids::{ChannelId, InstanceId, SessionId};
use convoy_store::instances::{InstanceRepo, InstanceRow, InstanceState};
use convoy_store::Database;

use crate::provision::{InstanceHandle, ResourceSpec};

/// In-memory record for one worker instance.
#[derive(Clone, Debug)]
pub struct WorkerInstance {
    pub id: InstanceId,
    pub handle: Option<InstanceHandle>,
    pub state: InstanceState,
    pub resources: ResourceSpec,
    pub warm_pool: bool,
    pub lease: Option<SessionId>,
    pub channel_id: Option<ChannelId>,
    pub created_at: DateTime<Utc>,
    pub last_health_check: Option<DateTime<Utc>>,
    /// Deadline for the current stage: provisioning/warming timeout, drain
    /// grace, or post-restart reconnect grace. Cleared once the stage
    /// completes.
    pub stage_deadline: Option<Instant>,
}

/// What a successful claim hands to the session manager.
#[derive(Clone, Debug)]
pub struct ClaimedInstance {
    pub instance_id: InstanceId,
    pub channel_id: ChannelId,
}

struct Waiter {
    session_id: SessionId,
    tx: oneshot::Sender<ClaimedInstance>,
}

#[derive(Default)]
struct PoolState {
    ready: VecDeque<InstanceId>,
    waiters: VecDeque<Waiter>,
}

pub struct InstanceRegistry {
    instances: DashMap<InstanceId, WorkerInstance>,
    pool: Mutex<PoolState>,
    repo: InstanceRepo,
    events: broadcast::Sender<FleetEvent>,
    config: CoreConfig,
}

impl InstanceRegistry {
    pub fn new(db: Database, events: broadcast::Sender<FleetEvent>, config: CoreConfig) -> Self {
        Self {
            instances: DashMap::new(),
            pool: Mutex::new(PoolState::default()),
            repo: InstanceRepo::new(db),
            events,
            config,
        }
    }

    /// Create a provisioning record for an instance the controller is about
    /// to request from the collaborator.
    pub fn admit(&self, resources: &ResourceSpec) -> Result<InstanceId, OrchestratorError> {
        let id = InstanceId::new();
        self.repo
            .create(&id, resources.cpu_count, resources.memory_mb, resources.disk_gb)
            .map_err(internal)?;

        self.instances.insert(
            id.clone(),
            WorkerInstance {
                id: id.clone(),
                handle: None,
                state: InstanceState::Provisioning,
                resources: resources.clone(),
                warm_pool: false,
                lease: None,
                channel_id: None,
                created_at: Utc::now(),
                last_health_check: None,
                stage_deadline: Some(Instant::now() + self.config.provision_timeout),
            },
        );

        info!(instance_id = %id, "instance admitted");
        Ok(id)
    }

    /// Record the provider-side handle once creation succeeds.
    pub fn set_handle(
        &self,
        id: &InstanceId,
        handle: InstanceHandle,
    ) -> Result<(), OrchestratorError> {
        let mut entry = self.entry(id)?;
        self.repo.set_handle(id, &handle.0).map_err(internal)?;
        entry.handle = Some(handle);
        Ok(())
    }

    /// The provisioning collaborator reports the instance exists; wait for
    /// the in-environment client's handshake.
    pub fn mark_warming(&self, id: &InstanceId) -> Result<(), OrchestratorError> {
        let mut entry = self.entry(id)?;
        check_transition(&entry, InstanceState::Warming)?;
        entry.state = InstanceState::Warming;
        self.repo
            .update_placement(id, InstanceState::Warming, None, false)
            .map_err(internal)?;
        Ok(())
    }

    /// Handshake complete over the given channel: the instance becomes ready
    /// and enters the warm pool (or goes straight to the oldest queued
    /// claim). Also used when a recovered ready instance re-establishes its
    /// channel after an orchestrator restart.
    pub fn mark_ready(
        &self,
        id: &InstanceId,
        channel_id: ChannelId,
    ) -> Result<(), OrchestratorError> {
        {
            let mut entry = self.entry(id)?;
            match entry.state {
                InstanceState::Warming => {}
                // Recovered instance re-establishing its channel; a repeated
                // hello on an already-pooled instance changes nothing.
                InstanceState::Ready if !entry.warm_pool => {}
                InstanceState::Ready => return Ok(()),
                state => {
                    return Err(OrchestratorError::StateConflict(format!(
                        "instance {id} cannot become ready from {state}"
                    )))
                }
            }
            entry.state = InstanceState::Ready;
            entry.channel_id = Some(channel_id);
            entry.lease = None;
            entry.stage_deadline = None;
        }
        self.offer(id)
    }

    /// Reattach a channel without changing lifecycle state (recovered leased
    /// instance resuming after a restart).
    pub fn attach_channel(
        &self,
        id: &InstanceId,
        channel_id: ChannelId,
    ) -> Result<(), OrchestratorError> {
        let mut entry = self.entry(id)?;
        entry.channel_id = Some(channel_id);
        entry.stage_deadline = None;
        Ok(())
    }

    /// Claim a ready instance for a session. If none is ready the caller is
    /// queued FIFO and suspended; after `timeout` without a handoff the
    /// claim fails with `CapacityExhausted`.
    pub async fn claim(
        &self,
        session_id: &SessionId,
        timeout: Duration,
    ) -> Result<ClaimedInstance, OrchestratorError> {
        let rx = {
            let mut pool = self.pool.lock();
            if let Some(id) = pool.ready.pop_front() {
                return self.lease_to(&id, session_id);
            }
            let (tx, rx) = oneshot::channel();
            pool.waiters.push_back(Waiter { session_id: session_id.clone(), tx });
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(claimed)) => Ok(claimed),
            Ok(Err(_)) => Err(OrchestratorError::Internal("claim handoff dropped".into())),
            Err(_) => {
                self.remove_waiter(session_id);
                Err(OrchestratorError::CapacityExhausted { waited: timeout })
            }
        }
    }

    /// Session unbind: give the instance a drain grace period to flush its
    /// channel before reset is attempted. Releasing an instance that already
    /// failed is a no-op.
    pub fn release(&self, id: &InstanceId) -> Result<(), OrchestratorError> {
        {
            let mut entry = self.entry(id)?;
            match entry.state {
                InstanceState::Leased => {
                    entry.state = InstanceState::Draining;
                    entry.lease = None;
                    entry.stage_deadline = Some(Instant::now() + self.config.drain_grace);
                }
                InstanceState::Failed | InstanceState::Terminated => return Ok(()),
                state => {
                    return Err(OrchestratorError::StateConflict(format!(
                        "instance {id} cannot drain from {state}"
                    )))
                }
            }
            self.repo
                .update_placement(id, InstanceState::Draining, None, false)
                .map_err(internal)?;
        }
        let _ = self.events.send(FleetEvent::InstanceDraining { instance_id: id.clone() });
        Ok(())
    }

    /// Reset-to-clean-state succeeded: the drained instance re-enters the
    /// pool for reuse, keeping its channel.
    pub fn recycle(&self, id: &InstanceId) -> Result<(), OrchestratorError> {
        {
            let mut entry = self.entry(id)?;
            check_transition(&entry, InstanceState::Ready)?;
            entry.state = InstanceState::Ready;
            entry.lease = None;
            entry.stage_deadline = None;
        }
        self.offer(id)
    }

    /// Fail an instance from any non-terminal state. Returns the session
    /// that held it, if any, so the session manager can force-unbind.
    /// Already-failed and terminated instances are left alone.
    pub fn mark_failed(
        &self,
        id: &InstanceId,
        reason: &str,
    ) -> Result<Option<SessionId>, OrchestratorError> {
        let held = {
            let mut pool = self.pool.lock();
            pool.ready.retain(|ready_id| ready_id != id);

            let mut entry = self.entry(id)?;
            if !entry.state.can_transition(InstanceState::Failed) {
                return Ok(None);
            }
            let held = entry.lease.take();
            entry.state = InstanceState::Failed;
            entry.warm_pool = false;
            entry.stage_deadline = None;
            held
        };
        self.repo
            .update_placement(id, InstanceState::Failed, None, false)
            .map_err(internal)?;

        warn!(instance_id = %id, reason, "instance failed");
        let _ = self.events.send(FleetEvent::InstanceFailed {
            instance_id: id.clone(),
            session_id: held.clone(),
            reason: reason.to_string(),
        });
        Ok(held)
    }

    /// Final transition after the provider resource is destroyed.
    pub fn mark_terminated(&self, id: &InstanceId) -> Result<(), OrchestratorError> {
        {
            let mut entry = self.entry(id)?;
            check_transition(&entry, InstanceState::Terminated)?;
            entry.state = InstanceState::Terminated;
        }
        self.repo
            .update_placement(id, InstanceState::Terminated, None, false)
            .map_err(internal)?;
        let _ = self.events.send(FleetEvent::InstanceTerminated { instance_id: id.clone() });
        Ok(())
    }

    /// Re-seed a persisted instance after a restart. Live instances get a
    /// reconnect grace deadline; the warm pool is repopulated only when the
    /// instance client re-establishes its channel.
    pub fn restore(&self, row: &InstanceRow) {
        let stage_deadline = match row.state {
            InstanceState::Draining => Some(Instant::now() + self.config.drain_grace),
            state if state.is_live() => Some(Instant::now() + self.config.reconnect_grace),
            _ => None,
        };

        self.instances.insert(
            row.id.clone(),
            WorkerInstance {
                id: row.id.clone(),
                handle: (!row.provider_handle.is_empty())
                    .then(|| InstanceHandle(row.provider_handle.clone())),
                state: row.state,
                resources: ResourceSpec {
                    cpu_count: row.cpu_count,
                    memory_mb: row.memory_mb,
                    disk_gb: row.disk_gb,
                },
                warm_pool: false,
                lease: row.leased_session_id.clone(),
                channel_id: None,
                created_at: row
                    .created_at
                    .parse::<DateTime<Utc>>()
                    .unwrap_or_else(|_| Utc::now()),
                last_health_check: None,
                stage_deadline,
            },
        );
    }

    pub fn record_health_check(&self, id: &InstanceId) -> Result<(), OrchestratorError> {
        let mut entry = self.entry(id)?;
        entry.last_health_check = Some(Utc::now());
        self.repo.touch_health_check(id).map_err(internal)?;
        Ok(())
    }

    // ── Accessors ──

    pub fn get(&self, id: &InstanceId) -> Option<WorkerInstance> {
        self.instances.get(id).map(|e| e.clone())
    }

    pub fn ready_count(&self) -> usize {
        self.pool.lock().ready.len()
    }

    pub fn waiting_claims(&self) -> usize {
        self.pool.lock().waiters.len()
    }

    /// Instances currently being brought up (counts against the in-flight
    /// provisioning cap).
    pub fn pending_count(&self) -> usize {
        self.instances
            .iter()
            .filter(|e| {
                matches!(e.state, InstanceState::Provisioning | InstanceState::Warming)
            })
            .count()
    }

    pub fn leased_count(&self) -> usize {
        self.instances
            .iter()
            .filter(|e| e.state == InstanceState::Leased)
            .count()
    }

    /// Non-draining live instances whose stage deadline has passed:
    /// stuck provisioning/warming, or recovered instances that never
    /// reconnected.
    pub fn stage_overdue(&self, now: Instant) -> Vec<InstanceId> {
        self.instances
            .iter()
            .filter(|e| {
                e.state != InstanceState::Draining
                    && e.state.is_live()
                    && e.stage_deadline.is_some_and(|d| now >= d)
            })
            .map(|e| e.id.clone())
            .collect()
    }

    /// Instances whose provider resource is worth health-checking.
    pub fn health_check_targets(&self) -> Vec<(InstanceId, InstanceHandle)> {
        self.instances
            .iter()
            .filter(|e| matches!(e.state, InstanceState::Ready | InstanceState::Leased))
            .filter_map(|e| e.handle.clone().map(|handle| (e.id.clone(), handle)))
            .collect()
    }

    /// Draining instances whose grace period has elapsed, ready for a reset
    /// attempt.
    pub fn drain_due(&self, now: Instant) -> Vec<InstanceId> {
        self.instances
            .iter()
            .filter(|e| {
                e.state == InstanceState::Draining && e.stage_deadline.is_some_and(|d| now >= d)
            })
            .map(|e| e.id.clone())
            .collect()
    }

    // ── Internal ──

    fn entry(
        &self,
        id: &InstanceId,
    ) -> Result<dashmap::mapref::one::RefMut<'_, InstanceId, WorkerInstance>, OrchestratorError>
    {
        self.instances
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::Validation(format!("unknown instance {id}")))
    }

    /// Lease a specific ready instance to a session. Caller must have
    /// removed it from the ready deque (or never inserted it).
    fn lease_to(
        &self,
        id: &InstanceId,
        session_id: &SessionId,
    ) -> Result<ClaimedInstance, OrchestratorError> {
        let channel_id = {
            let mut entry = self.entry(id)?;
            check_transition(&entry, InstanceState::Leased)?;
            let channel_id = entry.channel_id.clone().ok_or_else(|| {
                OrchestratorError::Internal(format!("ready instance {id} has no channel"))
            })?;
            entry.state = InstanceState::Leased;
            entry.lease = Some(session_id.clone());
            entry.warm_pool = false;
            channel_id
        };
        self.repo
            .update_placement(id, InstanceState::Leased, Some(session_id), false)
            .map_err(internal)?;

        Ok(ClaimedInstance { instance_id: id.clone(), channel_id })
    }

    /// Place a ready instance: hand it to the oldest live claim waiter, or
    /// park it in the warm pool.
    fn offer(&self, id: &InstanceId) -> Result<(), OrchestratorError> {
        let mut pool = self.pool.lock();

        while let Some(waiter) = pool.waiters.pop_front() {
            if waiter.tx.is_closed() {
                continue; // claim timed out while queued
            }
            let claimed = self.lease_to(id, &waiter.session_id)?;
            match waiter.tx.send(claimed) {
                Ok(()) => {
                    drop(pool);
                    let _ = self
                        .events
                        .send(FleetEvent::InstanceReady { instance_id: id.clone() });
                    return Ok(());
                }
                Err(_) => {
                    // Receiver dropped between the liveness check and the
                    // send; undo the lease and try the next waiter.
                    let mut entry = self.entry(id)?;
                    entry.state = InstanceState::Ready;
                    entry.lease = None;
                    drop(entry);
                    self.repo
                        .update_placement(id, InstanceState::Ready, None, false)
                        .map_err(internal)?;
                }
            }
        }

        {
            let mut entry = self.entry(id)?;
            entry.warm_pool = true;
        }
        pool.ready.push_back(id.clone());
        drop(pool);

        self.repo
            .update_placement(id, InstanceState::Ready, None, true)
            .map_err(internal)?;
        let _ = self.events.send(FleetEvent::InstanceReady { instance_id: id.clone() });
        Ok(())
    }

    fn remove_waiter(&self, session_id: &SessionId) {
        let mut pool = self.pool.lock();
        pool.waiters.retain(|w| &w.session_id != session_id);
    }
}

fn check_transition(
    entry: &WorkerInstance,
    next: InstanceState,
) -> Result<(), OrchestratorError> {
    if entry.state.can_transition(next) {
        Ok(())
    } else {
        Err(OrchestratorError::StateConflict(format!(
            "instance {} cannot move {} -> {next}",
            entry.id, entry.state
        )))
    }
}

fn internal(e: convoy_store::StoreError) -> OrchestratorError {
    OrchestratorError::Internal(e.to_string())
}
