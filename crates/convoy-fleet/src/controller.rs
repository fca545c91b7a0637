//! Pool controller — keeps the warm pool at its target size.
//!
//! Runs a fixed-interval control loop: sweep instances stuck in
//! provisioning/warming, recycle or retire drained instances, then provision
//! the current deficit, capped by the in-flight limit so a burst of demand
//! never turns into a thundering herd against the provisioning collaborator.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

use convoy_core::config::CoreConfig;
use convoy_core::ids::InstanceId;

use crate::provision::{HealthStatus, Provisioner, ResourceSpec};
use crate::registry::InstanceRegistry;

pub struct PoolController {
    registry: Arc<InstanceRegistry>,
    provisioner: Arc<dyn Provisioner>,
    target: AtomicUsize,
    resources: ResourceSpec,
    config: CoreConfig,
}

impl PoolController {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        provisioner: Arc<dyn Provisioner>,
        config: CoreConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            provisioner,
            target: AtomicUsize::new(config.target_warm_count),
            resources: ResourceSpec::default(),
            config,
        })
    }

    /// Adjust the warm target at runtime (demand-signal policy lives
    /// outside the core).
    pub fn set_target(&self, target: usize) {
        self.target.store(target, Ordering::SeqCst);
    }

    pub fn target(&self) -> usize {
        self.target.load(Ordering::SeqCst)
    }

    /// Start the control loop.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.pool_tick);
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        })
    }

    /// One control-loop pass. Public so tests can drive it deterministically.
    pub async fn tick(&self) {
        self.sweep_stuck().await;
        self.sweep_health().await;
        self.sweep_draining().await;
        self.replenish();
    }

    /// Instances stuck in provisioning/warming (or unreachable after a
    /// restart) past their deadline are failed and their provider resources
    /// destroyed.
    async fn sweep_stuck(&self) {
        for id in self.registry.stage_overdue(Instant::now()) {
            warn!(instance_id = %id, "instance stuck past stage deadline");
            self.fail_and_destroy(&id, "stage timeout").await;
        }
    }

    /// Ask the collaborator about every pooled or leased instance. An
    /// unhealthy report fails the instance, which cascades into
    /// force-terminating any session it held.
    async fn sweep_health(&self) {
        for (id, handle) in self.registry.health_check_targets() {
            match self.provisioner.health_check(&handle).await {
                HealthStatus::Healthy => {
                    if let Err(e) = self.registry.record_health_check(&id) {
                        warn!(instance_id = %id, error = %e, "health bookkeeping failed");
                    }
                }
                HealthStatus::Unhealthy => {
                    warn!(instance_id = %id, "health check reported unhealthy");
                    self.fail_and_destroy(&id, "health check failed").await;
                }
            }
        }
    }

    /// Drained instances past their grace period are reset for reuse, or
    /// retired when reset fails.
    async fn sweep_draining(&self) {
        for id in self.registry.drain_due(Instant::now()) {
            let handle = match self.registry.get(&id).and_then(|i| i.handle) {
                Some(handle) => handle,
                None => {
                    self.fail_and_destroy(&id, "draining without handle").await;
                    continue;
                }
            };

            match self.provisioner.reset_instance(&handle).await {
                Ok(()) => match self.registry.recycle(&id) {
                    Ok(()) => info!(instance_id = %id, "instance recycled into pool"),
                    Err(e) => warn!(instance_id = %id, error = %e, "recycle failed"),
                },
                Err(e) => {
                    info!(instance_id = %id, error = %e, "reset failed, retiring instance");
                    if let Err(e) = self.provisioner.destroy_instance(&handle).await {
                        warn!(instance_id = %id, error = %e, "destroy failed");
                    }
                    if let Err(e) = self.registry.mark_terminated(&id) {
                        warn!(instance_id = %id, error = %e, "terminate failed");
                    }
                }
            }
        }
    }

    /// Provision toward the target, counting in-flight work against both
    /// the deficit and the concurrency cap.
    fn replenish(&self) {
        let ready = self.registry.ready_count();
        let in_flight = self.registry.pending_count();
        let target = self.target();

        let deficit = target.saturating_sub(ready).saturating_sub(in_flight);
        let capacity = self.config.max_in_flight_provisions.saturating_sub(in_flight);
        let to_start = deficit.min(capacity);

        if to_start > 0 {
            debug!(ready, in_flight, target, to_start, "replenishing warm pool");
        }

        for _ in 0..to_start {
            let registry = Arc::clone(&self.registry);
            let provisioner = Arc::clone(&self.provisioner);
            let config = self.config.clone();
            let resources = self.resources.clone();
            tokio::spawn(async move {
                provision_one(registry, provisioner, config, resources).await;
            });
        }
    }

    async fn fail_and_destroy(&self, id: &InstanceId, reason: &str) {
        let handle = self.registry.get(id).and_then(|i| i.handle);
        let _ = self.registry.mark_failed(id, reason);
        if let Some(handle) = handle {
            if let Err(e) = self.provisioner.destroy_instance(&handle).await {
                warn!(instance_id = %id, error = %e, "destroy failed");
            }
        }
        if let Err(e) = self.registry.mark_terminated(id) {
            warn!(instance_id = %id, error = %e, "terminate failed");
        }
    }
}

/// One provisioning attempt cycle: bounded retries with jittered exponential
/// backoff, then the instance is failed and the deficit is retried on a
/// later tick.
async fn provision_one(
    registry: Arc<InstanceRegistry>,
    provisioner: Arc<dyn Provisioner>,
    config: CoreConfig,
    resources: ResourceSpec,
) {
    let id = match registry.admit(&resources) {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "failed to admit instance");
            return;
        }
    };

    for attempt in 1..=config.provision_max_attempts {
        match provisioner.create_instance(&resources).await {
            Ok(handle) => {
                if let Err(e) = registry.set_handle(&id, handle) {
                    warn!(instance_id = %id, error = %e, "failed to record handle");
                }
                if let Err(e) = registry.mark_warming(&id) {
                    warn!(instance_id = %id, error = %e, "failed to mark warming");
                }
                return;
            }
            Err(e) if attempt < config.provision_max_attempts => {
                let delay = backoff_delay(&config, attempt);
                debug!(instance_id = %id, attempt, error = %e, ?delay, "provision retry");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                warn!(instance_id = %id, attempts = attempt, error = %e, "provisioning gave up");
                let _ = registry.mark_failed(&id, "provisioning failed");
                let _ = registry.mark_terminated(&id);
            }
        }
    }
}

fn backoff_delay(config: &CoreConfig, attempt: u32) -> Duration {
    let base = config.provision_backoff_base.as_millis() as u64;
    let exp = base.saturating_mul(1 << (attempt - 1).min(16));
    let capped = exp.min(config.provision_backoff_cap.as_millis() as u64);
    let jittered = (capped as f64 * rand::thread_rng().gen_range(0.5..1.5)) as u64;
    Duration::from_millis(jittered.max(1))
}
