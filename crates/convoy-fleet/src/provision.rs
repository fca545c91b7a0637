use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use convoy_core::errors::OrchestratorError;

/// Resource descriptor for a worker instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cpu_count: u32,
    pub memory_mb: u32,
    pub disk_gb: u32,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            cpu_count: 2,
            memory_mb: 4096,
            disk_gb: 20,
        }
    }
}

/// Provider-side identifier for a provisioned instance.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InstanceHandle(pub String);

impl std::fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// The external provisioning collaborator. Every operation is fallible and
/// the pool controller treats them as retryable and rate-limited.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn create_instance(&self, spec: &ResourceSpec)
        -> Result<InstanceHandle, OrchestratorError>;

    async fn destroy_instance(&self, handle: &InstanceHandle) -> Result<(), OrchestratorError>;

    async fn health_check(&self, handle: &InstanceHandle) -> HealthStatus;

    /// Reset a released instance to a clean baseline so it can re-enter the
    /// warm pool.
    async fn reset_instance(&self, handle: &InstanceHandle) -> Result<(), OrchestratorError>;
}

/// Stand-in provisioner for local development: allocates handles without a
/// backing provider, with a small simulated creation delay.
pub struct DevProvisioner {
    counter: AtomicU64,
    create_delay: Duration,
}

impl DevProvisioner {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            create_delay: Duration::from_millis(200),
        }
    }
}

impl Default for DevProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provisioner for DevProvisioner {
    async fn create_instance(
        &self,
        _spec: &ResourceSpec,
    ) -> Result<InstanceHandle, OrchestratorError> {
        tokio::time::sleep(self.create_delay).await;
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        Ok(InstanceHandle(format!("dev-{n}")))
    }

    async fn destroy_instance(&self, _handle: &InstanceHandle) -> Result<(), OrchestratorError> {
        Ok(())
    }

    async fn health_check(&self, _handle: &InstanceHandle) -> HealthStatus {
        HealthStatus::Healthy
    }

    async fn reset_instance(&self, _handle: &InstanceHandle) -> Result<(), OrchestratorError> {
        Ok(())
    }
}
