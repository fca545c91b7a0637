//! Scriptable provisioner for tests.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use convoy_core::errors::OrchestratorError;

use crate::provision::{HealthStatus, InstanceHandle, Provisioner, ResourceSpec};

/// A provisioner whose failures and latency are scripted by the test.
pub struct MockProvisioner {
    counter: AtomicU64,
    create_delay: Mutex<Duration>,
    fail_creates: AtomicU32,
    fail_resets: AtomicBool,
    health: Mutex<HealthStatus>,
    created: AtomicU32,
    destroyed: AtomicU32,
    resets: AtomicU32,
}

impl MockProvisioner {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            create_delay: Mutex::new(Duration::from_millis(0)),
            fail_creates: AtomicU32::new(0),
            fail_resets: AtomicBool::new(false),
            health: Mutex::new(HealthStatus::Healthy),
            created: AtomicU32::new(0),
            destroyed: AtomicU32::new(0),
            resets: AtomicU32::new(0),
        }
    }

    pub fn with_create_delay(self, delay: Duration) -> Self {
        *self.create_delay.lock() = delay;
        self
    }

    /// Make the next `n` create calls fail.
    pub fn fail_next_creates(&self, n: u32) {
        self.fail_creates.store(n, Ordering::SeqCst);
    }

    pub fn set_reset_fails(&self, fails: bool) {
        self.fail_resets.store(fails, Ordering::SeqCst);
    }

    pub fn set_health(&self, health: HealthStatus) {
        *self.health.lock() = health;
    }

    pub fn created_count(&self) -> u32 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed_count(&self) -> u32 {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn reset_count(&self) -> u32 {
        self.resets.load(Ordering::SeqCst)
    }
}

impl Default for MockProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provisioner for MockProvisioner {
    async fn create_instance(
        &self,
        _spec: &ResourceSpec,
    ) -> Result<InstanceHandle, OrchestratorError> {
        let delay = *self.create_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let remaining = self.fail_creates.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_creates.store(remaining - 1, Ordering::SeqCst);
            return Err(OrchestratorError::ProvisioningFailed("scripted failure".into()));
        }

        self.created.fetch_add(1, Ordering::SeqCst);
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        Ok(InstanceHandle(format!("mock-{n}")))
    }

    async fn destroy_instance(&self, _handle: &InstanceHandle) -> Result<(), OrchestratorError> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn health_check(&self, _handle: &InstanceHandle) -> HealthStatus {
        *self.health.lock()
    }

    async fn reset_instance(&self, _handle: &InstanceHandle) -> Result<(), OrchestratorError> {
        if self.fail_resets.load(Ordering::SeqCst) {
            return Err(OrchestratorError::ProvisioningFailed("scripted reset failure".into()));
        }
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_create_failures_then_success() {
        let mock = MockProvisioner::new();
        mock.fail_next_creates(2);

        assert!(mock.create_instance(&ResourceSpec::default()).await.is_err());
        assert!(mock.create_instance(&ResourceSpec::default()).await.is_err());
        assert!(mock.create_instance(&ResourceSpec::default()).await.is_ok());
        assert_eq!(mock.created_count(), 1);
    }

    #[tokio::test]
    async fn reset_failure_toggle() {
        let mock = MockProvisioner::new();
        let handle = mock.create_instance(&ResourceSpec::default()).await.unwrap();

        mock.set_reset_fails(true);
        assert!(mock.reset_instance(&handle).await.is_err());

        mock.set_reset_fails(false);
        assert!(mock.reset_instance(&handle).await.is_ok());
        assert_eq!(mock.reset_count(), 1);
    }

    #[tokio::test]
    async fn health_override() {
        let mock = MockProvisioner::new();
        let handle = mock.create_instance(&ResourceSpec::default()).await.unwrap();
        assert_eq!(mock.health_check(&handle).await, HealthStatus::Healthy);
        mock.set_health(HealthStatus::Unhealthy);
        assert_eq!(mock.health_check(&handle).await, HealthStatus::Unhealthy);
    }
}
