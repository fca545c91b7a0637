pub mod controller;
pub mod mock;
pub mod provision;
pub mod registry;

pub use controller::PoolController;
pub use provision::{DevProvisioner, HealthStatus, InstanceHandle, Provisioner, ResourceSpec};
pub use registry::{ClaimedInstance, InstanceRegistry, WorkerInstance};
