//! Hypervisor capability contracts.
//!
//! The entity loops never talk to Proxmox directly. They hold an
//! `Arc<dyn VmController>` per machine and the fleet server discovers machines
//! through a [`VmInventory`]. Both traits are implemented by the
//! [`crate::proxmox`] client and by test doubles.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Status string reported by the hypervisor for a powered-on machine.
pub const STATUS_RUNNING: &str = "running";

/// Status string reported by the hypervisor for a powered-off machine.
pub const STATUS_STOPPED: &str = "stopped";

/// Errors surfaced by hypervisor operations.
///
/// `TaskFailed` means the hypervisor accepted the request and ran it, but the
/// task finished unsuccessfully. Everything else is a failure to talk to the
/// hypervisor or to wait for it.
#[derive(Debug, thiserror::Error)]
pub enum HypervisorError {
    /// Transport-level failure (connection refused, TLS, decode)
    #[error("hypervisor request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// API answered with a non-success status
    #[error("hypervisor API error: {0}")]
    Api(String),

    /// Asynchronous task completed with a non-OK exit status
    #[error("task failed: {0}")]
    TaskFailed(String),

    /// Task did not reach a terminal state in time
    #[error("task did not complete within {0:?}")]
    Timeout(Duration),

    /// Ambient cancellation fired while waiting
    #[error("operation cancelled")]
    Cancelled,

    /// Enumerating nodes or machines failed
    #[error("error listing vms: {0}")]
    Listing(String),
}

/// Lifecycle and status control for a single virtual machine.
///
/// Lifecycle methods block until the hypervisor task completes, the task
/// timeout elapses, or `cancel` fires.
#[async_trait]
pub trait VmController: Send + Sync {
    /// Power on the machine.
    async fn start(&self, cancel: &CancellationToken) -> Result<(), HypervisorError>;

    /// Hard power off.
    async fn stop(&self, cancel: &CancellationToken) -> Result<(), HypervisorError>;

    /// Reboot through the guest.
    async fn restart(&self, cancel: &CancellationToken) -> Result<(), HypervisorError>;

    /// Hard reset.
    async fn reset(&self, cancel: &CancellationToken) -> Result<(), HypervisorError>;

    /// Graceful ACPI shutdown.
    async fn shutdown(&self, cancel: &CancellationToken) -> Result<(), HypervisorError>;

    /// Current status string (`running`, `stopped`, ...).
    async fn status(&self) -> Result<String, HypervisorError>;

    /// Stable machine identifier (the Proxmox VMID).
    fn id(&self) -> &str;

    /// Display name.
    fn name(&self) -> &str;
}

/// Source of the machines the bridge can monitor.
#[async_trait]
pub trait VmInventory: Send + Sync {
    async fn list_vms(&self) -> Result<Vec<Arc<dyn VmController>>, HypervisorError>;
}
