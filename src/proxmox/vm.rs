use super::client::{ProxmoxClient, VmSummary};
use crate::controller::{HypervisorError, VmController};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One QEMU machine on a Proxmox node.
///
/// Each lifecycle call issues exactly one power action and waits for its
/// task. Retry and "already in that state" checks belong to the caller.
pub struct ProxmoxVm {
    client: ProxmoxClient,
    node: String,
    vmid: u64,
    id: String,
    name: String,
}

impl ProxmoxVm {
    pub fn new(client: ProxmoxClient, node: &str, summary: &VmSummary) -> Self {
        let name = summary
            .name
            .clone()
            .unwrap_or_else(|| format!("vm{}", summary.vmid));

        Self {
            client,
            node: node.to_string(),
            vmid: summary.vmid,
            id: summary.vmid.to_string(),
            name,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    async fn power(&self, action: &str, cancel: &CancellationToken) -> Result<(), HypervisorError> {
        info!(vmid = self.vmid, node = %self.node, action = action, "Issuing power action");

        let upid = self.client.vm_action(&self.node, self.vmid, action).await?;
        self.client.wait_task(&self.node, &upid, cancel).await?;

        info!(vmid = self.vmid, action = action, "Power action completed");
        Ok(())
    }
}

#[async_trait]
impl VmController for ProxmoxVm {
    async fn start(&self, cancel: &CancellationToken) -> Result<(), HypervisorError> {
        self.power("start", cancel).await
    }

    async fn stop(&self, cancel: &CancellationToken) -> Result<(), HypervisorError> {
        self.power("stop", cancel).await
    }

    async fn restart(&self, cancel: &CancellationToken) -> Result<(), HypervisorError> {
        self.power("reboot", cancel).await
    }

    async fn reset(&self, cancel: &CancellationToken) -> Result<(), HypervisorError> {
        self.power("reset", cancel).await
    }

    async fn shutdown(&self, cancel: &CancellationToken) -> Result<(), HypervisorError> {
        self.power("shutdown", cancel).await
    }

    async fn status(&self) -> Result<String, HypervisorError> {
        debug!(vmid = self.vmid, "Getting vm status");
        self.client.vm_status(&self.node, self.vmid).await
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }
}
