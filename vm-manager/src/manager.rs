//! Fleet server - Runs one supervisor per monitored machine.
//!
//! Scans the inventory once at startup, keeps the machines whose IDs are
//! configured, connects the transport and runs a [`VirtualMachineDevice`]
//! for each until the shutdown future resolves.

use crate::device::{DeviceSettings, VirtualMachineDevice};
use anyhow::{Context, Result};
use futures::future::join_all;
use pvebridge::controller::{VmController, VmInventory};
use pvebridge::events::EventsClient;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default pause between the last supervisor exiting and disconnect
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Fleet server.
///
/// # Responsibilities
/// - Discover machines and filter them by monitored ID
/// - Connect and disconnect the shared transport
/// - Run one supervisor per machine under a child cancellation token
/// - Stop every supervisor on shutdown, then wait the grace period
pub struct BridgeServer {
    inventory: Arc<dyn VmInventory>,
    events: Arc<dyn EventsClient>,
    monitored: HashSet<String>,
    settings: DeviceSettings,
    shutdown_grace: Duration,
}

impl BridgeServer {
    pub fn new(
        inventory: Arc<dyn VmInventory>,
        events: Arc<dyn EventsClient>,
        monitored: HashSet<String>,
        settings: DeviceSettings,
    ) -> Self {
        Self {
            inventory,
            events,
            monitored,
            settings,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Machines from the inventory whose IDs are monitored
    pub async fn scan(&self) -> Result<Vec<Arc<dyn VmController>>> {
        let vms = self
            .inventory
            .list_vms()
            .await
            .context("Failed to list virtual machines")?;

        let selected: Vec<Arc<dyn VmController>> = vms
            .into_iter()
            .filter(|vm| self.monitored.contains(vm.id()))
            .collect();

        let found: HashSet<&str> = selected.iter().map(|vm| vm.id()).collect();
        for id in &self.monitored {
            if !found.contains(id.as_str()) {
                warn!(vmid = %id, "Monitored vm not found in inventory");
            }
        }

        info!(
            monitored = self.monitored.len(),
            found = selected.len(),
            "Scanned virtual machines"
        );
        Ok(selected)
    }

    /// Run until `shutdown` resolves.
    ///
    /// Inventory and connect failures are returned before any supervisor
    /// starts. A failed disconnect on the way out is logged.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        self.settings.validate()?;

        let vms = self.scan().await?;

        self.events
            .connect()
            .await
            .context("Failed to connect events client")?;
        info!("Events client connected");

        let root = CancellationToken::new();

        let devices: Vec<Arc<VirtualMachineDevice>> = vms
            .into_iter()
            .map(|vm| {
                debug!(vmid = %vm.id(), vm = %vm.name(), "Monitoring vm");
                Arc::new(VirtualMachineDevice::new(
                    vm,
                    Arc::clone(&self.events),
                    self.settings.clone(),
                ))
            })
            .collect();

        let handles: Vec<_> = devices
            .iter()
            .map(|device| {
                let device = Arc::clone(device);
                let cancel = root.child_token();
                tokio::spawn(async move { device.run(cancel).await })
            })
            .collect();

        info!(devices = devices.len(), "Bridge server running");

        shutdown.await;
        info!("Shutting down bridge server");

        for device in &devices {
            device.stop();
        }

        for (device, result) in devices.iter().zip(join_all(handles).await) {
            if let Err(e) = result {
                error!(vm = %device.vm().name(), error = %e, "Vm device task failed");
            }
        }

        root.cancel();
        tokio::time::sleep(self.shutdown_grace).await;

        if let Err(e) = self.events.disconnect().await {
            error!(error = %e, "Error disconnecting events client");
        }

        info!("Bridge server stopped");
        Ok(())
    }
}
