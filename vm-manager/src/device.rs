//! Per-machine supervisor.
//!
//! Owns the sensor and select loops of one virtual machine, starts them
//! together and stops them together.

use crate::entity::{Entity, EntitySettings};
use crate::runners::command::VmCommandSelect;
use crate::runners::sensor::VmStateSensor;
use anyhow::Result;
use pvebridge::config::BridgeConfig;
use pvebridge::controller::VmController;
use pvebridge::events::EventsClient;
use pvebridge::hass::{DeviceTemplate, MqttDevice, TopicLayout};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Everything a supervisor needs besides the machine and the transport
#[derive(Clone, Debug)]
pub struct DeviceSettings {
    pub entity: EntitySettings,
    pub template: DeviceTemplate,
    /// Root of the per-machine device identifier
    pub identifier_prefix: String,
    pub layout: TopicLayout,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            entity: EntitySettings::default(),
            template: DeviceTemplate::default(),
            identifier_prefix: "pvebridge".to_string(),
            layout: TopicLayout::default(),
        }
    }
}

impl DeviceSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            entity: EntitySettings::from_monitor(&config.monitor),
            template: config.hass.device.clone(),
            identifier_prefix: config.hass.identifier_prefix.clone(),
            layout: config.hass.topic_layout(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.entity.validate()
    }
}

pub struct VirtualMachineDevice {
    vm: Arc<dyn VmController>,
    events: Arc<dyn EventsClient>,
    settings: DeviceSettings,
    stop: CancellationToken,
}

impl VirtualMachineDevice {
    pub fn new(
        vm: Arc<dyn VmController>,
        events: Arc<dyn EventsClient>,
        settings: DeviceSettings,
    ) -> Self {
        Self {
            vm,
            events,
            settings,
            stop: CancellationToken::new(),
        }
    }

    pub fn vm(&self) -> &Arc<dyn VmController> {
        &self.vm
    }

    /// Descriptor shared by all of this machine's entities
    pub fn descriptor(&self) -> MqttDevice {
        MqttDevice::for_vm(
            &self.settings.template,
            &self.settings.identifier_prefix,
            self.vm.id(),
            self.vm.name(),
        )
    }

    /// Run both entities until `stop()` or cancellation, then stop them in
    /// creation order and wait for each to finish its exit sequence.
    pub async fn run(&self, cancel: CancellationToken) {
        let device = self.descriptor();
        info!(vm = %self.vm.name(), device = %device.name, "Starting vm device");

        let entities: Vec<Arc<dyn Entity>> = vec![
            Arc::new(VmStateSensor::new(
                Arc::clone(&self.vm),
                Arc::clone(&self.events),
                &device,
                &self.settings.layout,
                self.settings.entity.clone(),
            )),
            Arc::new(VmCommandSelect::new(
                Arc::clone(&self.vm),
                Arc::clone(&self.events),
                &device,
                &self.settings.layout,
                self.settings.entity.clone(),
            )),
        ];

        let handles: Vec<_> = entities
            .iter()
            .map(|entity| {
                let entity = Arc::clone(entity);
                let cancel = cancel.clone();
                tokio::spawn(async move { entity.run(cancel).await })
            })
            .collect();

        tokio::select! {
            _ = self.stop.cancelled() => info!(vm = %self.vm.name(), "Vm device stop requested"),
            _ = cancel.cancelled() => info!(vm = %self.vm.name(), "Vm device cancelled"),
        }

        for entity in &entities {
            entity.stop().await;
        }

        for (entity, handle) in entities.iter().zip(handles) {
            if let Err(e) = handle.await {
                error!(vm = %self.vm.name(), entity = %entity.name(), error = %e, "Entity task failed");
            }
        }

        info!(vm = %self.vm.name(), "Vm device stopped");
    }

    /// Signal `run` to stop its entities. Repeated calls are no-ops.
    pub fn stop(&self) {
        if self.stop.is_cancelled() {
            info!(vm = %self.vm.name(), "Vm device already stopping");
            return;
        }
        info!(vm = %self.vm.name(), "Stopping vm device");
        self.stop.cancel();
    }
}
