// End-to-end tests for BridgeServer over the in-memory transport

use async_trait::async_trait;
use pvebridge::controller::{HypervisorError, VmController, VmInventory};
use pvebridge::events::{MemoryEventsClient, Record};
use pvebridge::hass::{AvailabilityStatus, Component, EntityTopics, TopicLayout};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use vm_manager::{BridgeServer, DeviceSettings, EntitySettings};

struct FakeVm {
    id: String,
    running: Mutex<bool>,
    actions: Mutex<Vec<&'static str>>,
}

impl FakeVm {
    fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            running: Mutex::new(false),
            actions: Mutex::new(Vec::new()),
        })
    }

    fn act(&self, action: &'static str, running: bool) -> Result<(), HypervisorError> {
        self.actions.lock().unwrap().push(action);
        *self.running.lock().unwrap() = running;
        Ok(())
    }
}

#[async_trait]
impl VmController for FakeVm {
    async fn start(&self, _: &CancellationToken) -> Result<(), HypervisorError> {
        self.act("start", true)
    }

    async fn stop(&self, _: &CancellationToken) -> Result<(), HypervisorError> {
        self.act("stop", false)
    }

    async fn restart(&self, _: &CancellationToken) -> Result<(), HypervisorError> {
        self.act("restart", true)
    }

    async fn reset(&self, _: &CancellationToken) -> Result<(), HypervisorError> {
        self.act("reset", true)
    }

    async fn shutdown(&self, _: &CancellationToken) -> Result<(), HypervisorError> {
        self.act("shutdown", false)
    }

    async fn status(&self) -> Result<String, HypervisorError> {
        let running = *self.running.lock().unwrap();
        Ok(if running { "running" } else { "stopped" }.to_string())
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "guest"
    }
}

struct FakeInventory(Vec<Arc<FakeVm>>);

#[async_trait]
impl VmInventory for FakeInventory {
    async fn list_vms(&self) -> Result<Vec<Arc<dyn VmController>>, HypervisorError> {
        Ok(self
            .0
            .iter()
            .map(|vm| Arc::clone(vm) as Arc<dyn VmController>)
            .collect())
    }
}

fn topics(component: Component, vmid: &str, slug: &str) -> EntityTopics {
    EntityTopics::new(
        &TopicLayout::default(),
        component,
        &format!("vm-{}-guest", vmid),
        slug,
    )
}

fn settings() -> DeviceSettings {
    DeviceSettings {
        entity: EntitySettings {
            probe_interval: Duration::from_millis(100),
            availability_interval: Duration::from_secs(60),
        },
        ..Default::default()
    }
}

fn availability(status: AvailabilityStatus) -> Vec<u8> {
    format!(r#"{{"status":"{}"}}"#, status.as_str()).into_bytes()
}

/// A command sent through the broker reaches the controller and the sensor
/// reports the new state on its next probe.
#[tokio::test(start_paused = true)]
async fn test_command_round_trip() {
    let vm = FakeVm::new("100");
    let events = Arc::new(MemoryEventsClient::new());
    let server = BridgeServer::new(
        Arc::new(FakeInventory(vec![Arc::clone(&vm)])),
        events.clone(),
        HashSet::from(["100".to_string()]),
        settings(),
    )
    .with_shutdown_grace(Duration::from_millis(500));

    let (tx, rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        server
            .run(async {
                let _ = rx.await;
            })
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.is_connected());

    let select = topics(Component::Select, "100", "vm-command");
    let sensor = topics(Component::Sensor, "100", "vm-status");
    assert!(
        events
            .inject(select.command.as_deref().unwrap(), r#"{"command":"start"}"#)
            .await
    );

    tokio::time::sleep(Duration::from_millis(120)).await;

    assert_eq!(*vm.actions.lock().unwrap(), vec!["start"]);
    let states = events.published_to(&sensor.state).await;
    assert_eq!(states.first(), Some(&br#"{"state":"stopped"}"#.to_vec()));
    assert_eq!(states.last(), Some(&br#"{"state":"running"}"#.to_vec()));

    tx.send(()).unwrap();
    handle.await.unwrap().unwrap();

    assert!(!events.is_connected());
}

/// Every entity of every monitored machine goes offline exactly once, and
/// only monitored machines are announced.
#[tokio::test(start_paused = true)]
async fn test_shutdown_takes_every_entity_offline() {
    let vms = vec![FakeVm::new("100"), FakeVm::new("101"), FakeVm::new("102")];
    let events = Arc::new(MemoryEventsClient::new());
    let server = BridgeServer::new(
        Arc::new(FakeInventory(vms)),
        events.clone(),
        HashSet::from(["100".to_string(), "102".to_string(), "555".to_string()]),
        settings(),
    );

    server
        .run(tokio::time::sleep(Duration::from_secs(2)))
        .await
        .unwrap();

    let offline = availability(AvailabilityStatus::Offline);
    for vmid in ["100", "102"] {
        for (component, slug) in [
            (Component::Sensor, "vm-status"),
            (Component::Select, "vm-command"),
        ] {
            let t = topics(component, vmid, slug);
            let published = events.published_to(&t.availability).await;
            assert_eq!(published.first(), Some(&availability(AvailabilityStatus::Online)));
            assert_eq!(published.iter().filter(|p| **p == offline).count(), 1);
            assert_eq!(published.last(), Some(&offline));
        }
    }

    let unmonitored = topics(Component::Sensor, "101", "vm-status");
    assert!(events.published_to(&unmonitored.config).await.is_empty());

    // Command subscriptions are released before the transport goes away
    let journal = events.journal().await;
    let unsubscribes = journal
        .iter()
        .filter(|r| matches!(r, Record::Unsubscribe { .. }))
        .count();
    assert_eq!(unsubscribes, 2);
}
