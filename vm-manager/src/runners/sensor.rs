//! Power-state sensor loop.
//!
//! Probes the machine on a fixed interval and publishes `{"state": ...}`,
//! re-announcing config and availability on a separate heartbeat.

use crate::entity::{announce, publish_offline, Entity, EntitySettings, ExitReason, StopSignal};
use async_trait::async_trait;
use pvebridge::controller::VmController;
use pvebridge::events::EventsClient;
use pvebridge::hass::{MqttDevice, MqttEntity, StateMessage, TopicLayout};
use std::sync::Arc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub const SENSOR_NAME: &str = "VM Status";
pub const SENSOR_SLUG: &str = "vm-status";
const SENSOR_ICON: &str = "mdi:server";

pub struct VmStateSensor {
    vm: Arc<dyn VmController>,
    entity: MqttEntity,
    settings: EntitySettings,
    stop: StopSignal,
}

impl VmStateSensor {
    pub fn new(
        vm: Arc<dyn VmController>,
        events: Arc<dyn EventsClient>,
        device: &MqttDevice,
        layout: &TopicLayout,
        settings: EntitySettings,
    ) -> Self {
        let entity = MqttEntity::sensor(
            SENSOR_NAME,
            SENSOR_SLUG,
            Some(SENSOR_ICON),
            device,
            layout,
            events,
        );

        Self {
            vm,
            entity,
            settings,
            stop: StopSignal::new(),
        }
    }

    pub fn entity(&self) -> &MqttEntity {
        &self.entity
    }

    async fn probe_and_publish(&self) {
        let state = match self.vm.status().await {
            Ok(state) => state,
            Err(e) => {
                error!(vm = %self.vm.name(), error = %e, "Failed to probe vm status");
                return;
            }
        };

        debug!(vm = %self.vm.name(), state = %state, "Probed vm status");

        if let Err(e) = self.entity.publish_state(&StateMessage { state }).await {
            error!(vm = %self.vm.name(), error = %e, "Failed to publish vm state");
        }
    }
}

#[async_trait]
impl Entity for VmStateSensor {
    fn name(&self) -> &str {
        self.entity.name()
    }

    async fn run(&self, cancel: CancellationToken) {
        let vm = self.vm.name();
        let ack = self.stop.acknowledge_on_drop();

        info!(
            vm = %vm,
            probe_interval_ms = self.settings.probe_interval.as_millis() as u64,
            "Starting vm state sensor"
        );

        announce(&self.entity, vm).await;
        self.probe_and_publish().await;

        let now = Instant::now();
        let mut probe = interval_at(
            now + self.settings.probe_interval,
            self.settings.probe_interval,
        );
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat = interval_at(
            now + self.settings.availability_interval,
            self.settings.availability_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                biased;
                _ = self.stop.requested() => break ExitReason::Stopped,
                _ = cancel.cancelled() => break ExitReason::Cancelled,
                _ = probe.tick() => self.probe_and_publish().await,
                _ = heartbeat.tick() => announce(&self.entity, vm).await,
            }
        };

        publish_offline(&self.entity, vm).await;
        drop(ack);

        info!(vm = %vm, reason = ?reason, "Vm state sensor stopped");
    }

    async fn stop(&self) {
        info!(vm = %self.vm.name(), "Stopping vm state sensor");
        if !self.stop.request_and_wait().await {
            debug!(vm = %self.vm.name(), "Vm state sensor already stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{offline_count, offline_payload, MockVm};
    use pvebridge::events::{MemoryEventsClient, Record};
    use pvebridge::hass::DeviceTemplate;
    use std::time::Duration;

    fn sensor(
        vm: Arc<MockVm>,
        events: Arc<MemoryEventsClient>,
        probe_interval: Duration,
    ) -> Arc<VmStateSensor> {
        let device = MqttDevice::for_vm(&DeviceTemplate::default(), "pvebridge", "100", "web");
        let settings = EntitySettings {
            probe_interval,
            ..Default::default()
        };
        Arc::new(VmStateSensor::new(
            vm,
            events,
            &device,
            &TopicLayout::default(),
            settings,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_cadence() {
        let vm = Arc::new(MockVm::new("100", "web").with_status("running"));
        let events = Arc::new(MemoryEventsClient::new());
        let sensor = sensor(vm.clone(), events.clone(), Duration::from_millis(100));
        let topics = sensor.entity().topics().clone();

        let runner = Arc::clone(&sensor);
        let handle = tokio::spawn(async move { runner.run(CancellationToken::new()).await });

        tokio::time::sleep(Duration::from_millis(350)).await;

        // Initial probe plus ticks at 100, 200 and 300 ms
        let states = events.published_to(&topics.state).await;
        assert_eq!(states.len(), 4);
        assert_eq!(states[0], br#"{"state":"running"}"#.to_vec());
        assert_eq!(vm.probes(), 4);
        // Heartbeat has not fired yet
        assert_eq!(events.published_to(&topics.config).await.len(), 1);

        sensor.stop().await;
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_publishes_single_offline_last() {
        let vm = Arc::new(MockVm::new("100", "web"));
        let events = Arc::new(MemoryEventsClient::new());
        let sensor = sensor(vm, events.clone(), Duration::from_millis(100));
        let topics = sensor.entity().topics().clone();

        let runner = Arc::clone(&sensor);
        let handle = tokio::spawn(async move { runner.run(CancellationToken::new()).await });
        tokio::time::sleep(Duration::from_millis(250)).await;

        sensor.stop().await;

        // stop() returns only after the offline publish
        let journal = events.journal().await;
        assert_eq!(
            journal.last(),
            Some(&Record::Publish {
                topic: topics.availability.clone(),
                payload: offline_payload(),
            })
        );
        assert_eq!(offline_count(&events, &topics.availability).await, 1);

        // A second stop is a no-op
        sensor.stop().await;
        assert_eq!(events.journal().await.len(), journal.len());

        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_republishes_config_and_online() {
        let vm = Arc::new(MockVm::new("100", "web"));
        let events = Arc::new(MemoryEventsClient::new());
        let device = MqttDevice::for_vm(&DeviceTemplate::default(), "pvebridge", "100", "web");
        let settings = EntitySettings {
            probe_interval: Duration::from_secs(60),
            availability_interval: Duration::from_millis(100),
        };
        let sensor = Arc::new(VmStateSensor::new(
            vm,
            events.clone(),
            &device,
            &TopicLayout::default(),
            settings,
        ));
        let topics = sensor.entity().topics().clone();

        let runner = Arc::clone(&sensor);
        let handle = tokio::spawn(async move { runner.run(CancellationToken::new()).await });
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(events.published_to(&topics.config).await.len(), 3);
        assert_eq!(events.published_to(&topics.availability).await.len(), 3);

        sensor.stop().await;
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_publishes_offline() {
        let vm = Arc::new(MockVm::new("100", "web"));
        let events = Arc::new(MemoryEventsClient::new());
        let sensor = sensor(vm, events.clone(), Duration::from_millis(100));
        let topics = sensor.entity().topics().clone();

        let cancel = CancellationToken::new();
        let runner = Arc::clone(&sensor);
        let token = cancel.clone();
        let handle = tokio::spawn(async move { runner.run(token).await });
        tokio::time::sleep(Duration::from_millis(150)).await;

        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(offline_count(&events, &topics.availability).await, 1);
        // stop() after the loop is gone returns immediately
        sensor.stop().await;
        assert_eq!(offline_count(&events, &topics.availability).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_failures_do_not_stop_loop() {
        let vm = Arc::new(MockVm::new("100", "web"));
        let events = Arc::new(MemoryEventsClient::new());
        events.set_fail_publish(true);
        let sensor = sensor(vm.clone(), events.clone(), Duration::from_millis(100));

        let runner = Arc::clone(&sensor);
        let handle = tokio::spawn(async move { runner.run(CancellationToken::new()).await });
        tokio::time::sleep(Duration::from_millis(350)).await;

        // Probing continues while the transport rejects everything
        assert_eq!(vm.probes(), 4);

        sensor.stop().await;
        handle.await.unwrap();
        assert!(events.journal().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_failures_do_not_stop_loop() {
        let vm = Arc::new(
            MockVm::new("100", "web")
                .with_status("running")
                .with_status_failures(2),
        );
        let events = Arc::new(MemoryEventsClient::new());
        let sensor = sensor(vm.clone(), events.clone(), Duration::from_millis(100));
        let topics = sensor.entity().topics().clone();

        let runner = Arc::clone(&sensor);
        let handle = tokio::spawn(async move { runner.run(CancellationToken::new()).await });
        tokio::time::sleep(Duration::from_millis(350)).await;

        // The first two status reads fail; the 200 and 300 ms ticks publish
        assert_eq!(vm.probes(), 4);
        assert_eq!(
            events.published_to(&topics.state).await,
            vec![br#"{"state":"running"}"#.to_vec(); 2]
        );

        sensor.stop().await;
        handle.await.unwrap();
        assert_eq!(offline_count(&events, &topics.availability).await, 1);
    }
}
