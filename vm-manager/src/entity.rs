//! Shared pieces of the entity loops.

use anyhow::{ensure, Result};
use async_trait::async_trait;
use pvebridge::config::MonitorConfig;
use pvebridge::hass::{AvailabilityStatus, MqttEntity};
use std::time::Duration;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, warn};

/// Default cadence of the state probe
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(60);

/// Default cadence of the availability heartbeat
pub const DEFAULT_AVAILABILITY_INTERVAL: Duration = Duration::from_secs(60);

/// Upper bound on the final offline publish of an exiting loop
pub const OFFLINE_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// One hub-visible unit backed by one concurrent loop.
#[async_trait]
pub trait Entity: Send + Sync {
    /// Entity display name, used in logs
    fn name(&self) -> &str;

    /// Run the loop until stopped or cancelled.
    ///
    /// Never returns an error; failures are logged where they happen.
    async fn run(&self, cancel: CancellationToken);

    /// Ask the loop to exit and wait until its exit sequence has finished.
    ///
    /// Calling this more than once is a no-op.
    async fn stop(&self);
}

/// Why an entity loop left its select loop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// `stop()` was called
    Stopped,
    /// The ambient cancellation token fired
    Cancelled,
}

/// Stop request and stop acknowledgement for one entity loop.
///
/// Both halves are one-shot. The loop watches [`StopSignal::requested`] and
/// acknowledges after its last outbound publish; the caller of `stop()`
/// requests and waits for that acknowledgement.
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    requested: CancellationToken,
    finished: CancellationToken,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop. Returns false if one was already requested.
    pub fn request(&self) -> bool {
        if self.requested.is_cancelled() {
            return false;
        }
        self.requested.cancel();
        true
    }

    pub fn is_requested(&self) -> bool {
        self.requested.is_cancelled()
    }

    /// Completes once a stop has been requested
    pub async fn requested(&self) {
        self.requested.cancelled().await
    }

    /// Mark the exit sequence as complete
    pub fn acknowledge(&self) {
        self.finished.cancel();
    }

    /// Acknowledge when the returned guard drops, including on panic
    pub fn acknowledge_on_drop(&self) -> DropGuard {
        self.finished.clone().drop_guard()
    }

    pub fn is_acknowledged(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Request a stop and wait for the loop to acknowledge it.
    ///
    /// Returns false when this call was a duplicate.
    pub async fn request_and_wait(&self) -> bool {
        let first = self.request();
        self.finished.cancelled().await;
        first
    }
}

/// Timer settings shared by both entities of a machine
#[derive(Clone, Debug, PartialEq)]
pub struct EntitySettings {
    pub probe_interval: Duration,
    pub availability_interval: Duration,
}

impl Default for EntitySettings {
    fn default() -> Self {
        Self {
            probe_interval: DEFAULT_PROBE_INTERVAL,
            availability_interval: DEFAULT_AVAILABILITY_INTERVAL,
        }
    }
}

impl EntitySettings {
    pub fn from_monitor(monitor: &MonitorConfig) -> Self {
        Self {
            probe_interval: monitor.probe_interval(),
            availability_interval: monitor.availability_interval(),
        }
    }

    /// Timers must have a non-zero period
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.probe_interval.is_zero(),
            "probe interval must be greater than zero"
        );
        ensure!(
            !self.availability_interval.is_zero(),
            "availability interval must be greater than zero"
        );
        Ok(())
    }
}

/// Publish config and availability=online. Used at start and on heartbeat.
pub(crate) async fn announce(entity: &MqttEntity, vm: &str) {
    if let Err(e) = entity.publish_config().await {
        error!(vm = %vm, entity = %entity.name(), error = %e, "Failed to publish config");
    }

    if let Err(e) = entity.publish_availability(AvailabilityStatus::Online).await {
        error!(vm = %vm, entity = %entity.name(), error = %e, "Failed to publish availability");
    }
}

/// Best-effort availability=offline, bounded by [`OFFLINE_PUBLISH_TIMEOUT`]
pub(crate) async fn publish_offline(entity: &MqttEntity, vm: &str) {
    let publish = entity.publish_availability(AvailabilityStatus::Offline);

    match tokio::time::timeout(OFFLINE_PUBLISH_TIMEOUT, publish).await {
        Ok(Ok(())) => debug!(vm = %vm, entity = %entity.name(), "Published offline"),
        Ok(Err(e)) => {
            error!(vm = %vm, entity = %entity.name(), error = %e, "Failed to publish offline")
        }
        Err(_) => warn!(
            vm = %vm,
            entity = %entity.name(),
            timeout_secs = OFFLINE_PUBLISH_TIMEOUT.as_secs(),
            "Offline publish timed out"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_is_one_shot() {
        let signal = StopSignal::new();
        assert!(!signal.is_requested());
        assert!(signal.request());
        assert!(!signal.request());
        assert!(signal.is_requested());
    }

    #[tokio::test]
    async fn test_request_and_wait_returns_after_ack() {
        let signal = StopSignal::new();
        let loop_side = signal.clone();

        let handle = tokio::spawn(async move {
            loop_side.requested().await;
            loop_side.acknowledge();
        });

        assert!(signal.request_and_wait().await);
        assert!(signal.is_acknowledged());
        // Duplicate stop returns immediately
        assert!(!signal.request_and_wait().await);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_guard_acknowledges() {
        let signal = StopSignal::new();
        {
            let _ack = signal.acknowledge_on_drop();
            assert!(!signal.is_acknowledged());
        }
        assert!(signal.is_acknowledged());
    }

    #[test]
    fn test_settings_validation() {
        assert!(EntitySettings::default().validate().is_ok());

        let settings = EntitySettings {
            probe_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_settings_from_monitor() {
        let monitor = MonitorConfig {
            probe_interval_secs: 5,
            availability_interval_secs: 30,
            ..Default::default()
        };
        let settings = EntitySettings::from_monitor(&monitor);
        assert_eq!(settings.probe_interval, Duration::from_secs(5));
        assert_eq!(settings.availability_interval, Duration::from_secs(30));
    }
}
