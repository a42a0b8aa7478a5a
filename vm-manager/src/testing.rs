use async_trait::async_trait;
use pvebridge::controller::{HypervisorError, VmController, STATUS_RUNNING, STATUS_STOPPED};
use pvebridge::events::{MemoryEventsClient, Record};
use pvebridge::hass::{AvailabilityMessage, AvailabilityStatus};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// One lifecycle call seen by [`MockVm`]
#[derive(Clone, Debug)]
pub struct Call {
    pub action: &'static str,
    pub at: Instant,
}

/// Scriptable in-memory controller
pub struct MockVm {
    id: String,
    name: String,
    status: Mutex<String>,
    start_failures: Mutex<u32>,
    status_failures: Mutex<u32>,
    action_delay: Mutex<Duration>,
    calls: Mutex<Vec<Call>>,
    probes: Mutex<u32>,
}

impl MockVm {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            status: Mutex::new(STATUS_STOPPED.to_string()),
            start_failures: Mutex::new(0),
            status_failures: Mutex::new(0),
            action_delay: Mutex::new(Duration::ZERO),
            calls: Mutex::new(Vec::new()),
            probes: Mutex::new(0),
        }
    }

    pub fn with_status(self, status: &str) -> Self {
        *self.status.lock().unwrap() = status.to_string();
        self
    }

    /// Fail the next `count` start calls
    pub fn with_start_failures(self, count: u32) -> Self {
        *self.start_failures.lock().unwrap() = count;
        self
    }

    /// Fail the next `count` status probes
    pub fn with_status_failures(self, count: u32) -> Self {
        *self.status_failures.lock().unwrap() = count;
        self
    }

    /// Make every lifecycle call take `delay`
    pub fn with_action_delay(self, delay: Duration) -> Self {
        *self.action_delay.lock().unwrap() = delay;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn actions(&self) -> Vec<&'static str> {
        self.calls().iter().map(|c| c.action).collect()
    }

    pub fn probes(&self) -> u32 {
        *self.probes.lock().unwrap()
    }

    async fn record(&self, action: &'static str) -> Result<(), HypervisorError> {
        self.calls.lock().unwrap().push(Call {
            action,
            at: Instant::now(),
        });

        let delay = *self.action_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if action == "start" {
            let mut failures = self.start_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(HypervisorError::TaskFailed("start failed".to_string()));
            }
        }

        let next = match action {
            "start" | "restart" | "reset" => STATUS_RUNNING,
            _ => STATUS_STOPPED,
        };
        *self.status.lock().unwrap() = next.to_string();
        Ok(())
    }
}

#[async_trait]
impl VmController for MockVm {
    async fn start(&self, _cancel: &CancellationToken) -> Result<(), HypervisorError> {
        self.record("start").await
    }

    async fn stop(&self, _cancel: &CancellationToken) -> Result<(), HypervisorError> {
        self.record("stop").await
    }

    async fn restart(&self, _cancel: &CancellationToken) -> Result<(), HypervisorError> {
        self.record("restart").await
    }

    async fn reset(&self, _cancel: &CancellationToken) -> Result<(), HypervisorError> {
        self.record("reset").await
    }

    async fn shutdown(&self, _cancel: &CancellationToken) -> Result<(), HypervisorError> {
        self.record("shutdown").await
    }

    async fn status(&self) -> Result<String, HypervisorError> {
        *self.probes.lock().unwrap() += 1;

        let mut failures = self.status_failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(HypervisorError::Api("status 500".to_string()));
        }
        drop(failures);

        Ok(self.status.lock().unwrap().clone())
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }
}

pub fn offline_payload() -> Vec<u8> {
    serde_json::to_vec(&AvailabilityMessage {
        status: AvailabilityStatus::Offline,
    })
    .unwrap()
}

/// Number of offline publishes on `topic`
pub async fn offline_count(events: &MemoryEventsClient, topic: &str) -> usize {
    let offline = offline_payload();
    events
        .published_to(topic)
        .await
        .iter()
        .filter(|p| **p == offline)
        .count()
}

/// Index of the last journal record matching `pred`
pub fn last_index(journal: &[Record], pred: impl Fn(&Record) -> bool) -> Option<usize> {
    journal.iter().rposition(pred)
}
