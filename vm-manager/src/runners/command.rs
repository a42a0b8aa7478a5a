//! Lifecycle command select loop.
//!
//! Consumes `{"command": ...}` payloads from the select's command topic and
//! turns them into controller calls, one at a time.

use crate::entity::{announce, publish_offline, Entity, EntitySettings, ExitReason, StopSignal};
use async_trait::async_trait;
use pvebridge::controller::{HypervisorError, VmController, STATUS_RUNNING, STATUS_STOPPED};
use pvebridge::events::{EventsClient, MessageStream};
use pvebridge::hass::{
    CommandMessage, CommandOption, MqttDevice, MqttEntity, StateMessage, TopicLayout,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const SELECT_NAME: &str = "Command";
pub const SELECT_SLUG: &str = "vm-command";
const SELECT_ICON: &str = "mdi:light-switch-off";

/// Start attempts before giving up
pub const MAX_START_ATTEMPTS: u32 = 5;

/// What woke the loop
enum Wake {
    Exit(ExitReason),
    Heartbeat,
    Command(Option<Vec<u8>>),
}

pub struct VmCommandSelect {
    vm: Arc<dyn VmController>,
    entity: MqttEntity,
    settings: EntitySettings,
    stop: StopSignal,
}

impl VmCommandSelect {
    pub fn new(
        vm: Arc<dyn VmController>,
        events: Arc<dyn EventsClient>,
        device: &MqttDevice,
        layout: &TopicLayout,
        settings: EntitySettings,
    ) -> Self {
        let options = CommandOption::ALL
            .iter()
            .map(|option| option.as_str().to_string())
            .collect();

        let entity = MqttEntity::select(
            SELECT_NAME,
            SELECT_SLUG,
            Some(SELECT_ICON),
            options,
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

    async fn subscribe(&self) -> Option<MessageStream> {
        match self.entity.subscribe_command().await {
            Ok(stream) => Some(stream),
            Err(e) => {
                error!(
                    vm = %self.vm.name(),
                    error = %e,
                    "Failed to subscribe to command topic, retrying on next heartbeat"
                );
                None
            }
        }
    }

    /// Handle one inbound payload. Returns an exit reason when a stop or
    /// cancellation arrived while the command was in flight.
    async fn handle_payload(&self, payload: &[u8], cancel: &CancellationToken) -> Option<ExitReason> {
        let message: CommandMessage = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    vm = %self.vm.name(),
                    payload = %String::from_utf8_lossy(payload),
                    error = %e,
                    "Discarding malformed command"
                );
                return None;
            }
        };

        let command = message.command;
        info!(vm = %self.vm.name(), command = %command, "Received command");

        let echo = StateMessage {
            state: command.to_string(),
        };
        if let Err(e) = self.entity.publish_state(&echo).await {
            error!(vm = %self.vm.name(), error = %e, "Failed to publish command state");
        }

        tokio::select! {
            biased;
            _ = self.stop.requested() => {
                warn!(vm = %self.vm.name(), command = %command, "Stop requested, abandoning command");
                Some(ExitReason::Stopped)
            }
            _ = cancel.cancelled() => {
                warn!(vm = %self.vm.name(), command = %command, "Cancelled, abandoning command");
                Some(ExitReason::Cancelled)
            }
            result = self.dispatch(command, cancel) => {
                match result {
                    Ok(()) => info!(vm = %self.vm.name(), command = %command, "Command handled"),
                    Err(e) => error!(vm = %self.vm.name(), command = %command, error = %e, "Command failed"),
                }
                None
            }
        }
    }

    /// Run one command against the controller.
    ///
    /// The current status is probed first: `start` is skipped when the
    /// machine is running, every other command when it is stopped. When the
    /// probe fails nothing is sent and the probe error is returned.
    pub async fn dispatch(
        &self,
        command: CommandOption,
        cancel: &CancellationToken,
    ) -> Result<(), HypervisorError> {
        match self.vm.status().await {
            Ok(status) if already_satisfied(command, &status) => {
                info!(
                    vm = %self.vm.name(),
                    command = %command,
                    status = %status,
                    "Vm already in target state, skipping command"
                );
                return Ok(());
            }
            Ok(status) => {
                debug!(vm = %self.vm.name(), status = %status, "Probed status before command")
            }
            Err(e) => {
                error!(
                    vm = %self.vm.name(),
                    command = %command,
                    error = %e,
                    "Failed to get vm status, skipping command"
                );
                return Err(e);
            }
        }

        match command {
            CommandOption::Start => self.start_with_retry(cancel).await,
            CommandOption::Stop => self.vm.stop(cancel).await,
            CommandOption::Reboot => self.vm.restart(cancel).await,
            CommandOption::Reset => self.vm.reset(cancel).await,
            CommandOption::Shutdown => self.vm.shutdown(cancel).await,
        }
    }

    /// After failed attempt `i` (0-based) wait `i` seconds, up to
    /// [`MAX_START_ATTEMPTS`] attempts in total.
    async fn start_with_retry(&self, cancel: &CancellationToken) -> Result<(), HypervisorError> {
        let mut attempt: u32 = 0;

        loop {
            let err = match self.vm.start(cancel).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            attempt += 1;
            if attempt >= MAX_START_ATTEMPTS || matches!(err, HypervisorError::Cancelled) {
                error!(vm = %self.vm.name(), attempts = attempt, error = %err, "Start failed");
                return Err(err);
            }

            let backoff = Duration::from_secs(u64::from(attempt - 1));
            warn!(
                vm = %self.vm.name(),
                attempt = attempt,
                backoff_secs = backoff.as_secs(),
                error = %err,
                "Start attempt failed, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(HypervisorError::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }
}

fn already_satisfied(command: CommandOption, status: &str) -> bool {
    match command {
        CommandOption::Start => status == STATUS_RUNNING,
        _ => status == STATUS_STOPPED,
    }
}

async fn next_command(stream: &mut Option<MessageStream>) -> Option<Vec<u8>> {
    match stream {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl Entity for VmCommandSelect {
    fn name(&self) -> &str {
        self.entity.name()
    }

    async fn run(&self, cancel: CancellationToken) {
        let vm = self.vm.name();
        let ack = self.stop.acknowledge_on_drop();

        info!(vm = %vm, "Starting vm command select");

        announce(&self.entity, vm).await;
        let mut commands = self.subscribe().await;

        let mut heartbeat = interval_at(
            Instant::now() + self.settings.availability_interval,
            self.settings.availability_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            let wake = tokio::select! {
                biased;
                _ = self.stop.requested() => Wake::Exit(ExitReason::Stopped),
                _ = cancel.cancelled() => Wake::Exit(ExitReason::Cancelled),
                _ = heartbeat.tick() => Wake::Heartbeat,
                payload = next_command(&mut commands) => Wake::Command(payload),
            };

            match wake {
                Wake::Exit(reason) => break reason,
                Wake::Heartbeat => {
                    announce(&self.entity, vm).await;
                    if commands.is_none() {
                        commands = self.subscribe().await;
                    }
                }
                Wake::Command(Some(payload)) => {
                    if let Some(reason) = self.handle_payload(&payload, &cancel).await {
                        break reason;
                    }
                }
                Wake::Command(None) => {
                    warn!(vm = %vm, "Command stream closed, resubscribing on next heartbeat");
                    commands = None;
                }
            }
        };

        if commands.take().is_some() {
            if let Err(e) = self.entity.unsubscribe_command().await {
                error!(vm = %vm, error = %e, "Failed to unsubscribe from command topic");
            }
        }

        publish_offline(&self.entity, vm).await;
        drop(ack);

        info!(vm = %vm, reason = ?reason, "Vm command select stopped");
    }

    async fn stop(&self) {
        info!(vm = %self.vm.name(), "Stopping vm command select");
        if !self.stop.request_and_wait().await {
            debug!(vm = %self.vm.name(), "Vm command select already stopped");
        }
    }
}
