use super::client::ProxmoxClient;
use crate::controller::HypervisorError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Exit status Proxmox reports for a successful task
const TASK_OK: &str = "OK";

impl ProxmoxClient {
    /// Wait for an asynchronous task to finish.
    ///
    /// Polls the task until it reaches `stopped`. A non-`OK` exit status is a
    /// [`HypervisorError::TaskFailed`]; exceeding the task timeout is a
    /// [`HypervisorError::Timeout`]. Cancellation wins over both and returns
    /// [`HypervisorError::Cancelled`] immediately.
    pub async fn wait_task(
        &self,
        node: &str,
        upid: &str,
        cancel: &CancellationToken,
    ) -> Result<(), HypervisorError> {
        debug!(
            node = %node,
            task = %upid,
            max_wait_secs = self.task_timeout.as_secs(),
            "Waiting for task to complete"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(node = %node, task = %upid, "Task wait cancelled");
                Err(HypervisorError::Cancelled)
            }
            result = tokio::time::timeout(self.task_timeout, self.poll_until_stopped(node, upid)) => match result {
                Ok(outcome) => outcome,
                Err(_) => Err(HypervisorError::Timeout(self.task_timeout)),
            },
        }
    }

    async fn poll_until_stopped(&self, node: &str, upid: &str) -> Result<(), HypervisorError> {
        loop {
            let task = self.task_status(node, upid).await?;
            if task.status == "stopped" {
                return match task.exitstatus.as_deref() {
                    Some(TASK_OK) => Ok(()),
                    Some(other) => Err(HypervisorError::TaskFailed(other.to_string())),
                    None => Err(HypervisorError::TaskFailed("no exit status".to_string())),
                };
            }
            tokio::time::sleep(self.task_poll_interval).await;
        }
    }
}
