use super::vm::ProxmoxVm;
use crate::config::ProxmoxConfig;
use crate::controller::{HypervisorError, VmController, VmInventory};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// How often a running task is polled
pub const DEFAULT_TASK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on waiting for one task
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Every Proxmox API response wraps its payload in `data`
#[derive(Deserialize)]
struct ApiResponse<T> {
    data: T,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Version {
    pub release: String,
    pub version: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NodeStatus {
    pub node: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// Entry of `GET /nodes/{node}/qemu`
#[derive(Clone, Debug, Deserialize)]
pub struct VmSummary {
    pub vmid: u64,
    #[serde(default)]
    pub name: Option<String>,
    pub status: String,
}

#[derive(Clone, Debug, Deserialize)]
struct CurrentStatus {
    status: String,
}

/// Entry of `GET /nodes/{node}/tasks/{upid}/status`
#[derive(Clone, Debug, Deserialize)]
pub struct TaskStatus {
    /// `running` until the task ends, then `stopped`
    pub status: String,
    /// `OK` on success, an error message otherwise
    #[serde(default)]
    pub exitstatus: Option<String>,
}

/// Proxmox VE REST client authenticated with an API token.
///
/// Cheap to clone; clones share the HTTP connection pool and node cache.
#[derive(Clone)]
pub struct ProxmoxClient {
    base_url: String,
    auth_header: String,
    http: reqwest::Client,
    nodes: Arc<Mutex<Option<Vec<NodeStatus>>>>,
    pub(crate) task_poll_interval: Duration,
    pub(crate) task_timeout: Duration,
}

impl ProxmoxClient {
    pub fn new(config: &ProxmoxConfig) -> Result<Self, HypervisorError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .build()?;

        Ok(Self {
            base_url: format!("{}/api2/json", config.url.trim_end_matches('/')),
            auth_header: format!("PVEAPIToken={}={}", config.token_id, config.token_secret),
            http,
            nodes: Arc::new(Mutex::new(None)),
            task_poll_interval: DEFAULT_TASK_POLL_INTERVAL,
            task_timeout: DEFAULT_TASK_TIMEOUT,
        })
    }

    /// Override task polling cadence and timeout
    pub fn with_task_timing(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.task_poll_interval = poll_interval;
        self.task_timeout = timeout;
        self
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        path: &str,
    ) -> Result<T, HypervisorError> {
        let response = request
            .header("Authorization", &self.auth_header)
            .header("Accept", "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            return Err(HypervisorError::Api(format!(
                "{} returned {}: {}",
                path, status, body
            )));
        }

        let body: ApiResponse<T> = response.json().await?;
        Ok(body.data)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, HypervisorError> {
        let url = format!("{}{}", self.base_url, path);
        self.send(self.http.get(&url), path).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str) -> Result<T, HypervisorError> {
        let url = format!("{}{}", self.base_url, path);
        self.send(self.http.post(&url), path).await
    }

    pub async fn version(&self) -> Result<Version, HypervisorError> {
        self.get("/version").await
    }

    /// Cluster nodes; fetched once and cached for the client's lifetime
    pub async fn nodes(&self) -> Result<Vec<NodeStatus>, HypervisorError> {
        let mut cache = self.nodes.lock().await;
        if let Some(nodes) = cache.as_ref() {
            return Ok(nodes.clone());
        }

        let nodes: Vec<NodeStatus> = self.get("/nodes").await?;
        debug!(count = nodes.len(), "Fetched cluster nodes");
        *cache = Some(nodes.clone());
        Ok(nodes)
    }

    pub async fn node_vms(&self, node: &str) -> Result<Vec<VmSummary>, HypervisorError> {
        self.get(&format!("/nodes/{}/qemu", node)).await
    }

    pub async fn vm_status(&self, node: &str, vmid: u64) -> Result<String, HypervisorError> {
        let current: CurrentStatus = self
            .get(&format!("/nodes/{}/qemu/{}/status/current", node, vmid))
            .await?;
        Ok(current.status)
    }

    /// Issue a power action and return the task UPID
    pub async fn vm_action(
        &self,
        node: &str,
        vmid: u64,
        action: &str,
    ) -> Result<String, HypervisorError> {
        self.post(&format!("/nodes/{}/qemu/{}/status/{}", node, vmid, action))
            .await
    }

    pub async fn task_status(&self, node: &str, upid: &str) -> Result<TaskStatus, HypervisorError> {
        self.get(&format!(
            "/nodes/{}/tasks/{}/status",
            node,
            urlencoding::encode(upid)
        ))
        .await
    }
}

#[async_trait]
impl VmInventory for ProxmoxClient {
    /// Every QEMU machine on every node
    async fn list_vms(&self) -> Result<Vec<Arc<dyn VmController>>, HypervisorError> {
        let nodes = self
            .nodes()
            .await
            .map_err(|e| HypervisorError::Listing(e.to_string()))?;

        let mut vms: Vec<Arc<dyn VmController>> = Vec::new();
        for node in &nodes {
            let summaries = self
                .node_vms(&node.node)
                .await
                .map_err(|e| HypervisorError::Listing(format!("node {}: {}", node.node, e)))?;

            for summary in summaries {
                vms.push(Arc::new(ProxmoxVm::new(self.clone(), &node.node, &summary)));
            }
        }

        info!(nodes = nodes.len(), vms = vms.len(), "Listed virtual machines");
        Ok(vms)
    }
}
