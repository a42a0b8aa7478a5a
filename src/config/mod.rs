use crate::hass::{DeviceTemplate, TopicLayout};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

#[cfg(test)]
mod tests;

/// Complete bridge configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub proxmox: ProxmoxConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub hass: HassConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

/// Proxmox VE API access
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxmoxConfig {
    /// Server root, e.g. `https://pve.example.com:8006`
    #[serde(default)]
    pub url: String,
    /// API token ID, e.g. `root@pam!bridge`
    #[serde(default)]
    pub token_id: String,
    #[serde(default)]
    pub token_secret: String,
    /// Skip TLS certificate verification
    #[serde(default)]
    pub insecure: bool,
}

/// Which broker backend carries the hub traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventsBackend {
    Nats,
    /// Home Assistant's native discovery transport
    Mqtt,
    /// Loopback, nothing leaves the process
    Memory,
}

impl std::str::FromStr for EventsBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nats" => Ok(EventsBackend::Nats),
            "mqtt" => Ok(EventsBackend::Mqtt),
            "memory" => Ok(EventsBackend::Memory),
            other => bail!("unknown events backend '{}'", other),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_backend")]
    pub backend: EventsBackend,
    /// Broker URL, `nats://host:port` or `mqtt://host:port`
    #[serde(default = "default_events_url")]
    pub url: String,
    /// MQTT client identifier
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// MQTT credentials; both or neither
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_backend() -> EventsBackend {
    EventsBackend::Nats
}

fn default_events_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_client_id() -> String {
    "pvebridge".to_string()
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: default_events_url(),
            client_id: default_client_id(),
            username: None,
            password: None,
        }
    }
}

/// Home Assistant naming and topic roots
#[derive(Debug, Clone, Deserialize)]
pub struct HassConfig {
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
    /// Root of the stable per-machine device identifiers
    #[serde(default = "default_identifier_prefix")]
    pub identifier_prefix: String,
    #[serde(default)]
    pub device: DeviceTemplate,
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

fn default_command_prefix() -> String {
    "pvebridge".to_string()
}

fn default_identifier_prefix() -> String {
    "pvebridge".to_string()
}

impl Default for HassConfig {
    fn default() -> Self {
        Self {
            discovery_prefix: default_discovery_prefix(),
            command_prefix: default_command_prefix(),
            identifier_prefix: default_identifier_prefix(),
            device: DeviceTemplate::default(),
        }
    }
}

impl HassConfig {
    pub fn topic_layout(&self) -> TopicLayout {
        TopicLayout {
            discovery_prefix: self.discovery_prefix.clone(),
            command_prefix: self.command_prefix.clone(),
        }
    }
}

/// Which machines to expose and how often to refresh them
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub vm_ids: Vec<u64>,
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_availability_interval")]
    pub availability_interval_secs: u64,
    /// Pause after all devices stopped, before disconnecting
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

fn default_probe_interval() -> u64 {
    60
}

fn default_availability_interval() -> u64 {
    60
}

fn default_shutdown_grace() -> u64 {
    1000
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            vm_ids: Vec::new(),
            probe_interval_secs: default_probe_interval(),
            availability_interval_secs: default_availability_interval(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

impl MonitorConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn availability_interval(&self) -> Duration {
        Duration::from_secs(self.availability_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Monitored machine IDs in the string form the hypervisor reports
    pub fn monitored_ids(&self) -> HashSet<String> {
        self.vm_ids.iter().map(|id| id.to_string()).collect()
    }
}

impl BridgeConfig {
    /// Override file values with `PVEBRIDGE_*` environment variables.
    ///
    /// Unparseable values are ignored and the file value is kept.
    pub fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("PVEBRIDGE_PROXMOX_URL") {
            self.proxmox.url = v;
        }
        if let Some(v) = var("PVEBRIDGE_TOKEN_ID") {
            self.proxmox.token_id = v;
        }
        if let Some(v) = var("PVEBRIDGE_TOKEN_SECRET") {
            self.proxmox.token_secret = v;
        }
        if let Some(v) = var("PVEBRIDGE_INSECURE") {
            if let Ok(b) = v.parse::<bool>() {
                self.proxmox.insecure = b;
            }
        }
        if let Some(v) = var("PVEBRIDGE_EVENTS_BACKEND") {
            if let Ok(backend) = v.parse::<EventsBackend>() {
                self.events.backend = backend;
            }
        }
        if let Some(v) = var("PVEBRIDGE_EVENTS_URL") {
            self.events.url = v;
        }
        if let Some(v) = var("PVEBRIDGE_EVENTS_CLIENT_ID") {
            self.events.client_id = v;
        }
        if let Some(v) = var("PVEBRIDGE_EVENTS_USERNAME") {
            self.events.username = Some(v);
        }
        if let Some(v) = var("PVEBRIDGE_EVENTS_PASSWORD") {
            self.events.password = Some(v);
        }
        if let Some(v) = var("PVEBRIDGE_VM_IDS") {
            let ids: Result<Vec<u64>, _> = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::parse::<u64>)
                .collect();
            if let Ok(ids) = ids {
                self.monitor.vm_ids = ids;
            }
        }
        if let Some(v) = var("PVEBRIDGE_PROBE_INTERVAL_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                self.monitor.probe_interval_secs = n;
            }
        }
        if let Some(v) = var("PVEBRIDGE_AVAILABILITY_INTERVAL_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                self.monitor.availability_interval_secs = n;
            }
        }
        if let Some(v) = var("PVEBRIDGE_SHUTDOWN_GRACE_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.monitor.shutdown_grace_ms = n;
            }
        }
    }

    /// Reject configurations the bridge cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.proxmox.url.is_empty() {
            bail!("proxmox server URL not provided");
        }
        if self.proxmox.token_id.is_empty() {
            bail!("proxmox api token not provided");
        }
        if self.proxmox.token_secret.is_empty() {
            bail!("proxmox api secret not provided");
        }
        if self.events.backend != EventsBackend::Memory && self.events.url.is_empty() {
            bail!("events broker URL not provided");
        }
        if self.events.backend == EventsBackend::Mqtt {
            if self.events.client_id.is_empty() {
                bail!("mqtt client_id must not be empty");
            }
            if self.events.username.is_some() != self.events.password.is_some() {
                bail!("mqtt username and password must be set together");
            }
        }
        if self.monitor.probe_interval_secs == 0 {
            bail!("probe_interval_secs must be greater than zero");
        }
        if self.monitor.availability_interval_secs == 0 {
            bail!("availability_interval_secs must be greater than zero");
        }
        Ok(())
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: impl AsRef<Path>) -> Result<BridgeConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: BridgeConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    Ok(config)
}
