use anyhow::{Context, Result};
use pvebridge::config::{load_config, BridgeConfig, EventsBackend};
use pvebridge::events::{EventsClient, MemoryEventsClient, MqttEventsClient, NatsEventsClient};
use pvebridge::proxmox::ProxmoxClient;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use vm_manager::shutdown::shutdown_requested;
use vm_manager::{BridgeServer, DeviceSettings};

const DEFAULT_CONFIG_PATH: &str = "pvebridge.toml";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vm_manager=info,pvebridge=info".into()),
        )
        .init();

    info!("VM manager starting...");

    let mut config = read_config()?;
    config.apply_env();
    config.validate().context("Invalid configuration")?;

    info!(
        proxmox_url = %config.proxmox.url,
        events_backend = ?config.events.backend,
        events_url = %config.events.url,
        vm_ids = ?config.monitor.vm_ids,
        "Configuration loaded"
    );

    let proxmox =
        ProxmoxClient::new(&config.proxmox).context("Failed to create Proxmox client")?;
    let version = proxmox
        .version()
        .await
        .context("Failed to reach Proxmox API")?;
    info!(release = %version.release, version = %version.version, "Connected to Proxmox");

    let events: Arc<dyn EventsClient> = match config.events.backend {
        EventsBackend::Nats => Arc::new(NatsEventsClient::new(&config.events.url)),
        EventsBackend::Mqtt => {
            let credentials = config
                .events
                .username
                .clone()
                .zip(config.events.password.clone());
            Arc::new(
                MqttEventsClient::new(&config.events.url, &config.events.client_id, credentials)
                    .context("Invalid MQTT broker settings")?,
            )
        }
        EventsBackend::Memory => {
            warn!("Using in-memory events backend, nothing will reach the broker");
            Arc::new(MemoryEventsClient::new())
        }
    };

    let server = BridgeServer::new(
        Arc::new(proxmox),
        events,
        config.monitor.monitored_ids(),
        DeviceSettings::from_config(&config),
    )
    .with_shutdown_grace(config.monitor.shutdown_grace());

    server.run(shutdown_requested()).await?;

    info!("VM manager stopped");
    Ok(())
}

/// `PVEBRIDGE_CONFIG`, else `pvebridge.toml` when present, else defaults
fn read_config() -> Result<BridgeConfig> {
    if let Ok(path) = std::env::var("PVEBRIDGE_CONFIG") {
        info!(path = %path, "Loading configuration");
        return load_config(&path);
    }

    if Path::new(DEFAULT_CONFIG_PATH).exists() {
        info!(path = DEFAULT_CONFIG_PATH, "Loading configuration");
        return load_config(DEFAULT_CONFIG_PATH);
    }

    info!("No configuration file, using defaults and environment");
    Ok(BridgeConfig::default())
}
