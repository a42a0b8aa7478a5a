use super::*;
use std::collections::HashMap;
use std::io::Write;

fn valid() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.proxmox.url = "https://pve.example.com:8006".to_string();
    config.proxmox.token_id = "root@pam!bridge".to_string();
    config.proxmox.token_secret = "secret".to_string();
    config
}

#[test]
fn test_default_config() {
    let config = BridgeConfig::default();
    assert_eq!(config.events.backend, EventsBackend::Nats);
    assert_eq!(config.events.url, "nats://localhost:4222");
    assert_eq!(config.hass.discovery_prefix, "homeassistant");
    assert_eq!(config.monitor.probe_interval(), Duration::from_secs(60));
    assert_eq!(config.monitor.availability_interval(), Duration::from_secs(60));
    assert_eq!(config.monitor.shutdown_grace(), Duration::from_secs(1));
    assert!(config.monitor.vm_ids.is_empty());
}

#[test]
fn test_config_deserialization() {
    let toml = r#"
        [proxmox]
        url = "https://pve.example.com:8006"
        token_id = "root@pam!bridge"
        token_secret = "s3cret"
        insecure = true

        [events]
        backend = "memory"

        [hass]
        command_prefix = "lab-bridge"

        [hass.device]
        manufacturer = "example.com"

        [monitor]
        vm_ids = [100, 101]
        probe_interval_secs = 15
    "#;

    let config: BridgeConfig = toml::from_str(toml).unwrap();
    assert!(config.proxmox.insecure);
    assert_eq!(config.events.backend, EventsBackend::Memory);
    assert_eq!(config.hass.command_prefix, "lab-bridge");
    assert_eq!(config.hass.discovery_prefix, "homeassistant"); // Default
    assert_eq!(config.hass.device.manufacturer, "example.com");
    assert_eq!(config.hass.device.model, "Proxmox Home Assistant Bridge"); // Default
    assert_eq!(config.monitor.probe_interval_secs, 15);
    assert_eq!(config.monitor.availability_interval_secs, 60); // Default
    assert!(config.validate().is_ok());
}

#[test]
fn test_monitored_ids_are_a_set() {
    let mut config = valid();
    config.monitor.vm_ids = vec![100, 101, 100];
    let ids = config.monitor.monitored_ids();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains("100"));
    assert!(ids.contains("101"));
}

#[test]
fn test_validate_missing_credentials() {
    assert!(BridgeConfig::default().validate().is_err());

    let mut config = valid();
    config.proxmox.token_secret.clear();
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("secret"));
}

#[test]
fn test_validate_zero_interval() {
    let mut config = valid();
    config.monitor.probe_interval_secs = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_env_overrides() {
    let vars: HashMap<&str, &str> = [
        ("PVEBRIDGE_TOKEN_ID", "ops@pve!ha"),
        ("PVEBRIDGE_INSECURE", "true"),
        ("PVEBRIDGE_VM_IDS", "100, 200,300"),
        ("PVEBRIDGE_PROBE_INTERVAL_SECS", "not-a-number"),
    ]
    .into_iter()
    .collect();

    let mut config = valid();
    config.apply_vars(|key| vars.get(key).map(|v| v.to_string()));

    assert_eq!(config.proxmox.token_id, "ops@pve!ha");
    assert!(config.proxmox.insecure);
    assert_eq!(config.monitor.vm_ids, vec![100, 200, 300]);
    // Unparseable value keeps the previous setting
    assert_eq!(config.monitor.probe_interval_secs, 60);
}

#[test]
fn test_load_config_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
        [monitor]
        vm_ids = [42]
        "#
    )
    .unwrap();

    let config = load_config(file.path()).unwrap();
    assert_eq!(config.monitor.vm_ids, vec![42]);
}

#[test]
fn test_load_config_missing_file() {
    assert!(load_config("/nonexistent/pvebridge.toml").is_err());
}

#[test]
fn test_env_overrides_backend_and_grace() {
    let vars: HashMap<&str, &str> = [
        ("PVEBRIDGE_EVENTS_BACKEND", "MQTT"),
        ("PVEBRIDGE_EVENTS_URL", "mqtt://broker.lan:1883"),
        ("PVEBRIDGE_SHUTDOWN_GRACE_MS", "2500"),
    ]
    .into_iter()
    .collect();

    let mut config = valid();
    config.apply_vars(|key| vars.get(key).map(|v| v.to_string()));

    assert_eq!(config.events.backend, EventsBackend::Mqtt);
    assert_eq!(config.events.url, "mqtt://broker.lan:1883");
    assert_eq!(config.monitor.shutdown_grace(), Duration::from_millis(2500));
    assert!(config.validate().is_ok());
}

#[test]
fn test_env_unknown_backend_is_ignored() {
    let mut config = valid();
    config.apply_vars(|key| (key == "PVEBRIDGE_EVENTS_BACKEND").then(|| "kafka".to_string()));
    assert_eq!(config.events.backend, EventsBackend::Nats);
}

#[test]
fn test_mqtt_section() {
    let toml = r#"
        [proxmox]
        url = "https://pve.example.com:8006"
        token_id = "root@pam!bridge"
        token_secret = "s3cret"

        [events]
        backend = "mqtt"
        url = "mqtt://localhost:1883"
        username = "bridge"
    "#;

    let mut config: BridgeConfig = toml::from_str(toml).unwrap();
    assert_eq!(config.events.backend, EventsBackend::Mqtt);
    assert_eq!(config.events.client_id, "pvebridge"); // Default

    // Credentials come in pairs
    assert!(config.validate().is_err());
    config.events.password = Some("hunter2".to_string());
    assert!(config.validate().is_ok());
}
