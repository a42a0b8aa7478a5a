use serde::{Deserialize, Serialize};

/// Branding applied to every machine's device descriptor.
///
/// Loaded from the `[hass.device]` config section so deployments can rename
/// the bridge without rebuilding it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceTemplate {
    #[serde(default = "default_manufacturer")]
    pub manufacturer: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_version")]
    pub hw_version: String,
    #[serde(default = "default_sw_version")]
    pub sw_version: String,
}

fn default_manufacturer() -> String {
    "pvebridge".to_string()
}

fn default_model() -> String {
    "Proxmox Home Assistant Bridge".to_string()
}

fn default_name() -> String {
    "pvebridge".to_string()
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_sw_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

impl Default for DeviceTemplate {
    fn default() -> Self {
        Self {
            manufacturer: default_manufacturer(),
            model: default_model(),
            name: default_name(),
            hw_version: default_version(),
            sw_version: default_sw_version(),
        }
    }
}

/// Device block of a discovery document.
///
/// Ties all entities of one machine together in the hub's device registry.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MqttDevice {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration_url: Option<String>,
    #[serde(rename = "connections", skip_serializing_if = "Vec::is_empty", default)]
    pub connections: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hw_version: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub identifiers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_area: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sw_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub via_device: Option<String>,
}

impl MqttDevice {
    /// Descriptor for one virtual machine.
    ///
    /// The name `vm-<id>-<name>` is also the topic segment for all of the
    /// machine's entities, so it must stay stable across restarts.
    pub fn for_vm(template: &DeviceTemplate, identifier_prefix: &str, id: &str, name: &str) -> Self {
        Self {
            identifiers: vec![format!("{}/vms/{}-{}", identifier_prefix, id, name)],
            manufacturer: Some(template.manufacturer.clone()),
            model: Some(template.model.clone()),
            hw_version: Some(template.hw_version.clone()),
            sw_version: Some(template.sw_version.clone()),
            name: format!("vm-{}-{}", id, name),
            ..Default::default()
        }
    }
}
