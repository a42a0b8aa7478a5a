use super::device::MqttDevice;
use serde::{Deserialize, Serialize};

/// Template extracting the availability field from `{"status": ...}`
pub const AVAILABILITY_VALUE_TEMPLATE: &str = "{{ value_json.status }}";

/// Template extracting the state field from `{"state": ...}`
pub const STATE_VALUE_TEMPLATE: &str = "{{ value_json.state }}";

/// Exposes the whole state payload as entity attributes
pub const JSON_ATTRIBUTES_TEMPLATE: &str = "{{ value_json | tojson }}";

/// Wraps the selected option into a command message
pub const COMMAND_TEMPLATE: &str = r#"{ "command": "{{ value }}" }"#;

/// One availability topic entry of a discovery document
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Availability {
    pub payload_available: String,
    pub payload_not_available: String,
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_template: Option<String>,
}

/// How the hub combines several availability topics.
///
/// With `Latest`, whichever availability payload arrived last wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AvailabilityMode {
    Any,
    All,
    Latest,
}

/// Discovery document for a sensor entity
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    pub availability: Vec<Availability>,
    pub availability_mode: AvailabilityMode,
    pub device: MqttDevice,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub json_attributes_template: String,
    pub json_attributes_topic: String,
    pub name: String,
    pub state_topic: String,
    pub unique_id: String,
    pub value_template: String,
}

/// Discovery document for a select entity
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelectConfig {
    pub availability: Vec<Availability>,
    pub availability_mode: AvailabilityMode,
    pub command_template: String,
    pub command_topic: String,
    pub device: MqttDevice,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub json_attributes_template: String,
    pub json_attributes_topic: String,
    pub name: String,
    pub options: Vec<String>,
    pub qos: u8,
    pub state_topic: String,
    pub unique_id: String,
    pub value_template: String,
}

/// Either kind of discovery document, serialized without a tag
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Discovery {
    Sensor(SensorConfig),
    Select(SelectConfig),
}
