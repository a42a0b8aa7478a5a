use super::device::MqttDevice;
use super::discovery::{
    Availability, AvailabilityMode, Discovery, SelectConfig, SensorConfig,
    AVAILABILITY_VALUE_TEMPLATE, COMMAND_TEMPLATE, JSON_ATTRIBUTES_TEMPLATE, STATE_VALUE_TEMPLATE,
};
use super::message::{AvailabilityMessage, AvailabilityStatus};
use crate::events::{EventsClient, MessageStream};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// QoS requested for command intake
const COMMAND_QOS: u8 = 1;

/// Where discovery documents and command topics live
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TopicLayout {
    /// Hub discovery root, normally `homeassistant`
    pub discovery_prefix: String,
    /// Root for command intake topics, outside the discovery tree
    pub command_prefix: String,
}

impl Default for TopicLayout {
    fn default() -> Self {
        Self {
            discovery_prefix: "homeassistant".to_string(),
            command_prefix: "pvebridge".to_string(),
        }
    }
}

/// Hub component type of an entity; the second discovery topic segment
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Component {
    Sensor,
    Select,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Sensor => "sensor",
            Component::Select => "select",
        }
    }
}

/// Topics of one entity, derived from device name and entity slug
#[derive(Clone, Debug, PartialEq)]
pub struct EntityTopics {
    pub config: String,
    pub state: String,
    pub availability: String,
    pub command: Option<String>,
}

impl EntityTopics {
    pub fn new(layout: &TopicLayout, component: Component, device_name: &str, slug: &str) -> Self {
        let prefix = format!(
            "{}/{}/{}/{}",
            layout.discovery_prefix,
            component.as_str(),
            device_name,
            slug
        );

        let command = match component {
            Component::Select => Some(format!(
                "{}/{}/{}/command",
                layout.command_prefix, device_name, slug
            )),
            Component::Sensor => None,
        };

        Self {
            config: format!("{}/config", prefix),
            state: format!("{}/state", prefix),
            availability: format!("{}/availability", prefix),
            command,
        }
    }
}

fn availability_for(topics: &EntityTopics) -> Vec<Availability> {
    vec![Availability {
        payload_available: AvailabilityStatus::Online.as_str().to_string(),
        payload_not_available: AvailabilityStatus::Offline.as_str().to_string(),
        topic: topics.availability.clone(),
        value_template: Some(AVAILABILITY_VALUE_TEMPLATE.to_string()),
    }]
}

fn unique_id(device: &MqttDevice, slug: &str) -> String {
    format!(
        "{}/pvebridge/{}/{}",
        device.manufacturer.as_deref().unwrap_or_default(),
        device.name,
        slug
    )
}

/// Publishing side of one hub entity.
///
/// Owns the entity's topics and discovery document and shares the events
/// client with every other entity. Holds no loop state; the runners in
/// `vm-manager` drive it.
pub struct MqttEntity {
    name: String,
    topics: EntityTopics,
    discovery: Discovery,
    events: Arc<dyn EventsClient>,
}

impl MqttEntity {
    /// Sensor entity publishing `{"state": ...}`
    pub fn sensor(
        name: &str,
        slug: &str,
        icon: Option<&str>,
        device: &MqttDevice,
        layout: &TopicLayout,
        events: Arc<dyn EventsClient>,
    ) -> Self {
        let topics = EntityTopics::new(layout, Component::Sensor, &device.name, slug);

        let discovery = Discovery::Sensor(SensorConfig {
            availability: availability_for(&topics),
            availability_mode: AvailabilityMode::Latest,
            device: device.clone(),
            icon: icon.map(str::to_string),
            json_attributes_template: JSON_ATTRIBUTES_TEMPLATE.to_string(),
            json_attributes_topic: topics.state.clone(),
            name: name.to_string(),
            state_topic: topics.state.clone(),
            unique_id: unique_id(device, slug),
            value_template: STATE_VALUE_TEMPLATE.to_string(),
        });

        Self {
            name: name.to_string(),
            topics,
            discovery,
            events,
        }
    }

    /// Select entity accepting one of `options` on its command topic
    pub fn select(
        name: &str,
        slug: &str,
        icon: Option<&str>,
        options: Vec<String>,
        device: &MqttDevice,
        layout: &TopicLayout,
        events: Arc<dyn EventsClient>,
    ) -> Self {
        let topics = EntityTopics::new(layout, Component::Select, &device.name, slug);
        let command_topic = topics.command.clone().unwrap_or_default();

        let discovery = Discovery::Select(SelectConfig {
            availability: availability_for(&topics),
            availability_mode: AvailabilityMode::Latest,
            command_template: COMMAND_TEMPLATE.to_string(),
            command_topic,
            device: device.clone(),
            icon: icon.map(str::to_string),
            json_attributes_template: JSON_ATTRIBUTES_TEMPLATE.to_string(),
            json_attributes_topic: topics.state.clone(),
            name: name.to_string(),
            options,
            qos: COMMAND_QOS,
            state_topic: topics.state.clone(),
            unique_id: unique_id(device, slug),
            value_template: STATE_VALUE_TEMPLATE.to_string(),
        });

        Self {
            name: name.to_string(),
            topics,
            discovery,
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topics(&self) -> &EntityTopics {
        &self.topics
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    /// Publish the discovery document
    pub async fn publish_config(&self) -> Result<()> {
        debug!(topic = %self.topics.config, entity = %self.name, "Publishing config");

        let payload =
            serde_json::to_vec(&self.discovery).context("Failed to serialize discovery document")?;
        self.events.publish(&self.topics.config, payload).await
    }

    /// Publish a state payload
    pub async fn publish_state<M: Serialize>(&self, message: &M) -> Result<()> {
        debug!(topic = %self.topics.state, entity = %self.name, "Publishing state");

        let payload = serde_json::to_vec(message).context("Failed to serialize state message")?;
        self.events.publish(&self.topics.state, payload).await
    }

    /// Publish `{"status": "online"|"offline"}`
    pub async fn publish_availability(&self, status: AvailabilityStatus) -> Result<()> {
        debug!(
            topic = %self.topics.availability,
            entity = %self.name,
            status = status.as_str(),
            "Publishing availability"
        );

        let payload = serde_json::to_vec(&AvailabilityMessage { status })
            .context("Failed to serialize availability message")?;
        self.events.publish(&self.topics.availability, payload).await
    }

    pub async fn subscribe_command(&self) -> Result<MessageStream> {
        let topic = self
            .topics
            .command
            .as_deref()
            .context("Entity has no command topic")?;
        self.events.subscribe(topic).await
    }

    pub async fn unsubscribe_command(&self) -> Result<()> {
        let topic = self
            .topics
            .command
            .as_deref()
            .context("Entity has no command topic")?;
        self.events.unsubscribe(topic).await
    }
}
