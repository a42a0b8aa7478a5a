// Home Assistant MQTT discovery integration

mod device;
mod discovery;
mod entity;
mod message;


pub use device::{DeviceTemplate, MqttDevice};
pub use discovery::{Availability, AvailabilityMode, Discovery, SelectConfig, SensorConfig};
pub use entity::{Component, EntityTopics, MqttEntity, TopicLayout};
pub use message::{
    AvailabilityMessage, AvailabilityStatus, CommandMessage, CommandOption, StateMessage,
};
