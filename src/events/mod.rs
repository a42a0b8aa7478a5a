// Pub/sub transport used by the entity loops

mod memory;
mod mqtt;
mod nats;

pub use memory::{MemoryEventsClient, Record};
pub use mqtt::MqttEventsClient;
pub use nats::{NatsEventsClient, SUBSCRIPTION_CAPACITY};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Inbound payloads for one subscribed topic.
pub type MessageStream = mpsc::Receiver<Vec<u8>>;

/// Publish/subscribe client shared by every entity of every machine.
///
/// Implementations must tolerate concurrent calls from many tasks. Topics are
/// always given in `/`-separated form; backends translate as needed.
#[async_trait]
pub trait EventsClient: Send + Sync {
    /// Connect to the broker
    async fn connect(&self) -> Result<()>;

    /// Disconnect from the broker, flushing pending publishes
    async fn disconnect(&self) -> Result<()>;

    /// Publish a payload to a topic
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Subscribe to a topic
    async fn subscribe(&self, topic: &str) -> Result<MessageStream>;

    /// Drop a subscription made with [`EventsClient::subscribe`]
    async fn unsubscribe(&self, topic: &str) -> Result<()>;
}
