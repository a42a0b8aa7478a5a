use super::{EventsClient, MessageStream};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Buffered inbound messages per subscription before the NATS reader waits
pub const SUBSCRIPTION_CAPACITY: usize = 64;

/// NATS-backed events client.
///
/// Home Assistant topics use `/` separators; NATS subjects use `.`. The
/// translation happens here so callers can keep one topic layout for every
/// backend.
pub struct NatsEventsClient {
    url: String,
    client: RwLock<Option<async_nats::Client>>,
    /// Forwarding task per subject; aborting it drops the subscriber
    subscriptions: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl NatsEventsClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: RwLock::new(None),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    async fn connected(&self) -> Result<async_nats::Client> {
        self.client
            .read()
            .await
            .clone()
            .context("NATS client is not connected")
    }
}

/// Convert a `/`-separated topic into a NATS subject
pub fn subject_for(topic: &str) -> String {
    topic.replace('/', ".")
}

#[async_trait]
impl EventsClient for NatsEventsClient {
    async fn connect(&self) -> Result<()> {
        let mut guard = self.client.write().await;
        if guard.is_some() {
            return Ok(());
        }

        info!("Connecting to NATS at {}", self.url);

        let client = async_nats::connect(&self.url)
            .await
            .context("Failed to connect to NATS")?;

        *guard = Some(client);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let client = self.client.write().await.take();

        let mut subs = self.subscriptions.lock().await;
        for (_, handle) in subs.drain() {
            handle.abort();
        }

        if let Some(client) = client {
            client
                .flush()
                .await
                .context("Failed to flush NATS client on disconnect")?;
            info!("Disconnected from NATS");
        }

        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let client = self.connected().await?;
        let subject = subject_for(topic);

        debug!(subject = %subject, bytes = payload.len(), "Publishing message");

        client
            .publish(subject.clone(), payload.into())
            .await
            .with_context(|| format!("Failed to publish to subject '{}'", subject))?;

        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<MessageStream> {
        let client = self.connected().await?;
        let subject = subject_for(topic);

        debug!(subject = %subject, "Subscribing to subject");

        let mut subscriber = client
            .subscribe(subject.clone())
            .await
            .with_context(|| format!("Failed to subscribe to subject '{}'", subject))?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let forward_subject = subject.clone();
        let handle = tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                if tx.send(message.payload.to_vec()).await.is_err() {
                    debug!(subject = %forward_subject, "Receiver dropped, ending forwarder");
                    break;
                }
            }
        });

        if let Some(previous) = self.subscriptions.lock().await.insert(subject.clone(), handle) {
            warn!(subject = %subject, "Replacing existing subscription");
            previous.abort();
        }

        info!(subject = %subject, "Subscribed");
        Ok(rx)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let subject = subject_for(topic);

        let handle = self
            .subscriptions
            .lock()
            .await
            .remove(&subject)
            .with_context(|| format!("Not subscribed to subject '{}'", subject))?;

        handle.abort();
        info!(subject = %subject, "Unsubscribed");
        Ok(())
    }
}
