use super::{EventsClient, MessageStream, SUBSCRIPTION_CAPACITY};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// One outbound operation seen by [`MemoryEventsClient`], in call order.
#[derive(Clone, Debug, PartialEq)]
pub enum Record {
    Publish { topic: String, payload: Vec<u8> },
    Subscribe { topic: String },
    Unsubscribe { topic: String },
}

/// Loopback events client.
///
/// Nothing leaves the process: publishes are journaled, subscriptions get a
/// channel that [`MemoryEventsClient::inject`] feeds. Backs the `memory`
/// transport (dry runs against a real hypervisor) and the test suites.
#[derive(Default)]
pub struct MemoryEventsClient {
    journal: Mutex<Vec<Record>>,
    subscribers: Mutex<HashMap<String, mpsc::Sender<Vec<u8>>>>,
    connected: AtomicBool,
    fail_publish: AtomicBool,
    fail_subscribe: AtomicBool,
}

impl MemoryEventsClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent publish fail (transport outage simulation)
    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent subscribe fail
    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Drop the sender behind `topic` so its stream ends, as when the
    /// broker connection is lost. Returns false when nobody is subscribed.
    pub async fn close_stream(&self, topic: &str) -> bool {
        self.subscribers.lock().await.remove(topic).is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Deliver an inbound payload to the subscriber of `topic`.
    ///
    /// Returns false when nobody is subscribed or the receiver is gone.
    pub async fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) -> bool {
        let sender = self.subscribers.lock().await.get(topic).cloned();
        match sender {
            Some(tx) => tx.send(payload.into()).await.is_ok(),
            None => false,
        }
    }

    /// Full operation journal in call order
    pub async fn journal(&self) -> Vec<Record> {
        self.journal.lock().await.clone()
    }

    /// Payloads published to `topic`, oldest first
    pub async fn published_to(&self, topic: &str) -> Vec<Vec<u8>> {
        self.journal
            .lock()
            .await
            .iter()
            .filter_map(|record| match record {
                Record::Publish { topic: t, payload } if t == topic => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn is_subscribed(&self, topic: &str) -> bool {
        self.subscribers.lock().await.contains_key(topic)
    }
}

#[async_trait]
impl EventsClient for MemoryEventsClient {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.subscribers.lock().await.clear();
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            bail!("publish to '{}' rejected", topic);
        }

        debug!(
            topic = %topic,
            payload = %String::from_utf8_lossy(&payload),
            "Loopback publish"
        );

        self.journal.lock().await.push(Record::Publish {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<MessageStream> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            bail!("subscribe to '{}' rejected", topic);
        }

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        self.subscribers.lock().await.insert(topic.to_string(), tx);
        self.journal.lock().await.push(Record::Subscribe {
            topic: topic.to_string(),
        });
        Ok(rx)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        if self.subscribers.lock().await.remove(topic).is_none() {
            bail!("not subscribed to topic '{}'", topic);
        }
        self.journal.lock().await.push(Record::Unsubscribe {
            topic: topic.to_string(),
        });
        Ok(())
    }
}
