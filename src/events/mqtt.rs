use super::{EventsClient, MessageStream, SUBSCRIPTION_CAPACITY};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DEFAULT_MQTT_PORT: u16 = 1883;

/// Requests buffered between the client handle and its event loop
const REQUEST_CAPACITY: usize = 64;

const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Pause before the event loop retries a dropped connection
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// How long disconnect waits for the DISCONNECT packet to go out
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Discovery, state and availability are retained so the hub sees them
/// after its own restart
const RETAIN: bool = true;

type Routes = Arc<Mutex<HashMap<String, mpsc::Sender<Vec<u8>>>>>;

/// MQTT-backed events client.
///
/// One event loop task drives the connection. Inbound publishes are routed by
/// exact topic into per-subscription channels; subscriptions are re-issued
/// after every reconnect.
pub struct MqttEventsClient {
    url: String,
    options: MqttOptions,
    client: RwLock<Option<AsyncClient>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    routes: Routes,
}

impl MqttEventsClient {
    /// Build a client for `mqtt://host[:port]`. Nothing connects until
    /// [`EventsClient::connect`].
    pub fn new(url: &str, client_id: &str, credentials: Option<(String, String)>) -> Result<Self> {
        let (host, port) = parse_broker_url(url)?;

        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(KEEP_ALIVE);
        if let Some((username, password)) = credentials {
            options.set_credentials(username, password);
        }

        Ok(Self {
            url: url.to_string(),
            options,
            client: RwLock::new(None),
            event_loop: Mutex::new(None),
            routes: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn connected(&self) -> Result<AsyncClient> {
        self.client
            .read()
            .await
            .clone()
            .context("MQTT client is not connected")
    }
}

/// Split `mqtt://host:port`, `tcp://host:port`, `host:port` or `host`
pub fn parse_broker_url(url: &str) -> Result<(String, u16)> {
    let rest = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);

    if rest.contains("://") {
        bail!("unsupported MQTT broker URL '{}'", url);
    }

    let rest = rest.trim_end_matches('/');
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid port in MQTT broker URL '{}'", url))?;
            (host, port)
        }
        None => (rest, DEFAULT_MQTT_PORT),
    };

    if host.is_empty() {
        bail!("MQTT broker URL '{}' has no host", url);
    }

    Ok((host.to_string(), port))
}

async fn run_event_loop(mut event_loop: EventLoop, client: AsyncClient, routes: Routes) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let route = routes.lock().await.get(&publish.topic).cloned();
                match route {
                    Some(tx) => {
                        if tx.send(publish.payload.to_vec()).await.is_err() {
                            debug!(topic = %publish.topic, "Receiver dropped, discarding message");
                        }
                    }
                    None => debug!(topic = %publish.topic, "No subscriber for message"),
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                let topics: Vec<String> = routes.lock().await.keys().cloned().collect();
                info!(subscriptions = topics.len(), "MQTT session established");
                for topic in topics {
                    if let Err(e) = client.try_subscribe(topic.clone(), QoS::AtLeastOnce) {
                        warn!(topic = %topic, error = %e, "Failed to restore subscription");
                    }
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT disconnect sent, stopping event loop");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "MQTT connection error, reconnecting");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

#[async_trait]
impl EventsClient for MqttEventsClient {
    async fn connect(&self) -> Result<()> {
        let mut guard = self.client.write().await;
        if guard.is_some() {
            return Ok(());
        }

        info!("Connecting to MQTT broker at {}", self.url);

        let (client, mut event_loop) = AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);

        // The first failure is fatal; later ones are retried by the event loop
        loop {
            let event = event_loop
                .poll()
                .await
                .with_context(|| format!("Failed to connect to MQTT broker at {}", self.url))?;
            if matches!(event, Event::Incoming(Packet::ConnAck(_))) {
                break;
            }
        }

        let handle = tokio::spawn(run_event_loop(
            event_loop,
            client.clone(),
            Arc::clone(&self.routes),
        ));
        *self.event_loop.lock().await = Some(handle);
        *guard = Some(client);

        info!("Connected to MQTT broker");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let client = self.client.write().await.take();
        self.routes.lock().await.clear();

        let handle = self.event_loop.lock().await.take();

        if let Some(client) = client {
            if let Err(e) = client.disconnect().await {
                warn!(error = %e, "Failed to queue MQTT disconnect");
            }
        }

        if let Some(mut handle) = handle {
            if tokio::time::timeout(DISCONNECT_TIMEOUT, &mut handle).await.is_err() {
                warn!("MQTT event loop did not stop in time, aborting");
                handle.abort();
            }
            info!("Disconnected from MQTT broker");
        }

        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let client = self.connected().await?;

        debug!(topic = %topic, bytes = payload.len(), "Publishing message");

        client
            .publish(topic, QoS::AtLeastOnce, RETAIN, payload)
            .await
            .with_context(|| format!("Failed to publish to topic '{}'", topic))
    }

    async fn subscribe(&self, topic: &str) -> Result<MessageStream> {
        let client = self.connected().await?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        if self
            .routes
            .lock()
            .await
            .insert(topic.to_string(), tx)
            .is_some()
        {
            warn!(topic = %topic, "Replacing existing subscription");
        }

        if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
            self.routes.lock().await.remove(topic);
            return Err(e).with_context(|| format!("Failed to subscribe to topic '{}'", topic));
        }

        info!(topic = %topic, "Subscribed");
        Ok(rx)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        if self.routes.lock().await.remove(topic).is_none() {
            bail!("not subscribed to topic '{}'", topic);
        }

        let client = self.connected().await?;
        client
            .unsubscribe(topic)
            .await
            .with_context(|| format!("Failed to unsubscribe from topic '{}'", topic))?;

        info!(topic = %topic, "Unsubscribed");
        Ok(())
    }
}
