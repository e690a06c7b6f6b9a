//! In-process message bus
//!
//! A bus whose topics live in a `DashMap` of routes. It implements discovery,
//! transport and client capabilities so the ingestion service and the egress
//! adapter can run without an external broker.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{BusDiscovery, BusTransport, MsgbusClient, Publisher, Subscriber};
use crate::{
    error::{BridgeError, BridgeResult},
    types::{EndpointContext, Envelope, OutboundMessage},
};

/// Capacity of each subscription's message and error channels
pub const SUBSCRIPTION_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Route {
    id: u64,
    messages: mpsc::Sender<Envelope>,
    errors: mpsc::Sender<BridgeError>,
}

#[derive(Debug, Default)]
struct BusState {
    subscribers: RwLock<Vec<EndpointContext>>,
    publishers: DashMap<String, EndpointContext>,
    routes: DashMap<String, Vec<Route>>,
    published: DashMap<String, Vec<OutboundMessage>>,
    failing_topics: DashMap<String, ()>,
    failing_connects: DashMap<String, ()>,
    next_route: AtomicU64,
    connections: AtomicUsize,
    closed_clients: AtomicUsize,
    fail_connect: AtomicBool,
    fail_publish: AtomicBool,
    fail_publisher: AtomicBool,
}

impl BusState {
    fn remove_route(&self, topic: &str, id: u64) {
        if let Some(mut routes) = self.routes.get_mut(topic) {
            routes.retain(|route| route.id != id);
        }
    }
}

/// In-process bus shared by cloning
#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    state: Arc<BusState>,
}

fn endpoint(name: &str, topics: &[&str]) -> EndpointContext {
    EndpointContext {
        name: name.to_string(),
        msgbus_config: json!({ "type": "memory", "name": name }),
        topics: topics.iter().map(ToString::to_string).collect(),
        endpoints: vec![format!("memory://{name}")],
    }
}

impl MemoryBus {
    /// Create an empty bus
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber reading `topics`
    #[must_use]
    pub fn with_subscriber(self, name: &str, topics: &[&str]) -> Self {
        self.state.subscribers.write().push(endpoint(name, topics));
        self
    }

    /// Register a publisher writing `topics`
    #[must_use]
    pub fn with_publisher(self, name: &str, topics: &[&str]) -> Self {
        self.state
            .publishers
            .insert(name.to_string(), endpoint(name, topics));
        self
    }

    /// Deliver `envelope` to every subscription of `topic`, returning how
    /// many subscriptions received it
    pub async fn publish(&self, topic: &str, envelope: Envelope) -> usize {
        let senders: Vec<_> = self
            .state
            .routes
            .get(topic)
            .map(|routes| routes.iter().map(|r| r.messages.clone()).collect())
            .unwrap_or_default();

        let mut delivered = 0;
        for sender in senders {
            if sender.send(envelope.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Raise a transport read error on every subscription of `topic`
    pub async fn inject_error(&self, topic: &str, reason: &str) -> usize {
        let senders: Vec<_> = self
            .state
            .routes
            .get(topic)
            .map(|routes| routes.iter().map(|r| r.errors.clone()).collect())
            .unwrap_or_default();

        let mut delivered = 0;
        for sender in senders {
            if sender
                .send(BridgeError::transport("receive", reason))
                .await
                .is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }

    /// End every subscription of `topic`
    pub fn close_topic(&self, topic: &str) {
        self.state.routes.remove(topic);
    }

    /// Open subscriptions on `topic`
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.state.routes.get(topic).map_or(0, |routes| routes.len())
    }

    /// Messages published on `topic` so far
    #[must_use]
    pub fn published(&self, topic: &str) -> Vec<OutboundMessage> {
        self.state
            .published
            .get(topic)
            .map(|messages| messages.clone())
            .unwrap_or_default()
    }

    /// Make subscribing to `topic` fail
    pub fn fail_topic(&self, topic: &str) {
        self.state.failing_topics.insert(topic.to_string(), ());
    }

    /// Make every connect attempt fail
    pub fn set_fail_connect(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Make connecting with the configuration of endpoint `name` fail
    pub fn fail_connect_for(&self, name: &str) {
        self.state.failing_connects.insert(name.to_string(), ());
    }

    /// Make creating publishers fail
    pub fn set_fail_publisher(&self, fail: bool) {
        self.state.fail_publisher.store(fail, Ordering::SeqCst);
    }

    /// Make every publish fail
    pub fn set_fail_publish(&self, fail: bool) {
        self.state.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Clients connected so far
    #[must_use]
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Clients closed so far
    #[must_use]
    pub fn closed_clients(&self) -> usize {
        self.state.closed_clients.load(Ordering::SeqCst)
    }
}

impl BusDiscovery for MemoryBus {
    fn num_subscribers(&self) -> BridgeResult<usize> {
        Ok(self.state.subscribers.read().len())
    }

    fn subscriber_by_index(&self, index: usize) -> BridgeResult<EndpointContext> {
        self.state
            .subscribers
            .read()
            .get(index)
            .cloned()
            .ok_or_else(|| BridgeError::configuration(format!("No subscriber at index {index}")))
    }

    fn publisher_by_name(&self, name: &str) -> BridgeResult<EndpointContext> {
        self.state
            .publishers
            .get(name)
            .map(|ctx| ctx.value().clone())
            .ok_or_else(|| BridgeError::configuration(format!("No publisher named {name}")))
    }
}

#[async_trait]
impl BusTransport for MemoryBus {
    async fn connect(&self, config: &serde_json::Value) -> BridgeResult<Arc<dyn MsgbusClient>> {
        let endpoint = config.get("name").and_then(serde_json::Value::as_str);
        let refused = endpoint.is_some_and(|name| self.state.failing_connects.contains_key(name));
        if refused || self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(BridgeError::transport(
                "connect",
                format!("Connection refused for {config}"),
            ));
        }
        self.state.connections.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(MemoryClient {
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }
}

#[derive(Debug)]
struct MemoryClient {
    state: Arc<BusState>,
    closed: AtomicBool,
}

impl MemoryClient {
    fn ensure_open(&self, operation: &str) -> BridgeResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::transport(operation, "Client is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl MsgbusClient for MemoryClient {
    async fn new_publisher(&self, topic: &str) -> BridgeResult<Box<dyn Publisher>> {
        self.ensure_open("new_publisher")?;
        if self.state.fail_publisher.load(Ordering::SeqCst) {
            return Err(BridgeError::transport(
                "new_publisher",
                format!("Topic unavailable: {topic}"),
            ));
        }
        Ok(Box::new(MemoryPublisher {
            topic: topic.to_string(),
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }

    async fn new_subscriber(&self, topic: &str) -> BridgeResult<Subscriber> {
        self.ensure_open("new_subscriber")?;
        if self.state.failing_topics.contains_key(topic) {
            return Err(BridgeError::transport(
                "new_subscriber",
                format!("Topic unavailable: {topic}"),
            ));
        }

        let (msg_tx, msg_rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let id = self.state.next_route.fetch_add(1, Ordering::Relaxed);

        self.state
            .routes
            .entry(topic.to_string())
            .or_default()
            .push(Route {
                id,
                messages: msg_tx,
                errors: err_tx,
            });

        let state = Arc::clone(&self.state);
        let route_topic = topic.to_string();
        Ok(Subscriber::new(topic, msg_rx, err_rx)
            .on_close(move || state.remove_route(&route_topic, id)))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.closed_clients.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[derive(Debug)]
struct MemoryPublisher {
    topic: String,
    state: Arc<BusState>,
    closed: AtomicBool,
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, message: &OutboundMessage) -> BridgeResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::transport("publish", "Publisher is closed"));
        }
        if self.state.fail_publish.load(Ordering::SeqCst) {
            return Err(BridgeError::transport(
                "publish",
                format!("Broker rejected message on {}", self.topic),
            ));
        }

        self.state
            .published
            .entry(self.topic.clone())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PublishValue;

    #[test]
    fn test_discovery() -> BridgeResult<()> {
        let bus = MemoryBus::new()
            .with_subscriber("sensors", &["t1", "t2"])
            .with_publisher("out", &["processed"]);

        assert_eq!(bus.num_subscribers()?, 1);
        let ctx = bus.subscriber_by_index(0)?;
        assert_eq!(ctx.name, "sensors");
        assert_eq!(ctx.topics, vec!["t1", "t2"]);
        assert!(bus.subscriber_by_index(1).is_err());
        assert_eq!(bus.publisher_by_name("out")?.topics, vec!["processed"]);
        assert!(bus.publisher_by_name("missing").is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_subscription_delivery_and_release() -> BridgeResult<()> {
        let bus = MemoryBus::new();
        let client = bus.connect(&json!({})).await?;
        let mut subscriber = client.new_subscriber("t1").await?;
        assert_eq!(bus.subscriber_count("t1"), 1);

        let delivered = bus
            .publish("t1", Envelope::new("temp", json!({"v": 1})))
            .await;
        assert_eq!(delivered, 1);
        let received = subscriber.messages.recv().await;
        assert_eq!(received.map(|e| e.name), Some("temp".to_string()));

        assert_eq!(bus.inject_error("t1", "socket reset").await, 1);
        assert!(subscriber.errors.recv().await.is_some());

        drop(subscriber);
        assert_eq!(bus.subscriber_count("t1"), 0);

        client.close();
        client.close();
        assert_eq!(bus.closed_clients(), 1);
        assert!(client.new_subscriber("t1").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_publisher_records_messages() -> BridgeResult<()> {
        let bus = MemoryBus::new();
        let client = bus.connect(&json!({})).await?;
        let publisher = client.new_publisher("processed").await?;

        let message = OutboundMessage::from([("count".to_string(), PublishValue::Int(42))]);
        publisher.publish(&message).await?;
        assert_eq!(bus.published("processed"), vec![message.clone()]);

        bus.set_fail_publish(true);
        assert!(publisher.publish(&message).await.is_err());

        bus.set_fail_publish(false);
        publisher.close();
        assert!(publisher.publish(&message).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_injected_failures() -> BridgeResult<()> {
        let bus = MemoryBus::new();
        bus.fail_topic("broken");
        let client = bus.connect(&json!({})).await?;
        assert!(client.new_subscriber("broken").await.is_err());

        bus.set_fail_publisher(true);
        assert!(client.new_publisher("processed").await.is_err());

        bus.fail_connect_for("motors");
        assert!(bus.connect(&json!({"name": "motors"})).await.is_err());
        assert!(bus.connect(&json!({"name": "sensors"})).await.is_ok());

        bus.set_fail_connect(true);
        assert!(bus.connect(&json!({})).await.is_err());
        assert_eq!(bus.connections(), 2);
        Ok(())
    }
}
