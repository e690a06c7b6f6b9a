//! Message bus capabilities
//!
//! Discovery resolves logical publisher and subscriber names into endpoint
//! contexts; the transport connects a context's bus configuration into a
//! client that hands out publishers and subscriptions.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::{
    error::{BridgeError, BridgeResult},
    types::{EndpointContext, Envelope, OutboundMessage},
};

pub mod memory;

pub use memory::MemoryBus;

/// Configuration discovery of the bus SDK
pub trait BusDiscovery: Send + Sync {
    /// Number of configured subscribers
    ///
    /// # Errors
    ///
    /// Returns error if the configuration cannot be read
    fn num_subscribers(&self) -> BridgeResult<usize>;

    /// Subscriber context at `index`
    ///
    /// # Errors
    ///
    /// Returns error if no subscriber exists at `index`
    fn subscriber_by_index(&self, index: usize) -> BridgeResult<EndpointContext>;

    /// Publisher context by logical name
    ///
    /// # Errors
    ///
    /// Returns error if no publisher has that name
    fn publisher_by_name(&self, name: &str) -> BridgeResult<EndpointContext>;
}

/// Connects bus configurations into clients
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Connect using the bus configuration of an endpoint context
    ///
    /// # Errors
    ///
    /// Returns a transport error if the connection fails
    async fn connect(&self, config: &serde_json::Value) -> BridgeResult<Arc<dyn MsgbusClient>>;
}

/// A connected bus client
#[async_trait]
pub trait MsgbusClient: Send + Sync {
    /// Create a publisher for `topic`
    ///
    /// # Errors
    ///
    /// Returns a transport error if the publisher cannot be created
    async fn new_publisher(&self, topic: &str) -> BridgeResult<Box<dyn Publisher>>;

    /// Subscribe to `topic`
    ///
    /// # Errors
    ///
    /// Returns a transport error if the subscription cannot be created
    async fn new_subscriber(&self, topic: &str) -> BridgeResult<Subscriber>;

    /// Release the connection
    fn close(&self);
}

/// Publishes outbound messages on one topic
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish one message
    ///
    /// # Errors
    ///
    /// Returns a transport error if the message was not sent
    async fn publish(&self, message: &OutboundMessage) -> BridgeResult<()>;

    /// Release the publisher
    fn close(&self);
}

type CloseHook = Box<dyn FnOnce() + Send>;

/// An open subscription to one topic.
///
/// Messages and transport errors arrive on separate channels. Dropping the
/// subscription releases it on the bus.
pub struct Subscriber {
    topic: String,
    /// Inbound messages, closed when the bus ends the subscription
    pub messages: mpsc::Receiver<Envelope>,
    /// Transport read errors
    pub errors: mpsc::Receiver<BridgeError>,
    on_close: Option<CloseHook>,
}

impl Subscriber {
    /// Create a subscription from its two channels
    pub fn new(
        topic: impl Into<String>,
        messages: mpsc::Receiver<Envelope>,
        errors: mpsc::Receiver<BridgeError>,
    ) -> Self {
        Self {
            topic: topic.into(),
            messages,
            errors,
            on_close: None,
        }
    }

    /// Run `hook` when the subscription is released
    #[must_use]
    pub fn on_close(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }

    /// Subscribed topic
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.messages.close();
        self.errors.close();
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }
}
