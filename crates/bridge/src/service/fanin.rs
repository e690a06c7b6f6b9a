//! Subscription Fan-in
//!
//! Discovers every configured subscriber, subscribes to each of its topics
//! and runs one listener task per topic. Listeners feed converted points into
//! the batcher until shutdown is signalled.

use futures::future::join_all;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::{
    bus::{BusDiscovery, BusTransport, MsgbusClient, Subscriber},
    metrics::Statistics,
    pipeline::{PointConverter, PointSubmitter},
    shutdown::{self, ShutdownReceiver},
    types::Envelope,
};

/// Everything a listener needs to handle one message
#[derive(Debug, Clone)]
pub(crate) struct MessageHandler {
    converter: PointConverter,
    submitter: PointSubmitter,
    stats: Arc<Statistics>,
}

impl MessageHandler {
    pub(crate) fn new(submitter: PointSubmitter, stats: Arc<Statistics>) -> Self {
        Self {
            converter: PointConverter::new(Arc::clone(&stats)),
            submitter,
            stats,
        }
    }
}

/// Fan-in supervisor
pub(crate) struct FanIn {
    discovery: Arc<dyn BusDiscovery>,
    transport: Arc<dyn BusTransport>,
    handler: MessageHandler,
    shutdown: ShutdownReceiver,
}

impl FanIn {
    pub(crate) fn new(
        discovery: Arc<dyn BusDiscovery>,
        transport: Arc<dyn BusTransport>,
        handler: MessageHandler,
        shutdown: ShutdownReceiver,
    ) -> Self {
        Self {
            discovery,
            transport,
            handler,
            shutdown,
        }
    }

    /// Subscribe everything, then wait for all listeners to exit and close
    /// the bus clients
    pub(crate) async fn serve(self) {
        let (clients, listeners) = self.subscribe_all().await;
        tracing::info!(
            clients = clients.len(),
            listeners = listeners.len(),
            "Subscription fan-in running"
        );

        for result in join_all(listeners).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Subscription listener failed");
            }
        }

        for client in &clients {
            client.close();
        }
        tracing::info!("Subscription fan-in stopped");
    }

    async fn subscribe_all(&self) -> (Vec<Arc<dyn MsgbusClient>>, Vec<JoinHandle<()>>) {
        let mut clients = Vec::new();
        let mut listeners = Vec::new();

        let count = match self.discovery.num_subscribers() {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read subscriber configuration");
                return (clients, listeners);
            }
        };

        for index in 0..count {
            if shutdown::is_signalled(&self.shutdown) {
                break;
            }

            let ctx = match self.discovery.subscriber_by_index(index) {
                Ok(ctx) => ctx,
                Err(e) => {
                    tracing::warn!(index, error = %e, "Failed to get subscriber context, skipping");
                    continue;
                }
            };
            tracing::info!(
                subscriber = %ctx.name,
                endpoints = ?ctx.endpoints,
                topics = ?ctx.topics,
                "Subscriber discovered"
            );

            let client = match self.transport.connect(&ctx.msgbus_config).await {
                Ok(client) => client,
                Err(e) => {
                    tracing::warn!(subscriber = %ctx.name, error = %e, "Failed to connect, skipping");
                    continue;
                }
            };

            for topic in &ctx.topics {
                match client.new_subscriber(topic).await {
                    Ok(subscriber) => {
                        tracing::debug!(subscriber = %ctx.name, topic = %topic, "Subscribed");
                        listeners.push(tokio::spawn(listen(
                            subscriber,
                            self.handler.clone(),
                            self.shutdown.clone(),
                        )));
                    }
                    Err(e) => {
                        tracing::warn!(
                            subscriber = %ctx.name,
                            topic = %topic,
                            error = %e,
                            "Failed to subscribe, skipping topic"
                        );
                    }
                }
            }
            clients.push(client);
        }

        (clients, listeners)
    }
}

/// Listener for one topic
async fn listen(
    mut subscriber: Subscriber,
    handler: MessageHandler,
    mut shutdown: ShutdownReceiver,
) {
    let topic = subscriber.topic().to_string();
    let mut errors_open = true;

    loop {
        tokio::select! {
            biased;
            () = shutdown::signalled(&mut shutdown) => break,
            message = subscriber.messages.recv() => match message {
                Some(envelope) => {
                    if !handle_message(&handler, &envelope, &mut shutdown).await {
                        break;
                    }
                }
                None => {
                    tracing::debug!(topic = %topic, "Subscription closed by the bus");
                    break;
                }
            },
            error = subscriber.errors.recv(), if errors_open => match error {
                Some(e) => {
                    handler.stats.record_read_fail();
                    tracing::warn!(
                        topic = %topic,
                        retryable = e.is_retryable(),
                        error = %e,
                        "Subscription read failed"
                    );
                }
                None => errors_open = false,
            },
        }
    }

    tracing::debug!(topic = %topic, "Listener exited");
}

/// Convert and submit one message. Returns `false` when the listener
/// should stop.
async fn handle_message(
    handler: &MessageHandler,
    envelope: &Envelope,
    shutdown: &mut ShutdownReceiver,
) -> bool {
    let Some(point) = handler.converter.convert(envelope) else {
        return true;
    };

    tokio::select! {
        biased;
        () = shutdown::signalled(shutdown) => false,
        result = handler.submitter.submit(point) => match result {
            Ok(()) => {
                handler.stats.record_point_received();
                true
            }
            Err(e) => {
                tracing::debug!(error = %e, "Batcher closed, stopping listener");
                false
            }
        },
    }
}
