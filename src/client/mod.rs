//! GeoPhoto Client
//!
//! Connects to a broker, joins one channel at a time, publishes geotagged
//! photos to it and hands every decodable message that arrives to a
//! presentation sink.
//!
//! [`GeoPhotoClient`] wires the pieces together:
//! - [`ConnectionManager`] owns the broker connection and its state machine
//! - [`ChannelSubscription`] tracks the active channel
//! - [`Publisher`] encodes and sends messages
//! - [`InboundDispatcher`] decodes inbound frames and delivers them

pub mod connection;
pub mod dispatcher;
pub mod publisher;
pub mod subscription;

pub use connection::{ConnectionManager, ConnectionState};
pub use dispatcher::{DispatchStats, InboundDispatcher};
pub use publisher::Publisher;
pub use subscription::ChannelSubscription;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::codec::GeoPhotoMessage;
use crate::config::BrokerConfig;
use crate::error::{ClientError, ClientResult, Operation};
use crate::sources::{
    ImageSource, LocationSource, ObservabilitySink, PresentationSink, TracingObserver,
};
use crate::transport::{Connector, MqttConnector, MqttOptions};

/// Run `fut` with an optional deadline
pub(crate) async fn bounded<T, F>(
    limit: Option<Duration>,
    operation: Operation,
    fut: F,
) -> ClientResult<T>
where
    F: Future<Output = ClientResult<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| ClientError::Timeout {
                operation,
                seconds: limit.as_secs(),
            })?,
        None => fut.await,
    }
}

/// A connected photo-sharing client
///
/// Must be created inside a Tokio runtime. Dropping the client stops inbound
/// delivery; call [`disconnect`](Self::disconnect) first to close the broker
/// connection cleanly.
pub struct GeoPhotoClient {
    connection: Arc<ConnectionManager>,
    subscription: Arc<ChannelSubscription>,
    publisher: Publisher,
    dispatcher: InboundDispatcher,
    presentation: Arc<dyn PresentationSink>,
}

impl GeoPhotoClient {
    /// Create a client that reports decode failures through `tracing`
    pub fn new(
        config: &BrokerConfig,
        connector: Arc<dyn Connector>,
        presentation: Arc<dyn PresentationSink>,
    ) -> Self {
        Self::with_observer(config, connector, presentation, Arc::new(TracingObserver))
    }

    pub fn with_observer(
        config: &BrokerConfig,
        connector: Arc<dyn Connector>,
        presentation: Arc<dyn PresentationSink>,
        observer: Arc<dyn ObservabilitySink>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let connection = Arc::new(ConnectionManager::new(
            connector,
            config.host.clone(),
            config.port,
            inbound_tx,
            config.operation_timeout(),
        ));
        let subscription = Arc::new(ChannelSubscription::new(
            Arc::clone(&connection),
            config.strict_channel_switch,
        ));
        let publisher = Publisher::new(
            Arc::clone(&connection),
            Arc::clone(&subscription),
            config.max_payload_bytes,
        );
        let dispatcher =
            InboundDispatcher::spawn(inbound_rx, Arc::clone(&presentation), observer);

        Self {
            connection,
            subscription,
            publisher,
            dispatcher,
            presentation,
        }
    }

    /// Create a client that talks MQTT to the configured broker
    pub fn mqtt(config: &BrokerConfig, presentation: Arc<dyn PresentationSink>) -> Self {
        let options = MqttOptions::new(config.client_id.clone())
            .keep_alive(config.keep_alive())
            .max_payload_bytes(config.max_payload_bytes);
        Self::new(config, Arc::new(MqttConnector::new(options)), presentation)
    }

    pub async fn connect(&self) -> ClientResult<()> {
        let result = self.connection.connect().await;
        self.report(Operation::Connect, result)
    }

    /// Close the broker connection; subscriptions end with it
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
        self.subscription.reset().await;
    }

    pub async fn subscribe(&self, channel: &str) -> ClientResult<()> {
        let result = self.subscription.subscribe(channel).await;
        self.report(Operation::Subscribe, result)
    }

    pub async fn unsubscribe(&self) -> ClientResult<()> {
        let result = self.subscription.unsubscribe().await;
        self.report(Operation::Unsubscribe, result)
    }

    pub async fn publish(&self, message: GeoPhotoMessage) -> ClientResult<()> {
        let result = self.publisher.publish(message).await;
        self.report(Operation::Publish, result)
    }

    /// Build a message from the sources and publish it
    ///
    /// The image is requested first, then the location; the message carries
    /// today's local date.
    pub async fn publish_from_sources(
        &self,
        location: &dyn LocationSource,
        image: &dyn ImageSource,
    ) -> ClientResult<()> {
        let message = match Self::gather(location, image).await {
            Ok(message) => message,
            Err(e) => return self.report(Operation::Publish, Err(e)),
        };
        self.publish(message).await
    }

    async fn gather(
        location: &dyn LocationSource,
        image: &dyn ImageSource,
    ) -> ClientResult<GeoPhotoMessage> {
        let image_bytes = image.next_image().await?.ok_or(ClientError::NoImageSelected)?;
        let coordinates = location
            .current_location()
            .await
            .ok_or(ClientError::LocationUnavailable)?;
        Ok(GeoPhotoMessage::captured_today(coordinates, image_bytes))
    }

    pub async fn state(&self) -> ConnectionState {
        self.connection.state().await
    }

    pub async fn active_channel(&self) -> Option<String> {
        self.subscription.active_channel().await
    }

    /// Channels still live at the broker, including ones switched away from
    pub async fn subscribed_channels(&self) -> Vec<String> {
        self.subscription.subscribed_channels().await
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    /// Broker address as `host:port`
    pub fn broker_address(&self) -> String {
        self.connection.address()
    }

    fn report(&self, operation: Operation, result: ClientResult<()>) -> ClientResult<()> {
        match &result {
            Ok(()) => self.presentation.on_success(operation),
            Err(e) => {
                tracing::debug!(operation = %operation, error = %e, "Operation failed");
                self.presentation.on_failure(operation, e);
            }
        }
        result
    }
}

impl Drop for GeoPhotoClient {
    fn drop(&mut self) {
        self.dispatcher.shutdown();
    }
}
