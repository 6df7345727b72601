//! Broker Transport
//!
//! The broker client wrapped by the connection manager. A [`Connector`]
//! performs one connection handshake and hands back a [`Transport`] handle;
//! every inbound PUBLISH on that connection is pushed, in arrival order, to
//! the sender supplied at connect time.
//!
//! Two implementations are provided:
//!
//! - [`MqttConnector`]: MQTT 3.1.1 over TCP via `rumqttc`, clean session, QoS 0
//! - [`MemoryConnector`]: an in-process broker for tests and offline runs

pub mod memory;
pub mod mqtt;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::{MemoryBroker, MemoryBrokerConfig, MemoryConnector};
pub use mqtt::{MqttConnector, MqttOptions, MqttTransport};

/// A message received from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    /// Topic the message was published on
    pub topic: String,
    /// Raw payload
    pub payload: Bytes,
}

/// Sender half used to hand inbound frames to the dispatcher
pub type InboundSender = mpsc::UnboundedSender<InboundFrame>;

/// An established broker connection
///
/// Each call resolves exactly once, with success or a typed failure.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Subscribe to a topic filter
    async fn subscribe(&self, topic: &str) -> TransportResult<()>;

    /// Remove a subscription
    async fn unsubscribe(&self, topic: &str) -> TransportResult<()>;

    /// Publish a payload at most once
    async fn publish(&self, topic: &str, payload: Bytes) -> TransportResult<()>;

    /// Close the connection
    async fn disconnect(&self) -> TransportResult<()>;

    /// Whether the connection is still usable
    fn is_open(&self) -> bool;
}

/// Opens broker connections
#[async_trait]
pub trait Connector: Send + Sync {
    /// Perform a single connection handshake without retrying
    async fn connect(
        &self,
        host: &str,
        port: u16,
        inbound: InboundSender,
    ) -> TransportResult<Arc<dyn Transport>>;
}

/// Errors raised by a transport
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("MQTT session error: {0}")]
    Session(String),

    #[error("Connection refused by broker: {0}")]
    Refused(String),

    #[error("Connection closed")]
    Closed,

    #[error("Broker rejected subscription to {0}")]
    SubscriptionRejected(String),

    #[error("Payload of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Too many connections (limit: {0})")]
    TooManyConnections(usize),
}

/// Result type alias for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
