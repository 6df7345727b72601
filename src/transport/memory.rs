//! In-Process Broker
//!
//! Routes published frames to every connection subscribed to the exact topic.
//! Sessions are clean: a connection's subscriptions disappear when it
//! disconnects. Delivery to each subscriber goes through its own unbounded
//! channel, so frames from one publisher arrive in publish order.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{Connector, InboundFrame, InboundSender, Transport, TransportError, TransportResult};

/// Unique identifier for a broker connection
pub type ConnectionId = String;

/// Configuration for the in-process broker
#[derive(Debug, Clone)]
pub struct MemoryBrokerConfig {
    /// Connections beyond this are refused
    pub max_connections: usize,
    /// Largest payload the broker accepts
    pub max_payload_bytes: usize,
}

impl Default for MemoryBrokerConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            max_payload_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Per-connection delivery handle
struct ConnectionHandle {
    sender: InboundSender,
    subscriptions: HashSet<String>,
    /// Shared with the client's transport; cleared when the broker drops it
    open: Arc<AtomicBool>,
}

/// An in-process publish/subscribe broker
pub struct MemoryBroker {
    /// Delivery handle per open connection
    connections: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
    /// Subscribers per exact topic
    subscriptions: RwLock<HashMap<String, HashSet<ConnectionId>>>,
    accepting: AtomicBool,
    config: MemoryBrokerConfig,
}

impl MemoryBroker {
    pub fn new(config: MemoryBrokerConfig) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            config,
        }
    }

    /// Accept or refuse new connections
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Register a new connection
    async fn register(
        &self,
        sender: InboundSender,
        open: Arc<AtomicBool>,
    ) -> TransportResult<ConnectionId> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(TransportError::Refused("broker is not accepting connections".to_string()));
        }

        let mut connections = self.connections.write().await;
        if connections.len() >= self.config.max_connections {
            return Err(TransportError::TooManyConnections(self.config.max_connections));
        }

        let id = Uuid::new_v4().to_string();
        connections.insert(
            id.clone(),
            ConnectionHandle {
                sender,
                subscriptions: HashSet::new(),
                open,
            },
        );

        tracing::debug!(connection_id = %id, "Memory broker connection opened");
        Ok(id)
    }

    /// Remove a connection and every subscription it held
    async fn unregister(&self, id: &str) {
        let mut connections = self.connections.write().await;
        let handle = connections.remove(id);

        if let Some(handle) = handle {
            handle.open.store(false, Ordering::SeqCst);
            let mut subs = self.subscriptions.write().await;
            for topic in handle.subscriptions {
                if let Some(subscribers) = subs.get_mut(&topic) {
                    subscribers.remove(id);
                    if subscribers.is_empty() {
                        subs.remove(&topic);
                    }
                }
            }
            tracing::debug!(connection_id = %id, "Memory broker connection closed");
        }
    }

    async fn subscribe(&self, id: &str, topic: &str) -> TransportResult<()> {
        let mut connections = self.connections.write().await;
        let handle = connections.get_mut(id).ok_or(TransportError::Closed)?;

        handle.subscriptions.insert(topic.to_string());
        self.subscriptions
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .insert(id.to_string());

        Ok(())
    }

    async fn unsubscribe(&self, id: &str, topic: &str) -> TransportResult<()> {
        let mut connections = self.connections.write().await;
        let handle = connections.get_mut(id).ok_or(TransportError::Closed)?;

        if handle.subscriptions.remove(topic) {
            let mut subs = self.subscriptions.write().await;
            if let Some(subscribers) = subs.get_mut(topic) {
                subscribers.remove(id);
                if subscribers.is_empty() {
                    subs.remove(topic);
                }
            }
        }

        Ok(())
    }

    /// Deliver a payload to every subscriber of `topic`
    ///
    /// Returns the number of connections the frame was handed to.
    async fn publish(&self, id: &str, topic: &str, payload: Bytes) -> TransportResult<usize> {
        if payload.len() > self.config.max_payload_bytes {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                limit: self.config.max_payload_bytes,
            });
        }

        let connections = self.connections.read().await;
        if !connections.contains_key(id) {
            return Err(TransportError::Closed);
        }
        let subs = self.subscriptions.read().await;

        let delivered = fan_out(&connections, &subs, topic, &payload);
        tracing::trace!(topic = %topic, subscribers = delivered, "Memory broker delivered frame");
        Ok(delivered)
    }

    /// Inject a raw frame as if another client had published it
    pub async fn inject(&self, topic: &str, payload: Bytes) -> usize {
        let connections = self.connections.read().await;
        let subs = self.subscriptions.read().await;
        fan_out(&connections, &subs, topic, &payload)
    }

    /// Drop every connection, as a broker restart would
    pub async fn disconnect_all(&self) {
        let ids: Vec<ConnectionId> = self.connections.read().await.keys().cloned().collect();
        for id in ids {
            self.unregister(&id).await;
        }
    }

    /// Open connections
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Connections subscribed to `topic`
    pub async fn subscription_count(&self, topic: &str) -> usize {
        self.subscriptions
            .read()
            .await
            .get(topic)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

fn fan_out(
    connections: &HashMap<ConnectionId, ConnectionHandle>,
    subscriptions: &HashMap<String, HashSet<ConnectionId>>,
    topic: &str,
    payload: &Bytes,
) -> usize {
    let Some(subscriber_ids) = subscriptions.get(topic) else {
        return 0;
    };

    let mut delivered = 0;
    for subscriber in subscriber_ids {
        if let Some(handle) = connections.get(subscriber) {
            let frame = InboundFrame {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            if handle.sender.send(frame).is_ok() {
                delivered += 1;
            }
        }
    }
    delivered
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(MemoryBrokerConfig::default())
    }
}

/// Connects clients to a shared [`MemoryBroker`]
#[derive(Clone)]
pub struct MemoryConnector {
    broker: Arc<MemoryBroker>,
}

impl MemoryConnector {
    pub fn new(broker: Arc<MemoryBroker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        inbound: InboundSender,
    ) -> TransportResult<Arc<dyn Transport>> {
        let open = Arc::new(AtomicBool::new(true));
        let id = self.broker.register(inbound, Arc::clone(&open)).await?;
        tracing::debug!(host = %host, port, connection_id = %id, "Connected to memory broker");

        Ok(Arc::new(MemoryTransport {
            broker: Arc::clone(&self.broker),
            id,
            open,
        }))
    }
}

/// A connection to a [`MemoryBroker`]
struct MemoryTransport {
    broker: Arc<MemoryBroker>,
    id: ConnectionId,
    open: Arc<AtomicBool>,
}

impl MemoryTransport {
    fn mark_closed_on<T>(&self, result: TransportResult<T>) -> TransportResult<T> {
        if matches!(result, Err(TransportError::Closed)) {
            self.open.store(false, Ordering::SeqCst);
        }
        result
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn subscribe(&self, topic: &str) -> TransportResult<()> {
        let result = self.broker.subscribe(&self.id, topic).await;
        self.mark_closed_on(result)
    }

    async fn unsubscribe(&self, topic: &str) -> TransportResult<()> {
        let result = self.broker.unsubscribe(&self.id, topic).await;
        self.mark_closed_on(result)
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> TransportResult<()> {
        let result = self.broker.publish(&self.id, topic, payload).await.map(|_| ());
        self.mark_closed_on(result)
    }

    async fn disconnect(&self) -> TransportResult<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.broker.unregister(&self.id).await;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
