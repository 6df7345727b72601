//! Channel Subscription
//!
//! Tracks the one active channel of a client. Switching channels does not,
//! by default, unsubscribe the previous one: both stay live at the broker and
//! the client keeps receiving from each. Strict mode unsubscribes the
//! previous channel first.
//!
//! Sessions are clean, so channels belong to one connection. When the
//! connection is closed, lost or replaced the channel state is forgotten and
//! the caller has to subscribe again.

use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, RwLockWriteGuard};

use super::bounded;
use super::connection::ConnectionManager;
use crate::error::{ClientError, ClientResult, Operation};

#[derive(Debug, Default)]
struct ChannelState {
    active: Option<String>,
    /// Every channel subscribed at the broker on the current connection
    live: BTreeSet<String>,
    /// Connection session the channels were joined on
    session: u64,
}

impl ChannelState {
    fn follow(&mut self, session: u64) {
        if self.session == session {
            return;
        }
        if self.active.is_some() || !self.live.is_empty() {
            tracing::info!(
                channels = self.live.len(),
                "Connection changed; forgetting subscribed channels"
            );
        }
        self.active = None;
        self.live.clear();
        self.session = session;
    }
}

/// Manages subscribe/unsubscribe for a single active channel
pub struct ChannelSubscription {
    connection: Arc<ConnectionManager>,
    strict: bool,
    state: RwLock<ChannelState>,
    /// Serializes subscribe and unsubscribe so completions keep issue order
    op_lock: Mutex<()>,
}

impl ChannelSubscription {
    pub fn new(connection: Arc<ConnectionManager>, strict: bool) -> Self {
        Self {
            connection,
            strict,
            state: RwLock::new(ChannelState::default()),
            op_lock: Mutex::new(()),
        }
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Channel state, reset first if the connection changed since it was written
    async fn channels(&self) -> RwLockWriteGuard<'_, ChannelState> {
        let session = self.connection.session();
        let mut state = self.state.write().await;
        state.follow(session);
        state
    }

    /// Channel state for `session`, or `NotConnected` once that connection is gone
    async fn channels_on(&self, session: u64) -> ClientResult<RwLockWriteGuard<'_, ChannelState>> {
        let state = self.channels().await;
        if state.session != session {
            return Err(ClientError::NotConnected);
        }
        Ok(state)
    }

    /// Subscribe to `channel` and make it the active channel
    pub async fn subscribe(&self, channel: &str) -> ClientResult<()> {
        validate_channel(channel)?;

        let _guard = self.op_lock.lock().await;
        let (transport, session) = self.connection.session_transport()?;
        let timeout = self.connection.operation_timeout();

        let previous = self.channels_on(session).await?.active.clone();
        if self.strict {
            if let Some(previous) = previous.as_deref().filter(|p| *p != channel) {
                bounded(timeout, Operation::Unsubscribe, async {
                    transport
                        .unsubscribe(previous)
                        .await
                        .map_err(|e| ClientError::Subscription {
                            reason: format!("unsubscribing {}: {}", previous, e),
                        })
                })
                .await?;

                let mut state = self.channels_on(session).await?;
                state.live.remove(previous);
                state.active = None;
                tracing::info!(channel = %previous, "Left previous channel");
            }
        }

        bounded(timeout, Operation::Subscribe, async {
            transport
                .subscribe(channel)
                .await
                .map_err(|e| ClientError::Subscription {
                    reason: e.to_string(),
                })
        })
        .await?;

        // An acknowledgement from a connection that has since gone away is stale
        let mut state = self.channels_on(session).await?;
        state.active = Some(channel.to_string());
        state.live.insert(channel.to_string());

        if let Some(previous) = previous.filter(|p| p != channel && !self.strict) {
            tracing::info!(
                channel = %channel,
                previous = %previous,
                "Subscribed to channel; previous channel remains subscribed"
            );
        } else {
            tracing::info!(channel = %channel, "Subscribed to channel");
        }
        Ok(())
    }

    /// Unsubscribe the active channel
    ///
    /// Fails with `NoActiveChannel` when there is none, including on a second
    /// call in a row.
    pub async fn unsubscribe(&self) -> ClientResult<()> {
        let _guard = self.op_lock.lock().await;

        let channel = self
            .channels()
            .await
            .active
            .clone()
            .ok_or(ClientError::NoActiveChannel)?;
        let (transport, session) = self.connection.session_transport()?;

        bounded(
            self.connection.operation_timeout(),
            Operation::Unsubscribe,
            async {
                transport
                    .unsubscribe(&channel)
                    .await
                    .map_err(|e| ClientError::Subscription {
                        reason: e.to_string(),
                    })
            },
        )
        .await?;

        let mut state = self.channels_on(session).await?;
        state.active = None;
        state.live.remove(&channel);

        tracing::info!(channel = %channel, "Unsubscribed from channel");
        Ok(())
    }

    /// The channel publishes go to
    pub async fn active_channel(&self) -> Option<String> {
        self.channels().await.active.clone()
    }

    /// Every channel still subscribed at the broker, sorted
    pub async fn subscribed_channels(&self) -> Vec<String> {
        self.channels().await.live.iter().cloned().collect()
    }

    /// Forget all channels; a clean session drops them at the broker
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        state.active = None;
        state.live.clear();
    }
}

/// Channels double as publish topics, so MQTT wildcards are not allowed
fn validate_channel(channel: &str) -> ClientResult<()> {
    if channel.is_empty() {
        return Err(ClientError::Subscription {
            reason: "channel name is empty".to_string(),
        });
    }
    if channel.contains(['+', '#', '\0']) {
        return Err(ClientError::Subscription {
            reason: format!("channel {:?} contains a wildcard or NUL character", channel),
        });
    }
    if channel.len() > u16::MAX as usize {
        return Err(ClientError::Subscription {
            reason: "channel name is too long".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryBroker, MemoryConnector};
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn connected(broker: &Arc<MemoryBroker>, strict: bool) -> ChannelSubscription {
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = Arc::new(ConnectionManager::new(
            Arc::new(MemoryConnector::new(Arc::clone(broker))),
            "memory",
            1883,
            tx,
            Some(Duration::from_secs(5)),
        ));
        connection.connect().await.unwrap();
        ChannelSubscription::new(connection, strict)
    }

    #[test]
    fn test_validate_channel() {
        assert!(validate_channel("fotos/sala-1").is_ok());
        assert!(validate_channel("").is_err());
        assert!(validate_channel("fotos/+").is_err());
        assert!(validate_channel("#").is_err());
    }

    #[tokio::test]
    async fn test_subscribe_requires_connection() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let broker = Arc::new(MemoryBroker::default());
        let connection = Arc::new(ConnectionManager::new(
            Arc::new(MemoryConnector::new(broker)),
            "memory",
            1883,
            tx,
            None,
        ));
        let subscription = ChannelSubscription::new(connection, false);

        assert_eq!(
            subscription.subscribe("c1").await,
            Err(ClientError::NotConnected)
        );
        assert_eq!(subscription.active_channel().await, None);
    }

    #[tokio::test]
    async fn test_subscribe_sets_active_channel() {
        let broker = Arc::new(MemoryBroker::default());
        let subscription = connected(&broker, false).await;

        subscription.subscribe("c1").await.unwrap();
        assert_eq!(subscription.active_channel().await, Some("c1".to_string()));
        assert_eq!(broker.subscription_count("c1").await, 1);
    }

    #[tokio::test]
    async fn test_switch_keeps_previous_subscription() {
        let broker = Arc::new(MemoryBroker::default());
        let subscription = connected(&broker, false).await;

        subscription.subscribe("c1").await.unwrap();
        subscription.subscribe("c2").await.unwrap();

        assert_eq!(subscription.active_channel().await, Some("c2".to_string()));
        assert_eq!(subscription.subscribed_channels().await, vec!["c1", "c2"]);
        assert_eq!(broker.subscription_count("c1").await, 1);
        assert_eq!(broker.subscription_count("c2").await, 1);
    }

    #[tokio::test]
    async fn test_strict_switch_unsubscribes_previous() {
        let broker = Arc::new(MemoryBroker::default());
        let subscription = connected(&broker, true).await;

        subscription.subscribe("c1").await.unwrap();
        subscription.subscribe("c2").await.unwrap();

        assert_eq!(subscription.subscribed_channels().await, vec!["c2"]);
        assert_eq!(broker.subscription_count("c1").await, 0);
        assert_eq!(broker.subscription_count("c2").await, 1);
    }

    #[tokio::test]
    async fn test_resubscribe_same_channel() {
        let broker = Arc::new(MemoryBroker::default());
        let subscription = connected(&broker, true).await;

        subscription.subscribe("c1").await.unwrap();
        subscription.subscribe("c1").await.unwrap();
        assert_eq!(subscription.subscribed_channels().await, vec!["c1"]);
        assert_eq!(broker.subscription_count("c1").await, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_twice() {
        let broker = Arc::new(MemoryBroker::default());
        let subscription = connected(&broker, false).await;

        subscription.subscribe("c1").await.unwrap();
        subscription.unsubscribe().await.unwrap();
        assert_eq!(subscription.active_channel().await, None);
        assert_eq!(broker.subscription_count("c1").await, 0);

        assert_eq!(
            subscription.unsubscribe().await,
            Err(ClientError::NoActiveChannel)
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_leaves_earlier_channel_live() {
        let broker = Arc::new(MemoryBroker::default());
        let subscription = connected(&broker, false).await;

        subscription.subscribe("c1").await.unwrap();
        subscription.subscribe("c2").await.unwrap();
        subscription.unsubscribe().await.unwrap();

        assert_eq!(subscription.active_channel().await, None);
        assert_eq!(subscription.subscribed_channels().await, vec!["c1"]);
        assert_eq!(broker.subscription_count("c1").await, 1);
        assert_eq!(broker.subscription_count("c2").await, 0);
    }

    #[tokio::test]
    async fn test_reset_clears_channels() {
        let broker = Arc::new(MemoryBroker::default());
        let subscription = connected(&broker, false).await;

        subscription.subscribe("c1").await.unwrap();
        subscription.reset().await;
        assert_eq!(subscription.active_channel().await, None);
        assert!(subscription.subscribed_channels().await.is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_forgets_channels() {
        let broker = Arc::new(MemoryBroker::default());
        let subscription = connected(&broker, false).await;

        subscription.subscribe("c1").await.unwrap();
        subscription.connection.disconnect().await;
        subscription.connection.connect().await.unwrap();

        assert_eq!(subscription.active_channel().await, None);
        assert!(subscription.subscribed_channels().await.is_empty());
        assert_eq!(
            subscription.unsubscribe().await,
            Err(ClientError::NoActiveChannel)
        );
    }

    #[tokio::test]
    async fn test_broker_drop_forgets_channels() {
        let broker = Arc::new(MemoryBroker::default());
        let subscription = connected(&broker, false).await;

        subscription.subscribe("c1").await.unwrap();
        broker.disconnect_all().await;
        assert_eq!(subscription.active_channel().await, None);

        subscription.connection.connect().await.unwrap();
        subscription.subscribe("c2").await.unwrap();
        assert_eq!(subscription.subscribed_channels().await, vec!["c2"]);
    }
}
