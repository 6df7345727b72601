//! Connection Manager
//!
//! Owns the single broker connection and its state machine:
//!
//! ```text
//! Disconnected --connect()--> Connecting --ok--> Connected --disconnect()--> Disconnected
//!                             Connecting --err-> ConnectionFailed --connect()--> Connecting
//! ```
//!
//! A connect attempt is a single handshake. Retrying is left to the caller.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::bounded;
use crate::error::{ClientError, ClientResult, Operation};
use crate::transport::{Connector, InboundSender, Transport};

/// Lifecycle state of the broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ConnectionFailed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::ConnectionFailed => "connection failed",
        };
        f.write_str(name)
    }
}

struct ConnectionInner {
    state: ConnectionState,
    transport: Option<Arc<dyn Transport>>,
    /// Bumped whenever a transport is installed or goes away
    session: u64,
}

impl ConnectionInner {
    fn transport_open(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_open())
    }

    fn set_transport(
        &mut self,
        transport: Option<Arc<dyn Transport>>,
    ) -> Option<Arc<dyn Transport>> {
        self.session += 1;
        std::mem::replace(&mut self.transport, transport)
    }

    /// Demote a connection the broker dropped on its own
    fn check_lost(&mut self, address: &str) {
        if self.state == ConnectionState::Connected && !self.transport_open() {
            tracing::warn!(broker = %address, "Broker connection lost");
            self.state = ConnectionState::Disconnected;
            self.set_transport(None);
        }
    }
}

/// Owns the transport handle and drives connection state transitions
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    host: String,
    port: u16,
    /// Handed to every new transport so inbound frames reach the dispatcher
    inbound: InboundSender,
    operation_timeout: Option<Duration>,
    inner: Mutex<ConnectionInner>,
}

/// Settles a handshake whose future was dropped before it finished
struct PendingAttempt<'a> {
    manager: &'a ConnectionManager,
    settled: bool,
}

impl Drop for PendingAttempt<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut inner = self.manager.lock();
        if inner.state == ConnectionState::Connecting {
            inner.state = ConnectionState::ConnectionFailed;
            tracing::warn!(broker = %self.manager.address(), "Connection attempt abandoned");
        }
    }
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        host: impl Into<String>,
        port: u16,
        inbound: InboundSender,
        operation_timeout: Option<Duration>,
    ) -> Self {
        Self {
            connector,
            host: host.into(),
            port,
            inbound,
            operation_timeout,
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Disconnected,
                transport: None,
                session: 0,
            }),
        }
    }

    /// Broker address as `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub(crate) fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Perform one connection handshake
    ///
    /// Calling this while already connected is a no-op. A second call while a
    /// handshake is in flight fails instead of starting another one. Dropping
    /// the returned future mid-handshake leaves the state `ConnectionFailed`.
    pub async fn connect(&self) -> ClientResult<()> {
        {
            let mut inner = self.lock();
            match inner.state {
                ConnectionState::Connected if inner.transport_open() => {
                    tracing::debug!(broker = %self.address(), "Already connected");
                    return Ok(());
                }
                ConnectionState::Connecting => {
                    return Err(ClientError::Connection {
                        reason: "a connection attempt is already in progress".to_string(),
                    });
                }
                _ => {}
            }
            inner.state = ConnectionState::Connecting;
            if inner.transport.is_some() {
                inner.set_transport(None);
            }
        }

        let mut attempt = PendingAttempt {
            manager: self,
            settled: false,
        };
        tracing::info!(broker = %self.address(), "Connecting to broker");

        let result = bounded(self.operation_timeout, Operation::Connect, async {
            self.connector
                .connect(&self.host, self.port, self.inbound.clone())
                .await
                .map_err(|e| ClientError::Connection {
                    reason: e.to_string(),
                })
        })
        .await;

        let mut inner = self.lock();
        attempt.settled = true;
        match result {
            Ok(transport) => {
                inner.state = ConnectionState::Connected;
                inner.set_transport(Some(transport));
                tracing::info!(broker = %self.address(), "Connected to broker");
                Ok(())
            }
            Err(e) => {
                inner.state = ConnectionState::ConnectionFailed;
                tracing::warn!(broker = %self.address(), error = %e, "Connection failed");
                Err(e)
            }
        }
    }

    /// Tear down the transport
    ///
    /// Idempotent: disconnecting while already disconnected does nothing.
    pub async fn disconnect(&self) {
        let transport = {
            let mut inner = self.lock();
            if inner.state == ConnectionState::Disconnected && inner.transport.is_none() {
                return;
            }
            inner.state = ConnectionState::Disconnected;
            inner.set_transport(None)
        };

        if let Some(transport) = transport {
            if let Err(e) = transport.disconnect().await {
                tracing::debug!(error = %e, "Error while closing transport");
            }
            tracing::info!(broker = %self.address(), "Disconnected from broker");
        }
    }

    /// Current state
    ///
    /// A connection the broker dropped on its own reports `Disconnected`.
    pub async fn state(&self) -> ConnectionState {
        let mut inner = self.lock();
        inner.check_lost(&self.address());
        inner.state
    }

    /// The live transport, or `NotConnected`
    pub async fn transport(&self) -> ClientResult<Arc<dyn Transport>> {
        self.session_transport().map(|(transport, _)| transport)
    }

    /// The live transport together with the session it belongs to
    pub(crate) fn session_transport(&self) -> ClientResult<(Arc<dyn Transport>, u64)> {
        let mut inner = self.lock();
        inner.check_lost(&self.address());
        match (&inner.state, &inner.transport) {
            (ConnectionState::Connected, Some(transport)) => {
                Ok((Arc::clone(transport), inner.session))
            }
            _ => Err(ClientError::NotConnected),
        }
    }

    /// Identifies the current transport; changes on every connect, disconnect
    /// or detected loss
    pub(crate) fn session(&self) -> u64 {
        let mut inner = self.lock();
        inner.check_lost(&self.address());
        inner.session
    }
}
