//! MQTT over TCP
//!
//! Backed by `rumqttc`: clean session, QoS 0 publishes and subscriptions.
//! One background task owns the event loop. It forwards every inbound
//! PUBLISH to the inbound sender and routes SUBACK/UNSUBACK to the request
//! waiting on that packet id. When the loop fails (socket error, missing
//! PINGRESP, broker hang-up) the task ends and the transport reports itself
//! closed. The event loop is never polled again after that, so there is no
//! automatic reconnect.

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming, Outgoing, QoS,
    SubscribeReasonCode,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::{Connector, InboundFrame, InboundSender, Transport, TransportError, TransportResult};

/// Largest remaining length an MQTT 3.1.1 packet can declare
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Requests buffered between the client handle and the event loop
const REQUEST_CAPACITY: usize = 64;

/// How long `disconnect` waits for DISCONNECT to be flushed
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Options for MQTT connections
#[derive(Debug, Clone)]
pub struct MqttOptions {
    /// Client identifier sent in CONNECT
    pub client_id: String,
    /// Keep-alive interval in whole seconds; zero disables pings
    pub keep_alive: Duration,
    /// Largest payload accepted by [`MqttTransport::publish`]
    pub max_payload_bytes: usize,
}

impl MqttOptions {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            keep_alive: Duration::from_secs(60),
            max_payload_bytes: MAX_REMAINING_LENGTH - 1024,
        }
    }

    /// Set the keep-alive; sub-second values round up to one second
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = if keep_alive.is_zero() {
            Duration::ZERO
        } else {
            Duration::from_secs(keep_alive.as_secs().clamp(1, u16::MAX as u64))
        };
        self
    }

    pub fn max_payload_bytes(mut self, limit: usize) -> Self {
        self.max_payload_bytes = limit.min(MAX_REMAINING_LENGTH - 1024);
        self
    }

    fn session(&self, host: &str, port: u16) -> TransportResult<rumqttc::MqttOptions> {
        if self.client_id.is_empty() || self.client_id.starts_with(' ') {
            return Err(TransportError::Session(format!(
                "invalid client id {:?}",
                self.client_id
            )));
        }

        let mut session = rumqttc::MqttOptions::new(self.client_id.clone(), host, port);
        session
            .set_clean_session(true)
            .set_keep_alive(self.keep_alive)
            .set_max_packet_size(MAX_REMAINING_LENGTH, MAX_REMAINING_LENGTH);
        Ok(session)
    }
}

/// Opens MQTT connections over TCP
pub struct MqttConnector {
    options: MqttOptions,
}

impl MqttConnector {
    pub fn new(options: MqttOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &MqttOptions {
        &self.options
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        inbound: InboundSender,
    ) -> TransportResult<Arc<dyn Transport>> {
        let transport = MqttTransport::connect(host, port, self.options.clone(), inbound).await?;
        Ok(Arc::new(transport))
    }
}

/// Broker acknowledgement handed back to a waiting request
#[derive(Debug)]
enum Ack {
    Subscribed(Vec<SubscribeReasonCode>),
    Unsubscribed,
}

/// Matches SUBACK/UNSUBACK packets to the requests that caused them
///
/// The client handle assigns packet ids inside the event loop, so a request
/// is first queued in send order and only learns its id when the loop
/// reports the outgoing SUBSCRIBE or UNSUBSCRIBE.
#[derive(Debug, Default)]
struct AckRouter {
    queued: VecDeque<oneshot::Sender<Ack>>,
    in_flight: HashMap<u16, oneshot::Sender<Ack>>,
    closed: bool,
}

impl AckRouter {
    fn enqueue(&mut self) -> TransportResult<oneshot::Receiver<Ack>> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        self.queued.push_back(tx);
        Ok(rx)
    }

    /// The oldest queued request went out with `packet_id`
    fn assign(&mut self, packet_id: u16) {
        match self.queued.pop_front() {
            // Its caller gave up already
            Some(waiter) if waiter.is_closed() => {}
            Some(waiter) => {
                self.in_flight.insert(packet_id, waiter);
            }
            None => tracing::debug!(packet_id, "Outgoing request with no waiter"),
        }
    }

    fn resolve(&mut self, packet_id: u16, ack: Ack) {
        match self.in_flight.remove(&packet_id) {
            Some(waiter) => {
                let _ = waiter.send(ack);
            }
            None => tracing::debug!(packet_id, "Acknowledgement for unknown packet id"),
        }
    }

    /// Drop in-flight entries whose caller stopped waiting
    fn prune(&mut self) {
        self.in_flight.retain(|_, waiter| !waiter.is_closed());
    }

    /// Fail every outstanding request
    fn close(&mut self) {
        self.closed = true;
        self.queued.clear();
        self.in_flight.clear();
    }

    fn outstanding(&self) -> usize {
        self.queued.len() + self.in_flight.len()
    }
}

/// State shared between the transport handle and its event loop task
struct Shared {
    acks: Mutex<AckRouter>,
    open: AtomicBool,
}

impl Shared {
    fn acks(&self) -> MutexGuard<'_, AckRouter> {
        self.acks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) {
        let mut acks = self.acks();
        self.open.store(false, Ordering::SeqCst);
        acks.close();
    }
}

/// A request waiting for its acknowledgement
///
/// Dropping it before the acknowledgement arrives removes its routing entry.
struct PendingAck {
    shared: Arc<Shared>,
    rx: oneshot::Receiver<Ack>,
}

impl PendingAck {
    async fn wait(&mut self) -> TransportResult<Ack> {
        (&mut self.rx).await.map_err(|_| TransportError::Closed)
    }
}

impl Drop for PendingAck {
    fn drop(&mut self) {
        self.rx.close();
        self.shared.acks().prune();
    }
}

/// An open MQTT connection
pub struct MqttTransport {
    client: AsyncClient,
    shared: Arc<Shared>,
    options: MqttOptions,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    /// Connect, wait for a successful CONNACK and start the event loop task
    pub async fn connect(
        host: &str,
        port: u16,
        options: MqttOptions,
        inbound: InboundSender,
    ) -> TransportResult<Self> {
        let (client, mut eventloop) =
            AsyncClient::new(options.session(host, port)?, REQUEST_CAPACITY);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(TransportError::Refused(refusal_reason(ack.code)));
                    }
                    break;
                }
                Ok(event) => tracing::trace!(?event, "Event before CONNACK"),
                Err(e) => return Err(connection_error(e)),
            }
        }

        tracing::info!(
            host = %host,
            port,
            client_id = %options.client_id,
            "MQTT session established"
        );

        let shared = Arc::new(Shared {
            acks: Mutex::new(AckRouter::default()),
            open: AtomicBool::new(true),
        });
        let event_task = tokio::spawn(drive(eventloop, Arc::clone(&shared), inbound));

        Ok(Self {
            client,
            shared,
            options,
            event_task: Mutex::new(Some(event_task)),
        })
    }

    /// Queue a SUBSCRIBE or UNSUBSCRIBE and register for its acknowledgement
    ///
    /// Registration and the hand-off to the client happen under one lock so
    /// the queue keeps the order the event loop will send in.
    fn request<F>(&self, send: F) -> TransportResult<PendingAck>
    where
        F: FnOnce(&AsyncClient) -> Result<(), rumqttc::ClientError>,
    {
        let mut acks = self.shared.acks();
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        let rx = acks.enqueue()?;
        if let Err(e) = send(&self.client) {
            acks.queued.pop_back();
            return Err(self.client_error(e));
        }
        drop(acks);

        Ok(PendingAck {
            shared: Arc::clone(&self.shared),
            rx,
        })
    }

    fn client_error(&self, error: rumqttc::ClientError) -> TransportError {
        if self.is_open() {
            TransportError::Session(error.to_string())
        } else {
            TransportError::Closed
        }
    }

    fn take_event_task(&self) -> Option<JoinHandle<()>> {
        self.event_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn subscribe(&self, topic: &str) -> TransportResult<()> {
        let mut pending = self.request(|client| client.try_subscribe(topic, QoS::AtMostOnce))?;

        match pending.wait().await? {
            Ack::Subscribed(codes)
                if !codes.is_empty()
                    && codes
                        .iter()
                        .all(|code| matches!(code, SubscribeReasonCode::Success(_))) =>
            {
                Ok(())
            }
            _ => Err(TransportError::SubscriptionRejected(topic.to_string())),
        }
    }

    async fn unsubscribe(&self, topic: &str) -> TransportResult<()> {
        let mut pending = self.request(|client| client.try_unsubscribe(topic))?;
        pending.wait().await?;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> TransportResult<()> {
        // Two bytes of topic length precede the topic
        let limit = self
            .options
            .max_payload_bytes
            .min(MAX_REMAINING_LENGTH.saturating_sub(2 + topic.len()));
        if payload.len() > limit {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                limit,
            });
        }
        if !self.is_open() {
            return Err(TransportError::Closed);
        }

        let size = payload.len();
        self.client
            .publish_bytes(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| self.client_error(e))?;

        tracing::trace!(topic = %topic, bytes = size, "Queued publish");
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        if !self.shared.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let task = self.take_event_task();
        if let Err(e) = self.client.try_disconnect() {
            tracing::debug!(error = %e, "Failed to queue DISCONNECT");
        } else if let Some(task) = &task {
            // The loop stops by itself once DISCONNECT is on the wire
            if tokio::time::timeout(DISCONNECT_GRACE, async {
                while !task.is_finished() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .is_err()
            {
                tracing::debug!("DISCONNECT not flushed in time");
            }
        }
        if let Some(task) = task {
            task.abort();
        }
        self.shared.close();

        tracing::info!(client_id = %self.options.client_id, "MQTT session closed");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if let Some(task) = self.take_event_task() {
            task.abort();
        }
    }
}

/// Poll the event loop until the connection ends
async fn drive(mut eventloop: EventLoop, shared: Arc<Shared>, inbound: InboundSender) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                tracing::debug!(
                    topic = %publish.topic,
                    bytes = publish.payload.len(),
                    "Inbound publish"
                );
                let frame = InboundFrame {
                    topic: publish.topic,
                    payload: publish.payload,
                };
                if inbound.send(frame).is_err() {
                    tracing::trace!("Inbound receiver dropped, discarding publish");
                }
            }
            Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                shared.acks().resolve(ack.pkid, Ack::Subscribed(ack.return_codes));
            }
            Ok(Event::Incoming(Incoming::UnsubAck(ack))) => {
                shared.acks().resolve(ack.pkid, Ack::Unsubscribed);
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(packet_id)))
            | Ok(Event::Outgoing(Outgoing::Unsubscribe(packet_id))) => {
                shared.acks().assign(packet_id);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::debug!("DISCONNECT sent");
                break;
            }
            Ok(Event::Incoming(Incoming::PingResp)) => tracing::trace!("Ping response"),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "MQTT connection lost");
                break;
            }
        }
    }
    shared.close();
}

fn connection_error(error: ConnectionError) -> TransportError {
    match error {
        ConnectionError::ConnectionRefused(code) => TransportError::Refused(refusal_reason(code)),
        ConnectionError::Io(e) => TransportError::Io(e),
        other => TransportError::Session(other.to_string()),
    }
}

fn refusal_reason(code: ConnectReturnCode) -> String {
    match code {
        ConnectReturnCode::Success => "accepted".to_string(),
        ConnectReturnCode::RefusedProtocolVersion => "unacceptable protocol version".to_string(),
        ConnectReturnCode::BadClientId => "client identifier rejected".to_string(),
        ConnectReturnCode::ServiceUnavailable => "server unavailable".to_string(),
        ConnectReturnCode::BadUserNamePassword => "bad user name or password".to_string(),
        ConnectReturnCode::NotAuthorized => "not authorized".to_string(),
    }
}
