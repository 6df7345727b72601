//! # GeoPhoto
//!
//! Share geotagged photos over a publish/subscribe broker. Peers join a named
//! channel, publish a photo together with where and when it was taken, and
//! see every photo published to the channel, including their own.
//!
//! ## Features
//!
//! - **Self-describing messages**: compact JSON with the image as base64
//! - **MQTT 3.1.1 transport**: clean sessions, at-most-once delivery
//! - **Single active channel**: switch channels without losing the previous one
//! - **Resilient delivery**: undecodable frames are dropped and reported, never fatal
//!
//! ## Modules
//!
//! - [`codec`]: Message model and wire format
//! - [`transport`]: Broker connections (MQTT and in-process)
//! - [`client`]: Connection, subscription, publishing and inbound dispatch
//! - [`sources`]: Location, image and presentation collaborators
//! - [`config`]: TOML configuration with environment overrides
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use geophoto::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Deliveries land on this channel
//!     let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Delivery>();
//!
//!     let config = BrokerConfig::new("broker.hivemq.com", 1883);
//!     let client = GeoPhotoClient::mqtt(&config, Arc::new(tx));
//!
//!     client.connect().await?;
//!     client.subscribe("fotos/sala-1").await?;
//!
//!     // Publish a photo taken here, today
//!     let jpeg = std::fs::read("photo.jpg")?;
//!     let message = GeoPhotoMessage::captured_today(Coordinates::new(37.7, -122.4), jpeg);
//!     client.publish(message).await?;
//!
//!     // Our own message comes back through the subscription
//!     if let Some(delivery) = rx.recv().await {
//!         println!("{} on {}", delivery.message.coordinates, delivery.topic);
//!     }
//!
//!     client.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod sources;
pub mod transport;

// Re-export top-level types for convenience
pub use codec::{decode, encode, CodecError, CodecResult, Coordinates, GeoPhotoMessage, WireFrame};

pub use client::{
    ChannelSubscription, ConnectionManager, ConnectionState, DispatchStats, GeoPhotoClient,
    InboundDispatcher, Publisher,
};

pub use error::{ClientError, ClientResult, Operation};

pub use sources::{
    looks_like_jpeg, Delivery, FileImageSource, FixedLocation, ImageSource, LocationSource,
    ObservabilitySink, PresentationSink, TracingObserver,
};

pub use transport::{
    Connector, InboundFrame, MemoryBroker, MemoryBrokerConfig, MemoryConnector, MqttConnector,
    MqttOptions, Transport, TransportError, TransportResult,
};

pub use config::{BrokerConfig, Config, ConfigError, LoggingConfig};
