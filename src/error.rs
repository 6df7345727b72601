//! Client error types
//!
//! Every failure of a broker operation reaches the caller through the
//! operation's own result. Nothing is retried.

use std::fmt;
use thiserror::Error;

use crate::codec::CodecError;

/// A broker operation triggered by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Connect,
    Subscribe,
    Unsubscribe,
    Publish,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Connect => "connect",
            Operation::Subscribe => "subscribe",
            Operation::Unsubscribe => "unsubscribe",
            Operation::Publish => "publish",
        };
        f.write_str(name)
    }
}

/// Errors that can occur in the client
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    /// The message could not be encoded
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// An inbound frame could not be decoded
    #[error("Decoding error: {0}")]
    Decoding(String),

    /// The connection handshake failed
    #[error("Connection error: {reason}")]
    Connection { reason: String },

    /// The operation needs an established connection
    #[error("Not connected to the broker")]
    NotConnected,

    /// The operation needs a subscribed channel
    #[error("No active channel")]
    NoActiveChannel,

    /// The broker did not accept the publish
    #[error("Publish error: {reason}")]
    Publish { reason: String },

    /// Subscribing or unsubscribing failed
    #[error("Subscription error: {reason}")]
    Subscription { reason: String },

    /// The broker did not answer in time
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: Operation, seconds: u64 },

    /// The location source had no fix
    #[error("Location unavailable")]
    LocationUnavailable,

    /// The image source produced nothing
    #[error("No image selected")]
    NoImageSelected,

    /// The image source failed
    #[error("Image source error: {0}")]
    ImageSource(String),
}

impl From<CodecError> for ClientError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Encoding(msg) => ClientError::Encoding(msg),
            CodecError::Decoding(msg) => ClientError::Decoding(msg),
        }
    }
}

/// Result type alias for client operations
pub type ClientResult<T> = Result<T, ClientError>;
