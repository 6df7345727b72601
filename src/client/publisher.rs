//! Publisher
//!
//! Encodes a message and sends it as one frame on the active channel. The
//! publish is at-most-once: success means the broker connection accepted the
//! frame, nothing more. Because the sender is normally subscribed to the same
//! channel, a successful publish usually comes back through the dispatcher.

use std::sync::Arc;

use super::bounded;
use super::connection::ConnectionManager;
use super::subscription::ChannelSubscription;
use crate::codec::{self, GeoPhotoMessage};
use crate::error::{ClientError, ClientResult, Operation};

pub struct Publisher {
    connection: Arc<ConnectionManager>,
    subscription: Arc<ChannelSubscription>,
    max_payload_bytes: usize,
}

impl Publisher {
    pub fn new(
        connection: Arc<ConnectionManager>,
        subscription: Arc<ChannelSubscription>,
        max_payload_bytes: usize,
    ) -> Self {
        Self {
            connection,
            subscription,
            max_payload_bytes,
        }
    }

    /// Encode and publish `message` on the active channel
    pub async fn publish(&self, message: GeoPhotoMessage) -> ClientResult<()> {
        let transport = self.connection.transport().await?;
        let channel = self
            .subscription
            .active_channel()
            .await
            .ok_or(ClientError::NoActiveChannel)?;

        let frame = codec::encode(&message)?;

        if frame.len() > self.max_payload_bytes {
            return Err(ClientError::Publish {
                reason: format!(
                    "encoded message is {} bytes, limit is {} bytes",
                    frame.len(),
                    self.max_payload_bytes
                ),
            });
        }

        let size = frame.len();
        bounded(
            self.connection.operation_timeout(),
            Operation::Publish,
            async {
                transport
                    .publish(&channel, frame.into_payload())
                    .await
                    .map_err(|e| ClientError::Publish {
                        reason: e.to_string(),
                    })
            },
        )
        .await?;

        tracing::info!(channel = %channel, bytes = size, "Published message");
        Ok(())
    }
}
