//! External Collaborators
//!
//! The client consumes three things it does not produce itself: a position,
//! an image, and somewhere to show results. Each is a small trait so the same
//! core runs behind a CLI, a test harness, or a device shell.

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::mpsc;

use crate::codec::{CodecError, Coordinates, GeoPhotoMessage};
use crate::error::{ClientError, Operation};

/// Supplies the device position
#[async_trait]
pub trait LocationSource: Send + Sync {
    /// Current position, or `None` when no fix is available
    async fn current_location(&self) -> Option<Coordinates>;
}

/// Supplies image bytes to publish
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// The selected image, or `None` when nothing was selected
    async fn next_image(&self) -> Result<Option<Vec<u8>>, ClientError>;
}

/// Receives decoded messages and user-facing failure notifications
pub trait PresentationSink: Send + Sync {
    /// A message arrived on `topic`, possibly one this client published
    fn on_message(&self, topic: &str, message: GeoPhotoMessage);

    /// An operation the user triggered failed; called once per failure
    fn on_failure(&self, operation: Operation, error: &ClientError) {
        let _ = (operation, error);
    }

    /// An operation the user triggered succeeded
    fn on_success(&self, operation: Operation) {
        let _ = operation;
    }
}

/// Receives inbound frames that could not be decoded
pub trait ObservabilitySink: Send + Sync {
    fn decode_failed(&self, topic: &str, error: &CodecError);
}

/// Logs decode failures through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ObservabilitySink for TracingObserver {
    fn decode_failed(&self, topic: &str, error: &CodecError) {
        tracing::warn!(topic = %topic, error = %error, "Dropped undecodable inbound frame");
    }
}

/// A decoded message together with the channel it arrived on
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub topic: String,
    pub message: GeoPhotoMessage,
}

impl PresentationSink for mpsc::UnboundedSender<Delivery> {
    fn on_message(&self, topic: &str, message: GeoPhotoMessage) {
        let delivery = Delivery {
            topic: topic.to_string(),
            message,
        };
        if self.send(delivery).is_err() {
            tracing::debug!(topic = %topic, "Presentation receiver dropped");
        }
    }
}

/// A location source that always reports the same position
#[derive(Debug, Clone, Copy)]
pub struct FixedLocation(pub Option<Coordinates>);

#[async_trait]
impl LocationSource for FixedLocation {
    async fn current_location(&self) -> Option<Coordinates> {
        self.0
    }
}

/// Reads the image to publish from a file
#[derive(Debug, Clone)]
pub struct FileImageSource {
    path: Option<PathBuf>,
}

impl FileImageSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// A source with no file selected
    pub fn none() -> Self {
        Self { path: None }
    }
}

#[async_trait]
impl ImageSource for FileImageSource {
    async fn next_image(&self) -> Result<Option<Vec<u8>>, ClientError> {
        let Some(path) = &self.path else {
            return Ok(None);
        };

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ClientError::ImageSource(format!("{}: {}", path.display(), e)))?;

        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(bytes))
    }
}

/// Cheap check for the JPEG start-of-image marker
///
/// Full validation belongs to whatever renders the image.
pub fn looks_like_jpeg(bytes: &[u8]) -> bool {
    bytes.len() >= 3 && bytes[0] == 0xFF && bytes[1] == 0xD8 && bytes[2] == 0xFF
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_looks_like_jpeg() {
        assert!(looks_like_jpeg(&[0xFF, 0xD8, 0xFF, 0xE0]));
        assert!(!looks_like_jpeg(&[0x89, b'P', b'N', b'G']));
        assert!(!looks_like_jpeg(&[0xFF, 0xD8]));
    }

    #[tokio::test]
    async fn test_fixed_location() {
        let coords = Coordinates::new(1.0, 2.0);
        assert_eq!(FixedLocation(Some(coords)).current_location().await, Some(coords));
        assert_eq!(FixedLocation(None).current_location().await, None);
    }

    #[tokio::test]
    async fn test_file_image_source() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0xFF, 0xD8, 0xFF, 0xD9]).unwrap();

        let source = FileImageSource::new(file.path());
        assert_eq!(
            source.next_image().await.unwrap(),
            Some(vec![0xFF, 0xD8, 0xFF, 0xD9])
        );
    }

    #[tokio::test]
    async fn test_file_image_source_empty_and_missing() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(FileImageSource::new(file.path()).next_image().await.unwrap(), None);
        assert_eq!(FileImageSource::none().next_image().await.unwrap(), None);

        let result = FileImageSource::new("/nonexistent/photo.jpg").next_image().await;
        assert!(matches!(result, Err(ClientError::ImageSource(_))));
    }

    #[test]
    fn test_channel_presentation_sink() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let message = GeoPhotoMessage::captured_today(Coordinates::new(0.0, 0.0), vec![1]);
        tx.on_message("c1", message.clone());

        let delivery = rx.try_recv().unwrap();
        assert_eq!(delivery.topic, "c1");
        assert_eq!(delivery.message, message);
    }
}
