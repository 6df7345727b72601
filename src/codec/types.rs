//! Message types exchanged between peers

use bytes::Bytes;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::wire::{CodecError, CodecResult};

/// A geographic position in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    /// Latitude, -90 to 90
    pub latitude: f64,
    /// Longitude, -180 to 180
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check that both components are finite and inside their ranges
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.6}, {:.6})", self.latitude, self.longitude)
    }
}

/// A photo tagged with where and when it was taken
#[derive(Debug, Clone, PartialEq)]
pub struct GeoPhotoMessage {
    /// Where the photo was taken
    pub coordinates: Coordinates,
    /// Calendar date the photo was captured
    pub captured_date: NaiveDate,
    /// Raw JPEG content
    pub image_bytes: Vec<u8>,
}

impl GeoPhotoMessage {
    /// Create a message from its parts
    pub fn new(coordinates: Coordinates, captured_date: NaiveDate, image_bytes: Vec<u8>) -> Self {
        Self {
            coordinates,
            captured_date,
            image_bytes,
        }
    }

    /// Create a message stamped with today's local date
    pub fn captured_today(coordinates: Coordinates, image_bytes: Vec<u8>) -> Self {
        Self::new(
            coordinates,
            chrono::Local::now().date_naive(),
            image_bytes,
        )
    }
}

/// The serialized text payload of one message
///
/// Created by [`encode`](super::encode) at publish time and consumed once by
/// [`decode`](super::decode) on arrival.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    text: String,
}

impl WireFrame {
    pub(crate) fn from_text(text: String) -> Self {
        Self { text }
    }

    /// Wrap a raw inbound buffer, rejecting anything that is not UTF-8
    pub fn from_bytes(bytes: &[u8]) -> CodecResult<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| CodecError::Decoding(format!("frame is not valid UTF-8: {}", e)))?;
        Ok(Self {
            text: text.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.text.as_bytes()
    }

    /// Size of the frame in bytes
    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Convert into an opaque transport payload
    pub fn into_payload(self) -> Bytes {
        Bytes::from(self.text.into_bytes())
    }
}

impl From<&str> for WireFrame {
    fn from(text: &str) -> Self {
        Self::from_text(text.to_string())
    }
}
