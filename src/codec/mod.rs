//! Geotagged Photo Codec
//!
//! Converts a [`GeoPhotoMessage`] to and from the single text frame carried
//! over the broker. The frame is a compact JSON document:
//!
//! ```text
//! {"localizacao":{"latitude":37.7,"longitude":-122.4},"data":"2024-01-01","imagem":"/9j/4AAQ..."}
//! ```
//!
//! The image is base64 encoded with the standard padded alphabet and no line
//! wrapping, so an encoded frame never contains a newline.

pub mod types;
pub mod wire;

pub use types::{Coordinates, GeoPhotoMessage, WireFrame};
pub use wire::{decode, encode, CodecError, CodecResult};
