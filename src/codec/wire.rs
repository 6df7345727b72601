//! Frame encoding and decoding
//!
//! The JSON document keeps the field names used by the Android peers
//! (`localizacao`, `data`, `imagem`) so both ends interoperate.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::{Coordinates, GeoPhotoMessage, WireFrame};

/// Date layout of the `data` field
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Errors produced by the codec
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The message cannot be turned into a frame
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// The frame cannot be turned back into a message
    #[error("Decoding error: {0}")]
    Decoding(String),
}

/// Result type alias for codec operations
pub type CodecResult<T> = Result<T, CodecError>;

#[derive(Debug, Serialize, Deserialize)]
struct WireDocument {
    localizacao: WireLocation,
    data: String,
    imagem: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireLocation {
    latitude: f64,
    longitude: f64,
}

/// Encode a message into a single text frame
///
/// Fails if the image is empty or the coordinates are not finite numbers
/// inside the valid latitude/longitude ranges.
pub fn encode(message: &GeoPhotoMessage) -> CodecResult<WireFrame> {
    if message.image_bytes.is_empty() {
        return Err(CodecError::Encoding("image bytes are empty".to_string()));
    }
    if !message.coordinates.is_valid() {
        return Err(CodecError::Encoding(format!(
            "invalid coordinates: latitude={}, longitude={}",
            message.coordinates.latitude, message.coordinates.longitude
        )));
    }

    let document = WireDocument {
        localizacao: WireLocation {
            latitude: message.coordinates.latitude,
            longitude: message.coordinates.longitude,
        },
        data: message.captured_date.format(DATE_FORMAT).to_string(),
        imagem: STANDARD.encode(&message.image_bytes),
    };

    let text = serde_json::to_string(&document).map_err(|e| CodecError::Encoding(e.to_string()))?;
    Ok(WireFrame::from_text(text))
}

/// Decode a text frame back into a message
///
/// Only base64 well-formedness of the image is checked here; whether the bytes
/// are a displayable JPEG is left to the presentation layer.
pub fn decode(frame: &WireFrame) -> CodecResult<GeoPhotoMessage> {
    let document: WireDocument =
        serde_json::from_str(frame.as_str()).map_err(|e| CodecError::Decoding(e.to_string()))?;

    let coordinates = Coordinates::new(document.localizacao.latitude, document.localizacao.longitude);
    if !coordinates.is_valid() {
        return Err(CodecError::Decoding(format!(
            "coordinates out of range: latitude={}, longitude={}",
            coordinates.latitude, coordinates.longitude
        )));
    }

    let captured_date = NaiveDate::parse_from_str(&document.data, DATE_FORMAT)
        .map_err(|e| CodecError::Decoding(format!("invalid date {:?}: {}", document.data, e)))?;

    // Android's Base64.DEFAULT wraps lines every 76 characters
    let body: String = document
        .imagem
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    let image_bytes = STANDARD
        .decode(body.as_bytes())
        .map_err(|e| CodecError::Decoding(format!("invalid base64 image: {}", e)))?;
    if image_bytes.is_empty() {
        return Err(CodecError::Decoding("image is empty".to_string()));
    }

    Ok(GeoPhotoMessage {
        coordinates,
        captured_date,
        image_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_jpeg(len: usize) -> Vec<u8> {
        let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0];
        bytes.extend((0..len.saturating_sub(6)).map(|i| (i % 251) as u8));
        bytes.extend([0xFF, 0xD9]);
        bytes
    }

    fn sample_message() -> GeoPhotoMessage {
        GeoPhotoMessage::new(
            Coordinates::new(37.7, -122.4),
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            sample_jpeg(100),
        )
    }

    #[test]
    fn test_roundtrip() {
        let message = sample_message();
        let frame = encode(&message).unwrap();
        let decoded = decode(&frame).unwrap();

        assert_eq!(decoded.image_bytes, message.image_bytes);
        assert_eq!(decoded.captured_date, message.captured_date);
        assert!((decoded.coordinates.latitude - 37.7).abs() < 1e-9);
        assert!((decoded.coordinates.longitude + 122.4).abs() < 1e-9);
    }

    #[test]
    fn test_roundtrip_extreme_coordinates() {
        for (lat, lon) in [(-90.0, -180.0), (90.0, 180.0), (0.0, 0.0), (-33.868820, 151.209296)] {
            let mut message = sample_message();
            message.coordinates = Coordinates::new(lat, lon);
            let decoded = decode(&encode(&message).unwrap()).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn test_encoded_shape() {
        let frame = encode(&sample_message()).unwrap();
        let value: serde_json::Value = serde_json::from_str(frame.as_str()).unwrap();

        assert_eq!(value["localizacao"]["latitude"], 37.7);
        assert_eq!(value["localizacao"]["longitude"], -122.4);
        assert_eq!(value["data"], "2024-01-01");
        assert!(value["imagem"].as_str().unwrap().starts_with("/9j/"));
    }

    #[test]
    fn test_encoded_frame_has_no_newlines() {
        let mut message = sample_message();
        message.image_bytes = sample_jpeg(4096);
        let frame = encode(&message).unwrap();
        assert!(!frame.as_str().contains('\n'));
        assert!(!frame.as_str().contains('\r'));
    }

    #[test]
    fn test_encode_is_deterministic() {
        let message = sample_message();
        assert_eq!(encode(&message).unwrap(), encode(&message).unwrap());
    }

    #[test]
    fn test_encode_rejects_empty_image() {
        let mut message = sample_message();
        message.image_bytes.clear();
        assert!(matches!(encode(&message), Err(CodecError::Encoding(_))));
    }

    #[test]
    fn test_encode_rejects_bad_coordinates() {
        let mut message = sample_message();
        message.coordinates.latitude = f64::NAN;
        assert!(matches!(encode(&message), Err(CodecError::Encoding(_))));

        message.coordinates = Coordinates::new(10.0, 200.0);
        assert!(matches!(encode(&message), Err(CodecError::Encoding(_))));
    }

    #[test]
    fn test_decode_missing_fields() {
        let frames = [
            r#"{"data":"2024-01-01","imagem":"AAEC"}"#,
            r#"{"localizacao":{"longitude":1.0},"data":"2024-01-01","imagem":"AAEC"}"#,
            r#"{"localizacao":{"latitude":1.0},"data":"2024-01-01","imagem":"AAEC"}"#,
            r#"{"localizacao":{"latitude":1.0,"longitude":2.0},"imagem":"AAEC"}"#,
            r#"{"localizacao":{"latitude":1.0,"longitude":2.0},"data":"2024-01-01"}"#,
        ];

        for text in frames {
            let result = decode(&WireFrame::from(text));
            assert!(
                matches!(result, Err(CodecError::Decoding(_))),
                "expected decoding error for {}",
                text
            );
        }
    }

    #[test]
    fn test_decode_invalid_base64() {
        let text = r#"{"localizacao":{"latitude":1.0,"longitude":2.0},"data":"2024-01-01","imagem":"not*base64!"}"#;
        assert!(matches!(
            decode(&WireFrame::from(text)),
            Err(CodecError::Decoding(_))
        ));
    }

    #[test]
    fn test_decode_accepts_wrapped_base64() {
        let image = sample_jpeg(120);
        let encoded = STANDARD.encode(&image);
        let (head, tail) = encoded.split_at(76);
        let text = format!(
            r#"{{"localizacao":{{"latitude":1.5,"longitude":2.5}},"data":"2023-12-31","imagem":"{}\n{}\n"}}"#,
            head, tail
        );

        let decoded = decode(&WireFrame::from(text.as_str())).unwrap();
        assert_eq!(decoded.image_bytes, image);
        assert_eq!(decoded.captured_date, NaiveDate::from_ymd_opt(2023, 12, 31).unwrap());
    }

    #[test]
    fn test_decode_pretty_printed_document() {
        // Layout sent by the original peers
        let text = "{\n    \"localizacao\": {\n        \"latitude\": -23.5,\n        \"longitude\": -46.6\n    },\n    \"data\": \"2024-05-20\",\n    \"imagem\": \"/9j/2Q==\"\n}";
        let decoded = decode(&WireFrame::from(text)).unwrap();
        assert_eq!(decoded.coordinates, Coordinates::new(-23.5, -46.6));
        assert_eq!(decoded.image_bytes, vec![0xFF, 0xD8, 0xFF, 0xD9]);
    }

    #[test]
    fn test_decode_rejects_bad_date() {
        let text = r#"{"localizacao":{"latitude":1.0,"longitude":2.0},"data":"yesterday","imagem":"AAEC"}"#;
        assert!(matches!(
            decode(&WireFrame::from(text)),
            Err(CodecError::Decoding(_))
        ));
    }

    #[test]
    fn test_decode_rejects_non_json() {
        assert!(matches!(
            decode(&WireFrame::from("hello")),
            Err(CodecError::Decoding(_))
        ));
    }
}
