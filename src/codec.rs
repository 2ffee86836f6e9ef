use serde::{de::DeserializeOwned, Serialize};

use crate::error::CodecError;

/// Trait for turning objects into UTF-8 text and back.
///
/// The wire envelope carries serialized objects as UTF-8 text, so codecs
/// produce `String`s rather than raw bytes. Swapping the codec does not
/// change the frame layout.
pub trait Codec: Send + Sync + std::fmt::Debug {
    /// Encode a serializable value into UTF-8 text.
    fn encode<T: Serialize>(&self, value: &T) -> Result<String, CodecError>;

    /// Decode UTF-8 text into a deserializable value.
    fn decode<T: DeserializeOwned>(&self, text: &str) -> Result<T, CodecError>;
}

/// Default codec (JSON via serde_json).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<String, CodecError> {
        serde_json::to_string(value).map_err(|e| CodecError::Serialize(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, text: &str) -> Result<T, CodecError> {
        serde_json::from_str(text).map_err(|e| CodecError::Deserialize(e.to_string()))
    }
}

/// JSON codec that pretty-prints outgoing payloads.
///
/// Interoperates with [`JsonCodec`]; only the outgoing text differs.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrettyJsonCodec;

impl Codec for PrettyJsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<String, CodecError> {
        serde_json::to_string_pretty(value).map_err(|e| CodecError::Serialize(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, text: &str) -> Result<T, CodecError> {
        serde_json::from_str(text).map_err(|e| CodecError::Deserialize(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        id: u64,
        name: String,
    }

    #[test]
    fn test_json_round_trip() {
        let codec = JsonCodec;
        let sample = Sample {
            id: 7,
            name: "seven".to_string(),
        };

        let text = codec.encode(&sample).unwrap();
        assert!(text.contains("\"name\":\"seven\""));

        let back: Sample = codec.decode(&text).unwrap();
        assert_eq!(back, sample);
    }

    #[test]
    fn test_pretty_json_interoperates() {
        let pretty = PrettyJsonCodec;
        let plain = JsonCodec;
        let sample = Sample {
            id: 1,
            name: "one".to_string(),
        };

        let text = pretty.encode(&sample).unwrap();
        let back: Sample = plain.decode(&text).unwrap();
        assert_eq!(back, sample);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let codec = JsonCodec;
        let result: Result<Sample, _> = codec.decode("not json at all");
        assert!(matches!(result, Err(CodecError::Deserialize(_))));
    }
}
