//! Pluggable wire serialization.
//!
//! The [`MessageCodec`] trait abstracts the byte format messages take on
//! the wire. [`JsonCodec`] is the provided implementation; a deployment
//! that needs a binary format implements the trait and plugs it into its
//! transport.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Error from a codec operation.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Failed to encode a message to bytes.
    #[error("encode error: {0}")]
    Encode(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// Failed to decode bytes to a message.
    #[error("decode error: {0}")]
    Decode(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// A serialization format for wire messages.
///
/// Message types are bounded by serde's `Serialize`/`DeserializeOwned`;
/// the codec only chooses the byte representation.
pub trait MessageCodec: Clone + 'static {
    /// Encode a message to bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if serialization fails.
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes into a message.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] if deserialization fails.
    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec over `serde_json`.
///
/// Human-readable and schema-free, which makes wire traffic easy to
/// inspect while debugging distributed scenarios.
#[derive(Clone, Copy, Default, Debug)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(msg).map_err(|e| CodecError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(buf).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        id: u32,
        body: String,
    }

    #[test]
    fn json_roundtrip() {
        let codec = JsonCodec;
        let msg = Sample {
            id: 7,
            body: "payload".to_string(),
        };
        let bytes = codec.encode(&msg).expect("encode");
        let decoded: Sample = codec.decode(&bytes).expect("decode");
        assert_eq!(msg, decoded);
    }

    #[test]
    fn json_decode_failure_is_reported() {
        let codec = JsonCodec;
        let result: Result<Sample, CodecError> = codec.decode(b"{ truncated");
        let err = result.err().expect("should fail");
        assert!(matches!(err, CodecError::Decode(_)));
        assert!(err.to_string().contains("decode error"));
    }

    #[test]
    fn json_type_mismatch_is_a_decode_error() {
        let codec = JsonCodec;
        let bytes = codec.encode(&42u64).expect("encode");
        let result: Result<Sample, CodecError> = codec.decode(&bytes);
        assert!(result.is_err());
    }
}
