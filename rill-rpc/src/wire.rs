//! Payload encoding for the RPC layer.
//!
//! The transport moves opaque bytes; this module is where typed values
//! become those bytes. One process-wide codec ([`JsonCodec`]) is used for
//! every payload so that a token deserialized on one side always pairs
//! with an encoder the other side understands.

use rill_core::{JsonCodec, MessageCodec};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::ReplyError;

/// Bound for anything that can travel as a payload: requests, replies, and
/// the typed handles embedded in them.
///
/// Blanket-implemented; user types only need the serde derives.
pub trait Message: Serialize + DeserializeOwned + 'static {}

impl<T: Serialize + DeserializeOwned + 'static> Message for T {}

/// Encode a payload with the process-wide wire codec.
pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, rill_core::CodecError> {
    JsonCodec.encode(value)
}

/// Decode a payload with the process-wide wire codec.
pub(crate) fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, rill_core::CodecError> {
    JsonCodec.decode(buf)
}

/// Encode `value` as the success arm of an `ErrorOr` payload.
pub(crate) fn encode_ok<T: Serialize>(value: &T) -> Result<Vec<u8>, rill_core::CodecError> {
    encode(&Ok::<&T, ReplyError>(value))
}

/// Encode `error` as the failure arm of an `ErrorOr` payload.
///
/// Infallible in practice: `ReplyError` has no unserializable states.
pub(crate) fn encode_err<T: Serialize>(error: &ReplyError) -> Option<Vec<u8>> {
    match encode(&Err::<T, &ReplyError>(error)) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode error payload");
            None
        }
    }
}
