//! Error types for request/reply operations.
//!
//! [`ReplyError`] is the error half of every `ErrorOr<T>` payload, so it is
//! serializable and travels over the wire (a server dropping its reply
//! promise sends `BrokenPromise` to the waiting client). Transport-level
//! faults never surface here directly; they are translated into
//! `RequestMaybeDelivered` or `EndpointFailed` by the failure-monitor
//! compositions on the caller side.

use serde::{Deserialize, Serialize};

/// Error delivered to a reply future or stream consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum ReplyError {
    /// The producer dropped its reply side without sending.
    #[error("reply side dropped without sending")]
    BrokenPromise,

    /// A disconnect happened during or after the send; the request may have
    /// been delivered zero or one times. The caller decides whether a retry
    /// is safe.
    #[error("disconnected; request delivered zero or one times")]
    RequestMaybeDelivered,

    /// The failure monitor declared the endpoint failed for the configured
    /// duration/slope.
    #[error("endpoint failed")]
    EndpointFailed,

    /// The producer finished the stream; normal termination.
    #[error("end of stream")]
    EndOfStream,

    /// A payload could not be serialized.
    #[error("serialization error: {message}")]
    Serialization {
        /// Codec error description.
        message: String,
    },

    /// Application-level failure carried inside `ErrorOr<T>`.
    #[error("application error: {message}")]
    Application {
        /// Application-supplied description.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_failure() {
        assert!(ReplyError::BrokenPromise.to_string().contains("dropped"));
        assert!(
            ReplyError::RequestMaybeDelivered
                .to_string()
                .contains("zero or one")
        );
        assert_eq!(ReplyError::EndOfStream.to_string(), "end of stream");
        assert_eq!(
            ReplyError::Serialization {
                message: "bad value".to_string()
            }
            .to_string(),
            "serialization error: bad value"
        );
    }

    #[test]
    fn wire_roundtrip() {
        let errors = vec![
            ReplyError::BrokenPromise,
            ReplyError::RequestMaybeDelivered,
            ReplyError::EndpointFailed,
            ReplyError::EndOfStream,
            ReplyError::Serialization {
                message: "bad value".to_string(),
            },
            ReplyError::Application {
                message: "key not found".to_string(),
            },
        ];
        for error in errors {
            let json = serde_json::to_string(&error).expect("serialize");
            let decoded: ReplyError = serde_json::from_str(&json).expect("deserialize");
            assert_eq!(error, decoded);
        }
    }
}
