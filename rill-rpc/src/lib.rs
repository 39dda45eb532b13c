//! # rill-rpc
//!
//! Typed endpoint-oriented RPC on top of a pluggable message transport.
//!
//! Callers hold strongly-typed handles to remote services and exchange
//! single replies or flow-controlled streams of replies; handles are
//! wire-transparent, serializing to endpoint tokens that the receiving
//! side resolves back into remote handles.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  Application Code                     │
//! │   RequestStream<T> · ReplyPromise<T> · ReplyStream<T> │
//! ├──────────────────────────────────────────────────────┤
//! │   Receivers (typed queues + one-shot values)          │
//! │   · endpoint registration and peer references         │
//! │   · promise/future reference discipline               │
//! │   · byte-credit flow control                          │
//! ├──────────────────────────────────────────────────────┤
//! │   Transport + FailureMonitor (installed contracts)    │
//! │   · reliable / unreliable delivery                    │
//! │   · per-endpoint liveness signals                     │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery guarantees
//!
//! | call | guarantee |
//! |------|-----------|
//! | [`RequestStream::send`] | at most once |
//! | [`RequestStream::get_reply`] | at least once, cancellable |
//! | [`RequestStream::try_get_reply`] | at most once, disconnect-aware |
//! | [`RequestStream::get_reply_stream`] | at most once, streamed |
//! | [`ReplyStream::send`] | at most once, flow controlled |
//!
//! ## Quick start
//!
//! ```ignore
//! use rill_rpc::{init_transport, init_failure_monitor, RequestStream, TaskPriority, UID};
//!
//! init_transport(my_transport);
//! init_failure_monitor(my_monitor);
//!
//! // Server: bind a well-known endpoint and serve.
//! let requests: RequestStream<PingRequest> = RequestStream::new();
//! requests.make_well_known_endpoint(PING_TOKEN, TaskPriority::DefaultEndpoint);
//! while let Some(req) = requests.recv().await {
//!     req.reply.send(Pong { seq: req.seq });
//! }
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// Re-export the core vocabulary for convenience.
pub use rill_core::{
    CodecError, Endpoint, JsonCodec, MessageCodec, NetworkAddress, NetworkAddressParseError,
    TaskPriority, UID, flags,
};

/// Token → receiver routing table for transport implementations.
pub mod endpoint_map;

/// Error types for request/reply operations.
pub mod error;

/// Failure-monitor contract and installation point.
pub mod failure_monitor;

/// In-process transport for tests and single-process embedding.
pub mod loopback;

/// Receiver plumbing: message sinks, endpoint references, ref counts.
pub mod receiver;

/// One-shot reply primitive.
pub mod reply_promise;

/// Flow-controlled reply streams.
pub mod reply_stream;

/// Typed request streams.
pub mod request_stream;

/// Transport contract and installation point.
pub mod transport;

mod wire;

pub use endpoint_map::EndpointMap;
pub use error::ReplyError;
pub use failure_monitor::{
    FailureMonitor, ManualFailureMonitor, MonitorFuture, failure_monitor, init_failure_monitor,
    teardown_failure_monitor,
};
pub use loopback::LoopbackTransport;
pub use receiver::MessageReceiver;
pub use reply_promise::{
    ReplyFuture, ReplyPromise, Request, reset_reply, reset_reply_with_priority, set_reply_priority,
};
pub use reply_stream::{
    ACKNOWLEDGE_WINDOW_BYTES, Acknowledgement, OnErrorFuture, OnReadyFuture, ReplyStream,
    StreamRecvFuture, StreamReply, StreamRequest,
};
pub use request_stream::{
    GetReplyFuture, RecvFuture, ReplyUnlessFailedFuture, RequestStream, TryGetReplyFuture,
};
pub use transport::{ReliableHandle, Transport, init_transport, teardown_transport, transport};
pub use wire::Message;
