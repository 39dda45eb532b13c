//! Task priorities for endpoint registration.
//!
//! Every receiver is registered with the transport at a priority; the
//! transport uses it to order delivery work when draining its read loop.
//! The RPC layer only threads the value through — scheduling semantics
//! belong to the transport implementation.

use serde::{Deserialize, Serialize};

/// Delivery priority attached to an endpoint at registration time.
///
/// Higher variants are drained first. Reply endpoints default to a higher
/// priority than request endpoints so responses jump ahead of fresh work.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum TaskPriority {
    /// Socket read servicing; above all endpoint work.
    ReadSocket = 9000,
    /// Default priority for one-shot reply endpoints.
    DefaultPromiseEndpoint = 8100,
    /// Default priority for request and stream endpoints.
    #[default]
    DefaultEndpoint = 7500,
    /// Background traffic that should yield to everything above.
    Low = 2000,
}
