//! # rill-core
//!
//! Addressing and serialization primitives shared by the rill RPC layer.
//!
//! This crate holds the small vocabulary every other piece speaks:
//!
//! - [`UID`]: 128-bit receiver token
//! - [`NetworkAddress`]: IP + port + flags
//! - [`Endpoint`]: address + token, the unit of RPC addressing
//! - [`MessageCodec`] / [`JsonCodec`]: pluggable wire serialization
//! - [`TaskPriority`]: delivery priority threaded through registration
//!
//! Application code and transport implementations depend on these types;
//! the typed handles live in `rill-rpc`.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod codec;
mod priority;
mod types;

pub use codec::{CodecError, JsonCodec, MessageCodec};
pub use priority::TaskPriority;
pub use types::{Endpoint, NetworkAddress, NetworkAddressParseError, UID, flags};
