//! The transport contract and its process-wide installation point.
//!
//! The RPC layer does not do framing, connection management, or I/O; it
//! consumes a [`Transport`] installed once per runtime. Production embeds
//! its real byte-level transport; tests install
//! [`LoopbackTransport`](crate::LoopbackTransport). Receivers reach the
//! installed instance through [`transport()`], mirroring the singleton
//! access pattern of the surrounding system.

use std::cell::RefCell;
use std::rc::Rc;

use rill_core::{Endpoint, TaskPriority, UID};

use crate::receiver::MessageReceiver;

/// Byte-level message transport consumed by the RPC layer.
///
/// Implementations route payloads by endpoint token, maintain per-peer
/// keepalive counts, and offer two delivery modes: unreliable at-most-once
/// and reliable (retransmitted) at-least-once.
pub trait Transport {
    /// Register `receiver` under a freshly allocated token and return the
    /// complete local endpoint.
    fn add_endpoint(&self, receiver: Rc<dyn MessageReceiver>, priority: TaskPriority) -> Endpoint;

    /// Register `receiver` under a caller-chosen, operator-stable token.
    ///
    /// # Panics
    ///
    /// Registering a token twice is a protocol violation and panics.
    fn add_well_known_endpoint(
        &self,
        token: UID,
        receiver: Rc<dyn MessageReceiver>,
        priority: TaskPriority,
    ) -> Endpoint;

    /// Unregister a previously added local endpoint.
    fn remove_endpoint(&self, endpoint: &Endpoint);

    /// Record a keepalive reference to a remote endpoint's peer.
    fn add_peer_reference(&self, endpoint: &Endpoint, is_stream: bool);

    /// Release a keepalive reference taken by [`add_peer_reference`].
    ///
    /// [`add_peer_reference`]: Transport::add_peer_reference
    fn remove_peer_reference(&self, endpoint: &Endpoint, is_stream: bool);

    /// Send `payload` at most once. Delivery silently fails on connection
    /// loss; `open_connection` asks the transport to dial the peer if no
    /// connection exists.
    fn send_unreliable(&self, payload: Vec<u8>, destination: &Endpoint, open_connection: bool);

    /// Send `payload` at least once, retransmitting across reconnects until
    /// the returned handle is dropped.
    fn send_reliable(&self, payload: Vec<u8>, destination: &Endpoint) -> ReliableHandle;

    /// Resolve a bare token that arrived on a connection into a full
    /// endpoint, supplying the peer address of that connection.
    fn loaded_endpoint(&self, token: UID) -> Endpoint;
}

/// Cancellation handle for a reliable send.
///
/// Dropping the handle stops retransmission; a request whose caller lost
/// interest must not keep being redelivered.
pub struct ReliableHandle {
    cancel: Option<Box<dyn FnOnce()>>,
}

impl ReliableHandle {
    /// Wrap a cancellation action.
    pub fn new(cancel: impl FnOnce() + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A handle for a send that needs no cancellation (already final).
    pub fn resolved() -> Self {
        Self { cancel: None }
    }

    /// Cancel explicitly instead of via drop.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for ReliableHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

thread_local! {
    static TRANSPORT: RefCell<Option<Rc<dyn Transport>>> = const { RefCell::new(None) };
}

/// Install the runtime's transport. Must precede any handle construction.
///
/// # Panics
///
/// Panics if a transport is already installed; call
/// [`teardown_transport`] first when swapping.
pub fn init_transport(transport: Rc<dyn Transport>) {
    TRANSPORT.with(|slot| {
        let mut slot = slot.borrow_mut();
        assert!(slot.is_none(), "transport already installed");
        *slot = Some(transport);
    });
}

/// The installed transport.
///
/// # Panics
///
/// Panics if [`init_transport`] has not run on this runtime.
pub fn transport() -> Rc<dyn Transport> {
    try_transport().expect("no transport installed; call init_transport() first")
}

/// The installed transport, or `None` during shutdown.
pub(crate) fn try_transport() -> Option<Rc<dyn Transport>> {
    TRANSPORT.with(|slot| slot.borrow().clone())
}

/// Remove the installed transport. Receivers dropped afterwards skip their
/// transport teardown instead of panicking.
pub fn teardown_transport() {
    TRANSPORT.with(|slot| slot.borrow_mut().take());
}
