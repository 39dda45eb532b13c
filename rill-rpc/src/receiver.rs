//! Receiver plumbing shared by every typed handle.
//!
//! A receiver is the object that accepts deserialized messages for a local
//! endpoint. Each receiver embeds an [`EndpointRef`] holding its transport
//! relationship and a pair of reference counts ([`RefCounts`]) tracking
//! outstanding producers and consumers. Memory lifetime itself rides on
//! `Rc`; the counts drive behavior (broken-promise delivery, stream close).

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use rill_core::{Endpoint, TaskPriority, UID};

use crate::transport::{transport, try_transport};

/// Sink for deserialized messages addressed to a local endpoint.
///
/// The transport dispatches each arriving payload to the receiver
/// registered under the destination token. `receive` runs synchronously on
/// the receiver's runtime.
pub trait MessageReceiver {
    /// Deserialize and deliver one message payload.
    fn receive(&self, payload: &[u8]);

    /// Whether this receiver accepts a sequence of messages rather than
    /// exactly one. The transport may choose stream-appropriate framing.
    fn is_stream(&self) -> bool {
        false
    }
}

enum EndpointState {
    /// No token yet; becomes local on first registration.
    Empty,
    /// Registered with the transport in this process.
    Local(Endpoint),
    /// Refers to a receiver elsewhere; a peer reference is held.
    Remote(Endpoint),
}

/// A receiver's owned relationship to the transport.
///
/// Exactly one teardown call is made per lifetime: local endpoints are
/// unregistered, remote endpoints release their peer reference. Both are
/// skipped if the transport was already torn down.
pub(crate) struct EndpointRef {
    state: RefCell<EndpointState>,
    is_stream: bool,
}

impl EndpointRef {
    /// An unbound reference; lazily becomes local via [`get_endpoint`].
    ///
    /// [`get_endpoint`]: EndpointRef::get_endpoint
    pub(crate) fn empty(is_stream: bool) -> Self {
        Self {
            state: RefCell::new(EndpointState::Empty),
            is_stream,
        }
    }

    /// A reference to a receiver elsewhere; takes a peer reference.
    pub(crate) fn remote(endpoint: Endpoint, is_stream: bool) -> Self {
        transport().add_peer_reference(&endpoint, is_stream);
        Self {
            state: RefCell::new(EndpointState::Remote(endpoint)),
            is_stream,
        }
    }

    pub(crate) fn is_remote(&self) -> bool {
        matches!(&*self.state.borrow(), EndpointState::Remote(_))
    }

    /// The endpoint, if one is bound (local or remote).
    pub(crate) fn endpoint(&self) -> Option<Endpoint> {
        match &*self.state.borrow() {
            EndpointState::Empty => None,
            EndpointState::Local(ep) | EndpointState::Remote(ep) => Some(ep.clone()),
        }
    }

    /// The endpoint when this reference is remote.
    pub(crate) fn remote_endpoint(&self) -> Option<Endpoint> {
        match &*self.state.borrow() {
            EndpointState::Remote(ep) => Some(ep.clone()),
            _ => None,
        }
    }

    /// Return the bound endpoint, registering `receiver` with the transport
    /// first if this reference is still unbound. Repeated calls return the
    /// same endpoint.
    pub(crate) fn get_endpoint(
        &self,
        receiver: &Rc<dyn MessageReceiver>,
        priority: TaskPriority,
    ) -> Endpoint {
        let mut state = self.state.borrow_mut();
        match &*state {
            EndpointState::Local(ep) | EndpointState::Remote(ep) => ep.clone(),
            EndpointState::Empty => {
                let endpoint = transport().add_endpoint(Rc::clone(receiver), priority);
                tracing::trace!(token = %endpoint.token, "registered local endpoint");
                *state = EndpointState::Local(endpoint.clone());
                endpoint
            }
        }
    }

    /// Register `receiver` under a fixed, operator-chosen token.
    ///
    /// # Panics
    ///
    /// The reference must still be unbound; binding twice is a protocol
    /// violation.
    pub(crate) fn make_well_known(
        &self,
        receiver: &Rc<dyn MessageReceiver>,
        token: UID,
        priority: TaskPriority,
    ) {
        let mut state = self.state.borrow_mut();
        assert!(
            matches!(&*state, EndpointState::Empty),
            "cannot make an already-bound endpoint well-known"
        );
        let endpoint = transport().add_well_known_endpoint(token, Rc::clone(receiver), priority);
        *state = EndpointState::Local(endpoint);
    }

    /// Bind an unbound reference to a remote endpoint learned from the
    /// wire, taking a peer reference. Used for acknowledgement
    /// sub-endpoints, which arrive inside the first stream value.
    pub(crate) fn bind_remote(&self, endpoint: Endpoint) {
        let mut state = self.state.borrow_mut();
        assert!(
            matches!(&*state, EndpointState::Empty),
            "endpoint already bound"
        );
        transport().add_peer_reference(&endpoint, self.is_stream);
        *state = EndpointState::Remote(endpoint);
    }
}

impl Drop for EndpointRef {
    fn drop(&mut self) {
        let Some(transport) = try_transport() else {
            return;
        };
        match &*self.state.borrow() {
            EndpointState::Empty => {}
            EndpointState::Local(ep) => transport.remove_endpoint(ep),
            EndpointState::Remote(ep) => transport.remove_peer_reference(ep, self.is_stream),
        }
    }
}

/// Producer/consumer reference counts for a receiver.
///
/// Promise refs are outstanding handles that may still send; future refs
/// are outstanding consumers. The owner reacts when either side hits zero.
pub(crate) struct RefCounts {
    promises: Cell<usize>,
    futures: Cell<usize>,
}

impl RefCounts {
    pub(crate) fn new(promises: usize, futures: usize) -> Self {
        Self {
            promises: Cell::new(promises),
            futures: Cell::new(futures),
        }
    }

    pub(crate) fn add_promise(&self) {
        self.promises.set(self.promises.get() + 1);
    }

    /// Returns `true` when this drop released the last promise reference.
    pub(crate) fn del_promise(&self) -> bool {
        let n = self.promises.get();
        debug_assert!(n > 0, "promise reference underflow");
        self.promises.set(n - 1);
        n == 1
    }

    pub(crate) fn add_future(&self) {
        self.futures.set(self.futures.get() + 1);
    }

    pub(crate) fn del_future(&self) {
        let n = self.futures.get();
        debug_assert!(n > 0, "future reference underflow");
        self.futures.set(n - 1);
    }

    pub(crate) fn promises(&self) -> usize {
        self.promises.get()
    }

    pub(crate) fn futures(&self) -> usize {
        self.futures.get()
    }
}
