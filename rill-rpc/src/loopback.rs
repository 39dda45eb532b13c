//! In-process transport for tests and single-process embedding.
//!
//! [`LoopbackTransport`] routes payloads between *simulated hosts*: each
//! host is an address with its own endpoint table and a reachability flag.
//! One instance plays every process in a scenario; [`set_local`] moves the
//! registration context between hosts the way execution would move between
//! processes. Reliable sends are retained until cancelled, so redelivery
//! (reconnects, duplication) can be driven explicitly.
//!
//! [`set_local`]: LoopbackTransport::set_local

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use rill_core::{Endpoint, NetworkAddress, TaskPriority, UID};

use crate::endpoint_map::EndpointMap;
use crate::receiver::MessageReceiver;
use crate::transport::{ReliableHandle, Transport};

struct Host {
    endpoints: EndpointMap,
    reachable: bool,
}

#[derive(Default, Clone, Copy)]
struct PeerRefs {
    plain: usize,
    stream: usize,
}

struct ReliableEntry {
    source: NetworkAddress,
    destination: Endpoint,
    payload: Vec<u8>,
}

struct LoopbackState {
    current: RefCell<NetworkAddress>,
    deserializing_from: RefCell<Option<NetworkAddress>>,
    hosts: RefCell<HashMap<NetworkAddress, Host>>,
    peer_refs: RefCell<HashMap<NetworkAddress, PeerRefs>>,
    reliable: RefCell<BTreeMap<u64, ReliableEntry>>,
    next_token: Cell<u64>,
    next_reliable: Cell<u64>,
    endpoints_added: Cell<u64>,
    endpoint_removals: Cell<u64>,
    unreliable_dropped: Cell<u64>,
}

/// Multi-host in-memory [`Transport`].
///
/// Cheap to clone; clones share state, so tests keep one handle for
/// driving the scenario and install another as the process transport.
#[derive(Clone)]
pub struct LoopbackTransport {
    state: Rc<LoopbackState>,
}

impl LoopbackTransport {
    /// A transport with a single host at `local`, which is also the
    /// current registration context.
    pub fn new(local: NetworkAddress) -> Self {
        let transport = Self {
            state: Rc::new(LoopbackState {
                current: RefCell::new(local.clone()),
                deserializing_from: RefCell::new(None),
                hosts: RefCell::new(HashMap::new()),
                peer_refs: RefCell::new(HashMap::new()),
                reliable: RefCell::new(BTreeMap::new()),
                next_token: Cell::new(1),
                next_reliable: Cell::new(1),
                endpoints_added: Cell::new(0),
                endpoint_removals: Cell::new(0),
                unreliable_dropped: Cell::new(0),
            }),
        };
        transport.add_host(local);
        transport
    }

    /// Create a host for `address` if none exists.
    pub fn add_host(&self, address: NetworkAddress) {
        self.state.hosts.borrow_mut().entry(address).or_insert(Host {
            endpoints: EndpointMap::new(),
            reachable: true,
        });
    }

    /// Make `address` the registration context for subsequent local
    /// endpoints, creating its host on first use. Delivery switches the
    /// context to the destination host automatically while a receiver
    /// runs.
    pub fn set_local(&self, address: NetworkAddress) {
        self.add_host(address.clone());
        *self.state.current.borrow_mut() = address;
    }

    /// The current registration context.
    pub fn local_address(&self) -> NetworkAddress {
        self.state.current.borrow().clone()
    }

    /// Toggle whether sends to `address` are delivered. Raising a host
    /// back up redelivers every retained reliable send destined for it.
    pub fn set_reachable(&self, address: &NetworkAddress, reachable: bool) {
        {
            let mut hosts = self.state.hosts.borrow_mut();
            if let Some(host) = hosts.get_mut(address) {
                host.reachable = reachable;
            }
        }
        if reachable {
            self.redeliver_reliable_to(Some(address));
        }
    }

    /// Redeliver every retained reliable send, imitating the duplicate
    /// deliveries a reconnecting transport can produce.
    pub fn redeliver_reliable(&self) {
        self.redeliver_reliable_to(None);
    }

    fn redeliver_reliable_to(&self, only: Option<&NetworkAddress>) {
        let pending: Vec<(NetworkAddress, Endpoint, Vec<u8>)> = self
            .state
            .reliable
            .borrow()
            .values()
            .filter(|e| only.is_none_or(|addr| e.destination.address == *addr))
            .map(|e| (e.source.clone(), e.destination.clone(), e.payload.clone()))
            .collect();
        for (source, destination, payload) in pending {
            self.deliver(source, &destination, &payload);
        }
    }

    /// Keepalive references held against `address`.
    pub fn peer_reference_count(&self, address: &NetworkAddress) -> usize {
        self.state
            .peer_refs
            .borrow()
            .get(address)
            .map(|r| r.plain + r.stream)
            .unwrap_or(0)
    }

    /// Registrations over this transport's lifetime.
    pub fn endpoints_added(&self) -> u64 {
        self.state.endpoints_added.get()
    }

    /// Removal calls over this transport's lifetime (well-known endpoints
    /// count the call even though the entry stays).
    pub fn endpoint_removals(&self) -> u64 {
        self.state.endpoint_removals.get()
    }

    /// Unreliable payloads dropped for unreachable or missing receivers.
    pub fn unreliable_dropped(&self) -> u64 {
        self.state.unreliable_dropped.get()
    }

    /// Live registered endpoints on the host at `address`.
    pub fn live_endpoint_count(&self, address: &NetworkAddress) -> usize {
        self.state
            .hosts
            .borrow()
            .get(address)
            .map(|h| h.endpoints.live_count())
            .unwrap_or(0)
    }

    /// Retained (uncancelled) reliable sends.
    pub fn reliable_in_flight(&self) -> usize {
        self.state.reliable.borrow().len()
    }

    fn allocate_token(&self) -> UID {
        let n = self.state.next_token.get();
        self.state.next_token.set(n + 1);
        // Mixed second half keeps generated tokens visually distinct from
        // the small literals tests use for well-known endpoints.
        UID::new(n, n.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1)
    }

    /// Route one payload to its destination receiver, running it in the
    /// destination host's context. Returns whether a receiver took it.
    fn deliver(&self, source: NetworkAddress, destination: &Endpoint, payload: &[u8]) -> bool {
        let receiver = {
            let hosts = self.state.hosts.borrow();
            match hosts.get(&destination.address) {
                Some(host) if host.reachable => host.endpoints.get(&destination.token),
                _ => None,
            }
        };
        let Some(receiver) = receiver else {
            tracing::trace!(
                token = %destination.token,
                address = %destination.address,
                "dropping payload: unreachable host or no receiver"
            );
            return false;
        };

        // Receivers may reenter the transport (nested sends, lazy
        // registration while decoding), so the context swap must nest.
        let previous_from = self.state.deserializing_from.replace(Some(source));
        let previous_current = self
            .state
            .current
            .replace(destination.address.clone());
        receiver.receive(payload);
        self.state.current.replace(previous_current);
        self.state.deserializing_from.replace(previous_from);
        true
    }
}

impl Transport for LoopbackTransport {
    fn add_endpoint(&self, receiver: Rc<dyn MessageReceiver>, priority: TaskPriority) -> Endpoint {
        let address = self.local_address();
        let token = self.allocate_token();
        let mut hosts = self.state.hosts.borrow_mut();
        let host = hosts
            .get_mut(&address)
            .expect("current host always exists");
        host.endpoints.insert(token, &receiver, priority);
        self.state
            .endpoints_added
            .set(self.state.endpoints_added.get() + 1);
        Endpoint::new(address, token)
    }

    fn add_well_known_endpoint(
        &self,
        token: UID,
        receiver: Rc<dyn MessageReceiver>,
        priority: TaskPriority,
    ) -> Endpoint {
        let address = self.local_address();
        let mut hosts = self.state.hosts.borrow_mut();
        let host = hosts
            .get_mut(&address)
            .expect("current host always exists");
        host.endpoints.insert_well_known(token, &receiver, priority);
        self.state
            .endpoints_added
            .set(self.state.endpoints_added.get() + 1);
        Endpoint::new(address, token)
    }

    fn remove_endpoint(&self, endpoint: &Endpoint) {
        self.state
            .endpoint_removals
            .set(self.state.endpoint_removals.get() + 1);
        let mut hosts = self.state.hosts.borrow_mut();
        if let Some(host) = hosts.get_mut(&endpoint.address) {
            host.endpoints.remove(&endpoint.token);
        }
    }

    fn add_peer_reference(&self, endpoint: &Endpoint, is_stream: bool) {
        let mut refs = self.state.peer_refs.borrow_mut();
        let entry = refs.entry(endpoint.address.clone()).or_default();
        if is_stream {
            entry.stream += 1;
        } else {
            entry.plain += 1;
        }
    }

    fn remove_peer_reference(&self, endpoint: &Endpoint, is_stream: bool) {
        let mut refs = self.state.peer_refs.borrow_mut();
        let entry = refs.entry(endpoint.address.clone()).or_default();
        let count = if is_stream {
            &mut entry.stream
        } else {
            &mut entry.plain
        };
        assert!(*count > 0, "peer reference released twice");
        *count -= 1;
    }

    fn send_unreliable(&self, payload: Vec<u8>, destination: &Endpoint, _open_connection: bool) {
        let source = self.local_address();
        if !self.deliver(source, destination, &payload) {
            self.state
                .unreliable_dropped
                .set(self.state.unreliable_dropped.get() + 1);
        }
    }

    fn send_reliable(&self, payload: Vec<u8>, destination: &Endpoint) -> ReliableHandle {
        let source = self.local_address();
        let id = self.state.next_reliable.get();
        self.state.next_reliable.set(id + 1);
        self.state.reliable.borrow_mut().insert(
            id,
            ReliableEntry {
                source: source.clone(),
                destination: destination.clone(),
                payload: payload.clone(),
            },
        );
        self.deliver(source, destination, &payload);

        let state = Rc::clone(&self.state);
        ReliableHandle::new(move || {
            state.reliable.borrow_mut().remove(&id);
        })
    }

    fn loaded_endpoint(&self, token: UID) -> Endpoint {
        let address = self
            .state
            .deserializing_from
            .borrow()
            .clone()
            .unwrap_or_else(|| self.local_address());
        Endpoint::new(address, token)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    fn addr(port: u16) -> NetworkAddress {
        NetworkAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    struct Recorder {
        payloads: RefCell<Vec<Vec<u8>>>,
    }

    impl Recorder {
        fn new() -> Rc<Self> {
            Rc::new(Self {
                payloads: RefCell::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.payloads.borrow().len()
        }
    }

    impl MessageReceiver for Recorder {
        fn receive(&self, payload: &[u8]) {
            self.payloads.borrow_mut().push(payload.to_vec());
        }
    }

    #[test]
    fn routes_between_hosts() {
        let transport = LoopbackTransport::new(addr(1));
        let recorder = Recorder::new();
        let endpoint = transport.add_endpoint(recorder.clone(), TaskPriority::DefaultEndpoint);

        transport.set_local(addr(2));
        transport.send_unreliable(b"hello".to_vec(), &endpoint, true);

        assert_eq!(recorder.count(), 1);
        assert_eq!(transport.unreliable_dropped(), 0);
    }

    #[test]
    fn unreachable_hosts_drop_unreliable_sends() {
        let transport = LoopbackTransport::new(addr(1));
        let recorder = Recorder::new();
        let endpoint = transport.add_endpoint(recorder.clone(), TaskPriority::DefaultEndpoint);

        transport.set_reachable(&addr(1), false);
        transport.send_unreliable(b"lost".to_vec(), &endpoint, true);

        assert_eq!(recorder.count(), 0);
        assert_eq!(transport.unreliable_dropped(), 1);
    }

    #[test]
    fn reliable_sends_survive_reconnects_until_cancelled() {
        let transport = LoopbackTransport::new(addr(1));
        let recorder = Recorder::new();
        let endpoint = transport.add_endpoint(recorder.clone(), TaskPriority::DefaultEndpoint);

        transport.set_reachable(&addr(1), false);
        let handle = transport.send_reliable(b"keep trying".to_vec(), &endpoint);
        assert_eq!(recorder.count(), 0);
        assert_eq!(transport.reliable_in_flight(), 1);

        transport.set_reachable(&addr(1), true);
        assert_eq!(recorder.count(), 1);

        handle.cancel();
        assert_eq!(transport.reliable_in_flight(), 0);
    }

    #[test]
    fn loaded_endpoint_uses_the_sending_host() {
        let transport = LoopbackTransport::new(addr(1));

        struct Resolver {
            transport: LoopbackTransport,
            seen: RefCell<Option<Endpoint>>,
        }

        impl MessageReceiver for Resolver {
            fn receive(&self, _payload: &[u8]) {
                *self.seen.borrow_mut() =
                    Some(self.transport.loaded_endpoint(UID::new(9, 9)));
            }
        }

        let resolver = Rc::new(Resolver {
            transport: transport.clone(),
            seen: RefCell::new(None),
        });
        let endpoint = transport.add_endpoint(resolver.clone(), TaskPriority::DefaultEndpoint);

        transport.set_local(addr(2));
        transport.send_unreliable(b"x".to_vec(), &endpoint, true);

        let seen = resolver.seen.borrow().clone().expect("resolved");
        assert_eq!(seen.address, addr(2));
        assert_eq!(seen.token, UID::new(9, 9));
    }

    #[test]
    fn peer_references_balance() {
        let transport = LoopbackTransport::new(addr(1));
        let endpoint = Endpoint::new(addr(2), UID::new(1, 1));

        transport.add_peer_reference(&endpoint, false);
        transport.add_peer_reference(&endpoint, true);
        assert_eq!(transport.peer_reference_count(&addr(2)), 2);

        transport.remove_peer_reference(&endpoint, false);
        transport.remove_peer_reference(&endpoint, true);
        assert_eq!(transport.peer_reference_count(&addr(2)), 0);
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn peer_reference_underflow_is_fatal() {
        let transport = LoopbackTransport::new(addr(1));
        let endpoint = Endpoint::new(addr(2), UID::new(1, 1));
        transport.remove_peer_reference(&endpoint, false);
    }
}
