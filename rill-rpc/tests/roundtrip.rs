//! End-to-end request/reply flows across simulated hosts.
//!
//! Exercises the full path: client serializes a request (embedding its
//! reply promise as a token), the loopback transport routes it to the
//! server host, the server fulfils the wire-loaded promise, and the reply
//! lands back in the client's future.

use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;

use rill_rpc::{
    Endpoint, LoopbackTransport, ManualFailureMonitor, NetworkAddress, ReplyError, ReplyPromise,
    Request, RequestStream, TaskPriority, UID, init_failure_monitor, init_transport,
};
use serde::{Deserialize, Serialize};

const WELL_KNOWN_PING: UID = UID::new(0xAAAA_AAAA_AAAA_AAAA, 0xAAAA_AAAA_AAAA_AAAA);

fn addr(port: u16) -> NetworkAddress {
    NetworkAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

fn server_addr() -> NetworkAddress {
    addr(4500)
}

fn client_addr() -> NetworkAddress {
    addr(4501)
}

fn install() -> (LoopbackTransport, ManualFailureMonitor) {
    let transport = LoopbackTransport::new(server_addr());
    transport.add_host(client_addr());
    let monitor = ManualFailureMonitor::new();
    init_transport(Rc::new(transport.clone()));
    init_failure_monitor(Rc::new(monitor.clone()));
    (transport, monitor)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Pong {
    seq: u32,
}

#[derive(Serialize, Deserialize)]
struct PingRequest {
    seq: u32,
    reply: ReplyPromise<Pong>,
}

impl PingRequest {
    fn new(seq: u32) -> Self {
        Self {
            seq,
            reply: ReplyPromise::new(),
        }
    }
}

impl Request for PingRequest {
    type Reply = Pong;

    fn reply(&self) -> &ReplyPromise<Pong> {
        &self.reply
    }

    fn reply_mut(&mut self) -> &mut ReplyPromise<Pong> {
        &mut self.reply
    }
}

/// A client stream handle pointing at the server's well-known token.
fn well_known_client(transport: &LoopbackTransport) -> RequestStream<PingRequest> {
    transport.set_local(client_addr());
    RequestStream::to_endpoint(Endpoint::new(server_addr(), WELL_KNOWN_PING))
}

#[tokio::test]
async fn well_known_round_trip() {
    let (transport, _) = install();

    let server: RequestStream<PingRequest> = RequestStream::new();
    server.make_well_known_endpoint(WELL_KNOWN_PING, TaskPriority::DefaultEndpoint);

    let client = well_known_client(&transport);
    let pending = client.get_reply(PingRequest::new(1));

    transport.set_local(server_addr());
    let request = server.try_recv().expect("request should arrive");
    assert_eq!(request.seq, 1);
    request.reply.send(Pong { seq: 1 });

    assert_eq!(pending.await, Ok(Pong { seq: 1 }));
}

#[tokio::test]
async fn requests_arrive_in_send_order() {
    let (transport, _) = install();

    let server: RequestStream<PingRequest> = RequestStream::new();
    server.make_well_known_endpoint(WELL_KNOWN_PING, TaskPriority::DefaultEndpoint);

    let client = well_known_client(&transport);
    for seq in 0..4 {
        client.send(PingRequest::new(seq));
    }

    transport.set_local(server_addr());
    for seq in 0..4 {
        let request = server.recv().await.expect("request");
        assert_eq!(request.seq, seq);
    }
}

#[tokio::test]
async fn broken_promise_reaches_client_and_failure_monitor() {
    let (transport, monitor) = install();

    let server: RequestStream<PingRequest> = RequestStream::new();
    server.make_well_known_endpoint(WELL_KNOWN_PING, TaskPriority::DefaultEndpoint);

    let client = well_known_client(&transport);
    let request = PingRequest::new(9);
    let reply_token = request
        .reply
        .get_endpoint(TaskPriority::DefaultPromiseEndpoint)
        .token;
    let pending = client.get_reply(request);

    transport.set_local(server_addr());
    let received = server.try_recv().expect("request should arrive");
    drop(received);

    assert_eq!(pending.await, Err(ReplyError::BrokenPromise));
    assert!(
        monitor
            .not_found_endpoints()
            .iter()
            .any(|ep| ep.token == reply_token),
        "monitor should record endpoint-not-found for the reply token"
    );
}

#[tokio::test]
async fn dropping_the_reply_future_cancels_the_reliable_send() {
    let (transport, _) = install();

    let server: RequestStream<PingRequest> = RequestStream::new();
    server.make_well_known_endpoint(WELL_KNOWN_PING, TaskPriority::DefaultEndpoint);

    let client = well_known_client(&transport);
    let pending = client.get_reply(PingRequest::new(2));
    assert_eq!(transport.reliable_in_flight(), 1);

    drop(pending);
    assert_eq!(transport.reliable_in_flight(), 0);
}

#[tokio::test]
async fn completed_reply_releases_the_reliable_send() {
    let (transport, _) = install();

    let server: RequestStream<PingRequest> = RequestStream::new();
    server.make_well_known_endpoint(WELL_KNOWN_PING, TaskPriority::DefaultEndpoint);

    let client = well_known_client(&transport);
    let pending = client.get_reply(PingRequest::new(3));

    transport.set_local(server_addr());
    let request = server.try_recv().expect("request");
    request.reply.send(Pong { seq: 3 });

    assert_eq!(pending.await, Ok(Pong { seq: 3 }));
    assert_eq!(transport.reliable_in_flight(), 0);
}

#[test]
fn deserialized_handle_reserializes_to_the_same_endpoint() {
    let (transport, _) = install();

    let server: RequestStream<PingRequest> = RequestStream::new();
    let endpoint = server.get_endpoint(TaskPriority::DefaultEndpoint);

    transport.set_local(client_addr());
    let bytes = serde_json::to_vec(&server).expect("serialize local handle");
    let remote: RequestStream<PingRequest> = serde_json::from_slice(&bytes).expect("deserialize");
    let reserialized = serde_json::to_vec(&remote).expect("serialize remote handle");
    let roundtripped: Endpoint = serde_json::from_slice(&reserialized).expect("endpoint");

    assert_eq!(roundtripped, endpoint);
}

#[test]
#[should_panic(expected = "reachable address")]
fn serializing_without_a_reachable_address_is_fatal() {
    let (transport, _) = install();

    // A process with no listening socket registers under the all-zero
    // placeholder address.
    transport.set_local(NetworkAddress::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
    let stream: RequestStream<PingRequest> = RequestStream::new();
    let _ = serde_json::to_vec(&stream);
}

#[test]
#[should_panic(expected = "registered twice")]
fn double_well_known_registration_is_fatal() {
    install();

    let first: RequestStream<PingRequest> = RequestStream::new();
    first.make_well_known_endpoint(WELL_KNOWN_PING, TaskPriority::DefaultEndpoint);

    let second: RequestStream<PingRequest> = RequestStream::new();
    second.make_well_known_endpoint(WELL_KNOWN_PING, TaskPriority::DefaultEndpoint);
}

#[tokio::test]
async fn endpoint_and_peer_references_balance_over_a_full_exchange() {
    let (transport, _) = install();

    {
        let server: RequestStream<PingRequest> = RequestStream::new();
        server.make_well_known_endpoint(WELL_KNOWN_PING, TaskPriority::DefaultEndpoint);

        let client = well_known_client(&transport);
        let pending = client.get_reply(PingRequest::new(5));

        transport.set_local(server_addr());
        let request = server.try_recv().expect("request");
        request.reply.send(Pong { seq: 5 });
        assert_eq!(pending.await, Ok(Pong { seq: 5 }));
    }

    assert_eq!(
        transport.endpoints_added(),
        transport.endpoint_removals(),
        "every endpoint registration must be matched by a removal call"
    );
    assert_eq!(transport.peer_reference_count(&server_addr()), 0);
    assert_eq!(transport.peer_reference_count(&client_addr()), 0);
    assert_eq!(transport.reliable_in_flight(), 0);
}
