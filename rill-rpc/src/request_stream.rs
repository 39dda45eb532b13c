//! Typed request streams.
//!
//! A [`RequestStream`] is the handle to a server-side request queue. The
//! server holds the local handle and consumes requests with
//! [`recv`](RequestStream::recv); clients deserialize a remote handle from
//! the wire (or a well-known token) and talk to it through `send` and the
//! `get_reply` family. Delivery guarantees per operation:
//!
//! | operation | guarantee |
//! |---|---|
//! | [`send`](RequestStream::send) | unreliable, at most once |
//! | [`get_reply`](RequestStream::get_reply) | reliable, at least once |
//! | [`try_get_reply`](RequestStream::try_get_reply) | at most once, disconnect-aware |
//! | [`get_reply_stream`](RequestStream::get_reply_stream) | at most once, streamed replies |
//! | [`get_reply_unless_failed_for`](RequestStream::get_reply_unless_failed_for) | at least once, bounded by the failure monitor |

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use rill_core::{Endpoint, TaskPriority, UID};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ReplyError;
use crate::failure_monitor::{MonitorFuture, failure_monitor, try_failure_monitor};
use crate::receiver::{EndpointRef, MessageReceiver, RefCounts};
use crate::reply_promise::{Request, ReplyFuture, ReplyPromise, set_reply_priority};
use crate::reply_stream::{ReplyStream, StreamRequest};
use crate::transport::{ReliableHandle, transport};
use crate::wire::{self, Message};

struct QueueInner<T> {
    queue: VecDeque<T>,
    wakers: Vec<Waker>,
    closed: bool,
}

/// Unbounded FIFO of deserialized requests: the receiver behind a
/// [`RequestStream`].
pub(crate) struct NetNotifiedQueue<T> {
    refs: RefCounts,
    endpoint: EndpointRef,
    inner: RefCell<QueueInner<T>>,
}

impl<T: Message> NetNotifiedQueue<T> {
    fn new_local() -> Self {
        Self {
            refs: RefCounts::new(1, 0),
            endpoint: EndpointRef::empty(true),
            inner: RefCell::new(QueueInner {
                queue: VecDeque::new(),
                wakers: Vec::new(),
                closed: false,
            }),
        }
    }

    fn new_remote(endpoint: Endpoint) -> Self {
        Self {
            refs: RefCounts::new(1, 0),
            endpoint: EndpointRef::remote(endpoint, true),
            inner: RefCell::new(QueueInner {
                queue: VecDeque::new(),
                wakers: Vec::new(),
                closed: false,
            }),
        }
    }

    fn push(&self, value: T) {
        let mut inner = self.inner.borrow_mut();
        inner.queue.push_back(value);
        for waker in inner.wakers.drain(..) {
            waker.wake();
        }
    }

    fn try_pop(&self) -> Option<T> {
        self.inner.borrow_mut().queue.pop_front()
    }

    fn poll_pop(&self, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let mut inner = self.inner.borrow_mut();
        if let Some(value) = inner.queue.pop_front() {
            return Poll::Ready(Some(value));
        }
        if inner.closed {
            return Poll::Ready(None);
        }
        inner.wakers.push(cx.waker().clone());
        Poll::Pending
    }

    fn del_promise_ref(&self) {
        if self.refs.del_promise() {
            let mut inner = self.inner.borrow_mut();
            inner.closed = true;
            for waker in inner.wakers.drain(..) {
                waker.wake();
            }
        }
    }
}

impl<T: Message> MessageReceiver for NetNotifiedQueue<T> {
    fn receive(&self, payload: &[u8]) {
        match wire::decode::<T>(payload) {
            Ok(value) => self.push(value),
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable request");
            }
        }
    }

    fn is_stream(&self) -> bool {
        true
    }
}

/// Typed handle to a request queue, local or remote.
pub struct RequestStream<T: Message> {
    queue: Rc<NetNotifiedQueue<T>>,
}

impl<T: Message> RequestStream<T> {
    /// A fresh local stream with an unallocated endpoint.
    pub fn new() -> Self {
        Self {
            queue: Rc::new(NetNotifiedQueue::new_local()),
        }
    }

    /// A remote handle bound to a wire-loaded endpoint.
    pub(crate) fn from_endpoint(endpoint: Endpoint) -> Self {
        Self {
            queue: Rc::new(NetNotifiedQueue::new_remote(endpoint)),
        }
    }

    /// Build a remote handle for a server advertising `endpoint` (for
    /// example a well-known token learned out of band).
    pub fn to_endpoint(endpoint: Endpoint) -> Self {
        Self::from_endpoint(endpoint)
    }

    fn receiver(&self) -> Rc<dyn MessageReceiver> {
        Rc::clone(&self.queue) as Rc<dyn MessageReceiver>
    }

    /// The stream's endpoint, registering the receiver at `priority` on
    /// first observation.
    pub fn get_endpoint(&self, priority: TaskPriority) -> Endpoint {
        self.queue.endpoint.get_endpoint(&self.receiver(), priority)
    }

    /// Bind this stream under a fixed, operator-chosen token so clients
    /// can reach it without a prior introduction.
    ///
    /// # Panics
    ///
    /// The stream must be a local handle whose endpoint has not been
    /// observed yet.
    pub fn make_well_known_endpoint(&self, token: UID, priority: TaskPriority) {
        self.queue
            .endpoint
            .make_well_known(&self.receiver(), token, priority);
    }

    /// Deliver `value` unreliably, at most once. On a local handle this is
    /// a direct enqueue; on a remote handle the transport may drop it on
    /// connection failure.
    pub fn send(&self, value: T) {
        if let Some(endpoint) = self.queue.endpoint.remote_endpoint() {
            match wire::encode(&value) {
                Ok(bytes) => transport().send_unreliable(bytes, &endpoint, true),
                Err(e) => tracing::error!(error = %e, "failed to serialize request; dropped"),
            }
        } else {
            self.queue.push(value);
        }
    }

    /// Send `request` reliably and return its reply future.
    ///
    /// At-least-once: the transport retransmits until the returned future
    /// is dropped (which cancels the send) or the reply arrives. The
    /// request's reply slot must be fresh.
    pub fn get_reply(&self, request: T) -> GetReplyFuture<T::Reply>
    where
        T: Request,
    {
        assert!(
            !request.reply().is_set(),
            "get_reply requires a fresh reply promise"
        );
        let endpoint = self.get_endpoint(TaskPriority::DefaultEndpoint);
        if self.queue.endpoint.is_remote() {
            let reply = request.reply().clone();
            let reliable = match wire::encode(&request) {
                Ok(bytes) => Some(transport().send_reliable(bytes, &endpoint)),
                Err(e) => {
                    tracing::error!(error = %e, "failed to serialize request");
                    reply.send_error(ReplyError::Serialization {
                        message: e.to_string(),
                    });
                    None
                }
            };
            GetReplyFuture {
                reply: reply.get_future(),
                in_flight: Some(reply),
                reliable,
                endpoint,
                report_broken_promise: false,
            }
        } else {
            // The queued request itself carries the only producer ref;
            // dropping it server-side is what breaks the future.
            let future = request.reply().get_future();
            self.queue.push(request);
            GetReplyFuture {
                reply: future,
                in_flight: None,
                reliable: None,
                endpoint,
                report_broken_promise: true,
            }
        }
    }

    /// [`get_reply`](RequestStream::get_reply) with the reply endpoint
    /// bound at `priority`.
    pub fn get_reply_with_priority(&self, request: T, priority: TaskPriority) -> GetReplyFuture<T::Reply>
    where
        T: Request,
    {
        set_reply_priority(&request, priority);
        self.get_reply(request)
    }

    /// Send `request` unreliably and wait for its reply or a disconnect.
    ///
    /// At-most-once: if the failure monitor already reports the endpoint
    /// down, resolves immediately with
    /// [`ReplyError::RequestMaybeDelivered`]; otherwise sends once and
    /// races the reply against the disconnect signal.
    pub fn try_get_reply(&self, request: T) -> TryGetReplyFuture<T::Reply>
    where
        T: Request,
    {
        self.try_get_reply_at(request, TaskPriority::DefaultEndpoint)
    }

    /// [`try_get_reply`](RequestStream::try_get_reply) with the reply
    /// endpoint bound at `priority`.
    pub fn try_get_reply_with_priority(
        &self,
        request: T,
        priority: TaskPriority,
    ) -> TryGetReplyFuture<T::Reply>
    where
        T: Request,
    {
        set_reply_priority(&request, priority);
        self.try_get_reply_at(request, priority)
    }

    fn try_get_reply_at(&self, request: T, priority: TaskPriority) -> TryGetReplyFuture<T::Reply>
    where
        T: Request,
    {
        let endpoint = self.get_endpoint(priority);
        if self.queue.endpoint.is_remote() {
            let monitor = failure_monitor();
            if monitor.currently_failed(&endpoint) {
                return TryGetReplyFuture {
                    state: TryState::Immediate(Some(Err(ReplyError::RequestMaybeDelivered))),
                };
            }
            let reply = request.reply().clone();
            match wire::encode(&request) {
                Ok(bytes) => transport().send_unreliable(bytes, &endpoint, true),
                Err(e) => {
                    return TryGetReplyFuture {
                        state: TryState::Immediate(Some(Err(ReplyError::Serialization {
                            message: e.to_string(),
                        }))),
                    };
                }
            }
            let disconnect = monitor.on_disconnect_or_failure(&endpoint);
            TryGetReplyFuture {
                state: TryState::Waiting {
                    reply: reply.get_future(),
                    _in_flight: Some(reply),
                    disconnect: Some(disconnect),
                },
            }
        } else {
            let future = request.reply().get_future();
            self.queue.push(request);
            TryGetReplyFuture {
                state: TryState::Waiting {
                    reply: future,
                    _in_flight: None,
                    disconnect: None,
                },
            }
        }
    }

    /// Send `request` unreliably and return the reply stream embedded in
    /// it. On disconnect the stream is closed with
    /// [`ReplyError::RequestMaybeDelivered`].
    pub fn get_reply_stream(&self, request: T) -> ReplyStream<T::Reply>
    where
        T: StreamRequest,
    {
        self.get_reply_stream_at(request, TaskPriority::DefaultEndpoint)
    }

    /// [`get_reply_stream`](RequestStream::get_reply_stream) using
    /// `priority` for the endpoint lookup.
    pub fn get_reply_stream_with_priority(
        &self,
        request: T,
        priority: TaskPriority,
    ) -> ReplyStream<T::Reply>
    where
        T: StreamRequest,
    {
        self.get_reply_stream_at(request, priority)
    }

    fn get_reply_stream_at(&self, request: T, priority: TaskPriority) -> ReplyStream<T::Reply>
    where
        T: StreamRequest,
    {
        let endpoint = self.get_endpoint(priority);
        let stream = request.reply_stream().clone();
        if self.queue.endpoint.is_remote() {
            let monitor = failure_monitor();
            if monitor.currently_failed(&endpoint) {
                stream.send_error(ReplyError::RequestMaybeDelivered);
                return stream;
            }
            match wire::encode(&request) {
                Ok(bytes) => {
                    transport().send_unreliable(bytes, &endpoint, true);
                    stream.install_disconnect_signal(monitor.on_disconnect_or_failure(&endpoint));
                }
                Err(e) => {
                    stream.send_error(ReplyError::Serialization {
                        message: e.to_string(),
                    });
                }
            }
        } else {
            self.queue.push(request);
        }
        stream
    }

    /// [`get_reply`](RequestStream::get_reply), abandoned with
    /// [`ReplyError::EndpointFailed`] if the failure monitor declares the
    /// endpoint failed for the given sustained duration/slope.
    pub fn get_reply_unless_failed_for(
        &self,
        request: T,
        sustained_failure_duration: Duration,
        sustained_failure_slope: f64,
    ) -> ReplyUnlessFailedFuture<T::Reply>
    where
        T: Request,
    {
        let endpoint = self.get_endpoint(TaskPriority::DefaultEndpoint);
        let signal = failure_monitor().on_failed_for(
            &endpoint,
            sustained_failure_duration,
            sustained_failure_slope,
        );
        ReplyUnlessFailedFuture {
            inner: self.get_reply(request),
            signal,
        }
    }

    /// Wait for the next request. Resolves to `None` when every producer
    /// handle is gone and the queue has drained.
    pub fn recv(&self) -> RecvFuture<'_, T> {
        RecvFuture { queue: &self.queue }
    }

    /// Take a queued request without waiting.
    pub fn try_recv(&self) -> Option<T> {
        self.queue.try_pop()
    }

    /// Whether no requests are queued.
    pub fn is_empty(&self) -> bool {
        self.queue.inner.borrow().queue.is_empty()
    }

    /// Number of queued requests.
    pub fn len(&self) -> usize {
        self.queue.inner.borrow().queue.len()
    }
}

impl<T: Message> Default for RequestStream<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Message> Clone for RequestStream<T> {
    fn clone(&self) -> Self {
        self.queue.refs.add_promise();
        Self {
            queue: Rc::clone(&self.queue),
        }
    }
}

impl<T: Message> Drop for RequestStream<T> {
    fn drop(&mut self) {
        self.queue.del_promise_ref();
    }
}

/// On the wire a request stream is its full endpoint: the peer needs both
/// address and token to route fresh connections.
impl<T: Message> Serialize for RequestStream<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let endpoint = self.get_endpoint(TaskPriority::DefaultEndpoint);
        assert!(
            endpoint.address.is_valid(),
            "cannot serialize a request stream without a reachable address"
        );
        endpoint.serialize(serializer)
    }
}

impl<'de, T: Message> Deserialize<'de> for RequestStream<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let endpoint = Endpoint::deserialize(deserializer)?;
        Ok(RequestStream::from_endpoint(endpoint))
    }
}

/// Future returned by [`RequestStream::recv`].
pub struct RecvFuture<'a, T: Message> {
    queue: &'a Rc<NetNotifiedQueue<T>>,
}

impl<T: Message> Future for RecvFuture<'_, T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.queue.poll_pop(cx)
    }
}

/// Reply future of [`RequestStream::get_reply`]: the embedded reply future
/// guarded by a send-canceller (remote) or an endpoint-failure reporter
/// (local).
pub struct GetReplyFuture<T: Message> {
    reply: ReplyFuture<T>,
    in_flight: Option<ReplyPromise<T>>,
    reliable: Option<ReliableHandle>,
    endpoint: Endpoint,
    report_broken_promise: bool,
}

impl<T: Message> Future for GetReplyFuture<T> {
    type Output = Result<T, ReplyError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.reply).poll(cx) {
            Poll::Ready(result) => {
                // Reply settled: stop retransmitting and release the
                // in-flight producer ref.
                this.reliable.take();
                this.in_flight.take();
                if this.report_broken_promise
                    && matches!(result, Err(ReplyError::BrokenPromise))
                    && let Some(monitor) = try_failure_monitor()
                {
                    monitor.endpoint_not_found(&this.endpoint);
                }
                Poll::Ready(result)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

enum TryState<T: Message> {
    Immediate(Option<Result<T, ReplyError>>),
    Waiting {
        reply: ReplyFuture<T>,
        /// Remote sends keep the reply receiver registered while waiting;
        /// local sends leave the only producer ref inside the queued
        /// request so its drop can break the future.
        _in_flight: Option<ReplyPromise<T>>,
        disconnect: Option<MonitorFuture>,
    },
}

/// Reply future of [`RequestStream::try_get_reply`]: the reply raced
/// against the endpoint's disconnect signal.
pub struct TryGetReplyFuture<T: Message> {
    state: TryState<T>,
}

impl<T: Message + Unpin> Future for TryGetReplyFuture<T> {
    type Output = Result<T, ReplyError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            TryState::Immediate(value) => {
                Poll::Ready(value.take().expect("future polled after completion"))
            }
            TryState::Waiting {
                reply, disconnect, ..
            } => {
                if let Poll::Ready(result) = Pin::new(reply).poll(cx) {
                    return Poll::Ready(result);
                }
                if let Some(signal) = disconnect
                    && signal.as_mut().poll(cx).is_ready()
                {
                    return Poll::Ready(Err(ReplyError::RequestMaybeDelivered));
                }
                Poll::Pending
            }
        }
    }
}

/// Reply future of [`RequestStream::get_reply_unless_failed_for`].
pub struct ReplyUnlessFailedFuture<T: Message> {
    inner: GetReplyFuture<T>,
    signal: MonitorFuture,
}

impl<T: Message> Future for ReplyUnlessFailedFuture<T> {
    type Output = Result<T, ReplyError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Poll::Ready(result) = Pin::new(&mut this.inner).poll(cx) {
            return Poll::Ready(result);
        }
        if this.signal.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(ReplyError::EndpointFailed));
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use rill_core::NetworkAddress;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::failure_monitor::{ManualFailureMonitor, init_failure_monitor};
    use crate::loopback::LoopbackTransport;
    use crate::transport::init_transport;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Pong {
        seq: u32,
    }

    #[derive(Serialize, Deserialize)]
    struct Ping {
        seq: u32,
        reply: ReplyPromise<Pong>,
    }

    impl Request for Ping {
        type Reply = Pong;

        fn reply(&self) -> &ReplyPromise<Pong> {
            &self.reply
        }

        fn reply_mut(&mut self) -> &mut ReplyPromise<Pong> {
            &mut self.reply
        }
    }

    fn install() -> (LoopbackTransport, ManualFailureMonitor) {
        let addr = NetworkAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4500);
        let transport = LoopbackTransport::new(addr);
        let monitor = ManualFailureMonitor::new();
        init_transport(Rc::new(transport.clone()));
        init_failure_monitor(Rc::new(monitor.clone()));
        (transport, monitor)
    }

    #[tokio::test]
    async fn local_send_and_recv_preserve_order() {
        install();
        let stream: RequestStream<Pong> = RequestStream::new();
        stream.send(Pong { seq: 1 });
        stream.send(Pong { seq: 2 });
        assert_eq!(stream.len(), 2);
        assert_eq!(stream.recv().await, Some(Pong { seq: 1 }));
        assert_eq!(stream.recv().await, Some(Pong { seq: 2 }));
        assert!(stream.is_empty());
    }

    #[tokio::test]
    async fn recv_returns_none_when_producers_are_gone() {
        install();
        let stream: RequestStream<Pong> = RequestStream::new();
        let consumer = stream.clone();
        stream.send(Pong { seq: 1 });
        drop(stream);
        assert_eq!(consumer.recv().await, Some(Pong { seq: 1 }));
        // consumer still holds a producer ref, so the queue stays open
        assert_eq!(consumer.try_recv(), None);
    }

    #[tokio::test]
    async fn local_get_reply_resolves_when_server_replies() {
        install();
        let stream: RequestStream<Ping> = RequestStream::new();
        let pending = stream.get_reply(Ping {
            seq: 7,
            reply: ReplyPromise::new(),
        });

        let request = stream.try_recv().expect("request queued");
        assert_eq!(request.seq, 7);
        request.reply.send(Pong { seq: 7 });

        assert_eq!(pending.await, Ok(Pong { seq: 7 }));
    }

    #[tokio::test]
    async fn local_broken_promise_reaches_caller_and_monitor() {
        let (_, monitor) = install();
        let stream: RequestStream<Ping> = RequestStream::new();
        let pending = stream.get_reply(Ping {
            seq: 1,
            reply: ReplyPromise::new(),
        });

        let request = stream.try_recv().expect("request queued");
        drop(request);

        assert_eq!(pending.await, Err(ReplyError::BrokenPromise));
        assert!(!monitor.not_found_endpoints().is_empty());
    }

    #[test]
    #[should_panic(expected = "fresh reply promise")]
    fn get_reply_rejects_a_used_promise() {
        install();
        let stream: RequestStream<Ping> = RequestStream::new();
        let reply = ReplyPromise::new();
        reply.send(Pong { seq: 0 });
        let _ = stream.get_reply(Ping { seq: 0, reply });
    }

    #[test]
    fn handle_roundtrips_through_the_wire() {
        install();
        let stream: RequestStream<Pong> = RequestStream::new();
        let endpoint = stream.get_endpoint(TaskPriority::DefaultEndpoint);

        let bytes = serde_json::to_vec(&stream).expect("serialize");
        let remote: RequestStream<Pong> = serde_json::from_slice(&bytes).expect("deserialize");
        let again = serde_json::to_vec(&remote).expect("reserialize");
        let roundtripped: Endpoint = serde_json::from_slice(&again).expect("endpoint");

        assert_eq!(roundtripped, endpoint);
    }

    #[tokio::test]
    async fn remote_send_routes_through_the_transport() {
        install();
        let server: RequestStream<Pong> = RequestStream::new();
        let bytes = serde_json::to_vec(&server).expect("serialize");
        let client: RequestStream<Pong> = serde_json::from_slice(&bytes).expect("deserialize");

        client.send(Pong { seq: 3 });
        assert_eq!(server.recv().await, Some(Pong { seq: 3 }));
    }

    #[test]
    fn well_known_binding_yields_the_fixed_token() {
        install();
        let token = UID::new(0xAAAA_AAAA_AAAA_AAAA, 0xAAAA_AAAA_AAAA_AAAA);
        let stream: RequestStream<Pong> = RequestStream::new();
        stream.make_well_known_endpoint(token, TaskPriority::DefaultEndpoint);
        assert_eq!(stream.get_endpoint(TaskPriority::DefaultEndpoint).token, token);
    }

    #[test]
    fn reset_reply_gives_the_request_a_fresh_slot() {
        install();
        let mut request = Ping {
            seq: 1,
            reply: ReplyPromise::new(),
        };
        crate::reply_promise::set_reply_priority(&request, TaskPriority::DefaultPromiseEndpoint);
        let before = request
            .reply
            .get_endpoint(TaskPriority::DefaultPromiseEndpoint);

        crate::reply_promise::reset_reply_with_priority(
            &mut request,
            TaskPriority::DefaultPromiseEndpoint,
        );
        let after = request
            .reply
            .get_endpoint(TaskPriority::DefaultPromiseEndpoint);

        assert_ne!(before.token, after.token);
        assert!(!request.reply.is_set());
    }

    #[test]
    #[should_panic(expected = "already-bound")]
    fn well_known_binding_requires_an_unbound_stream() {
        install();
        let stream: RequestStream<Pong> = RequestStream::new();
        stream.get_endpoint(TaskPriority::DefaultEndpoint);
        stream.make_well_known_endpoint(UID::new(1, 1), TaskPriority::DefaultEndpoint);
    }
}
