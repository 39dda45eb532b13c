//! Flow-controlled reply streams.
//!
//! A [`ReplyStream`] carries a sequence of typed replies from a producer
//! to a consumer with byte-credit backpressure. The consumer acknowledges
//! cumulative bytes as it pops values; the producer's
//! [`on_ready`](ReplyStream::on_ready) gates sending once
//! [`ACKNOWLEDGE_WINDOW_BYTES`] are in flight unacknowledged. Credits flow
//! over a dedicated acknowledgement sub-endpoint that rides inside the
//! first value sent.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use rill_core::{Endpoint, TaskPriority};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ReplyError;
use crate::failure_monitor::{MonitorFuture, failure_monitor};
use crate::receiver::{EndpointRef, MessageReceiver, RefCounts};
use crate::transport::transport;
use crate::wire::{self, Message};

/// Maximum unacknowledged bytes a producer keeps in flight before
/// [`ReplyStream::on_ready`] starts gating.
pub const ACKNOWLEDGE_WINDOW_BYTES: i64 = 2 * 1024 * 1024;

/// A stream reply payload.
///
/// Values report their [`expected_size`](StreamReply::expected_size) for
/// credit accounting and carry an optional acknowledgement endpoint so the
/// consumer learns where credits go (set automatically on the first value
/// a producer sends).
pub trait StreamReply: Message {
    /// Size in bytes this value counts against the flow-control window.
    fn expected_size(&self) -> usize;

    /// The embedded acknowledgement endpoint, if present.
    fn acknowledge_endpoint(&self) -> Option<&Endpoint>;

    /// Install the acknowledgement endpoint before serialization.
    fn set_acknowledge_endpoint(&mut self, endpoint: Endpoint);
}

/// A request whose reply is a stream: the payload embeds the
/// [`ReplyStream`] the server side will produce into.
pub trait StreamRequest: Message {
    /// Stream element type.
    type Reply: StreamReply;

    /// The embedded reply stream.
    fn reply_stream(&self) -> &ReplyStream<Self::Reply>;
}

/// Cumulative byte credit, sent unreliably from consumer to producer.
/// Later messages supersede earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgement {
    /// Total bytes acknowledged so far; strictly increasing.
    pub bytes: i64,
}

impl Acknowledgement {
    /// Stable wire identifier for the acknowledgement payload.
    pub const FILE_IDENTIFIER: u32 = 1_378_929;
}

/// Credit state for one direction of a stream.
///
/// On the producer it is a local receiver accepting [`Acknowledgement`]s;
/// on the consumer it is a remote reference used to send them. Owned by
/// the stream's main queue; it never points back (the reverse relation is
/// endpoint lookup, not ownership).
pub(crate) struct AcknowledgementReceiver {
    endpoint: EndpointRef,
    bytes_sent: Cell<i64>,
    bytes_acknowledged: Cell<i64>,
    ready_wakers: RefCell<Vec<Waker>>,
}

impl AcknowledgementReceiver {
    fn new() -> Self {
        Self {
            endpoint: EndpointRef::empty(false),
            bytes_sent: Cell::new(0),
            bytes_acknowledged: Cell::new(0),
            ready_wakers: RefCell::new(Vec::new()),
        }
    }

    fn is_bound(&self) -> bool {
        self.endpoint.endpoint().is_some()
    }

    fn window_open(&self) -> bool {
        self.bytes_sent.get() - self.bytes_acknowledged.get() < ACKNOWLEDGE_WINDOW_BYTES
    }

    fn get_endpoint(this: &Rc<Self>, priority: TaskPriority) -> Endpoint {
        let receiver: Rc<dyn MessageReceiver> = Rc::clone(this) as Rc<dyn MessageReceiver>;
        this.endpoint.get_endpoint(&receiver, priority)
    }

    fn wake_ready(&self) {
        for waker in self.ready_wakers.borrow_mut().drain(..) {
            waker.wake();
        }
    }
}

impl MessageReceiver for AcknowledgementReceiver {
    fn receive(&self, payload: &[u8]) {
        match wire::decode::<Acknowledgement>(payload) {
            Ok(ack) => {
                assert!(
                    ack.bytes > self.bytes_acknowledged.get(),
                    "acknowledgement went backwards: {} after {}",
                    ack.bytes,
                    self.bytes_acknowledged.get()
                );
                self.bytes_acknowledged.set(ack.bytes);
                if self.window_open() {
                    self.wake_ready();
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable acknowledgement");
            }
        }
    }
}

struct ErrQueueInner<T> {
    queue: VecDeque<T>,
    error: Option<ReplyError>,
    wakers: Vec<Waker>,
}

/// Queue receiver for `ErrorOr<T>` stream payloads, with the embedded
/// acknowledgement sub-receiver.
pub(crate) struct NetNotifiedQueueWithErrors<T> {
    refs: RefCounts,
    endpoint: EndpointRef,
    acknowledgements: Rc<AcknowledgementReceiver>,
    disconnect: RefCell<Option<MonitorFuture>>,
    inner: RefCell<ErrQueueInner<T>>,
}

impl<T: StreamReply> NetNotifiedQueueWithErrors<T> {
    fn new(endpoint: EndpointRef) -> Self {
        Self {
            refs: RefCounts::new(1, 0),
            endpoint,
            acknowledgements: Rc::new(AcknowledgementReceiver::new()),
            disconnect: RefCell::new(None),
            inner: RefCell::new(ErrQueueInner {
                queue: VecDeque::new(),
                error: None,
                wakers: Vec::new(),
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

    fn deliver_error(&self, error: ReplyError) {
        let mut inner = self.inner.borrow_mut();
        if inner.error.is_none() {
            inner.error = Some(error);
        }
        for waker in inner.wakers.drain(..) {
            waker.wake();
        }
    }

    /// Pop the next value, acknowledging its bytes — the only flow-control
    /// path on the consumer side.
    fn poll_next(&self, cx: &mut Context<'_>) -> Poll<Result<T, ReplyError>> {
        let popped = self.inner.borrow_mut().queue.pop_front();
        if let Some(value) = popped {
            if self.acknowledgements.is_bound() {
                let acks = &self.acknowledgements;
                let total = acks.bytes_acknowledged.get() + value.expected_size() as i64;
                acks.bytes_acknowledged.set(total);
                let endpoint = AcknowledgementReceiver::get_endpoint(
                    acks,
                    TaskPriority::DefaultPromiseEndpoint,
                );
                match wire::encode(&Acknowledgement { bytes: total }) {
                    Ok(bytes) => transport().send_unreliable(bytes, &endpoint, true),
                    Err(e) => tracing::warn!(error = %e, "failed to encode acknowledgement"),
                }
            }
            return Poll::Ready(Ok(value));
        }

        let mut inner = self.inner.borrow_mut();
        if let Some(error) = inner.error.clone() {
            return Poll::Ready(Err(error));
        }
        drop(inner);

        let mut disconnect = self.disconnect.borrow_mut();
        if let Some(signal) = disconnect.as_mut()
            && signal.as_mut().poll(cx).is_ready()
        {
            drop(disconnect);
            self.deliver_error(ReplyError::RequestMaybeDelivered);
            return Poll::Ready(Err(ReplyError::RequestMaybeDelivered));
        }
        drop(disconnect);

        self.inner.borrow_mut().wakers.push(cx.waker().clone());
        Poll::Pending
    }

    fn del_promise_ref(&self) {
        if self.refs.del_promise() && !self.endpoint.is_remote() {
            self.deliver_error(ReplyError::BrokenPromise);
        }
    }
}

impl<T: StreamReply> MessageReceiver for NetNotifiedQueueWithErrors<T> {
    fn receive(&self, payload: &[u8]) {
        match wire::decode::<Result<T, ReplyError>>(payload) {
            Ok(Err(error)) => {
                if matches!(error, ReplyError::BrokenPromise)
                    && let Some(endpoint) = self.endpoint.endpoint()
                {
                    failure_monitor().endpoint_not_found(&endpoint);
                }
                self.deliver_error(error);
            }
            Ok(Ok(value)) => {
                if let Some(ack_endpoint) = value.acknowledge_endpoint()
                    && !self.acknowledgements.is_bound()
                {
                    self.acknowledgements.endpoint.bind_remote(ack_endpoint.clone());
                }
                self.push(value);
            }
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable stream message");
            }
        }
    }
}

struct ErrorSlot {
    error: RefCell<Option<ReplyError>>,
    wakers: RefCell<Vec<Waker>>,
}

impl ErrorSlot {
    fn set(&self, error: ReplyError) {
        let mut slot = self.error.borrow_mut();
        if slot.is_none() {
            *slot = Some(error);
        }
        drop(slot);
        for waker in self.wakers.borrow_mut().drain(..) {
            waker.wake();
        }
    }
}

/// Typed handle to a flow-controlled reply stream.
///
/// The consumer side is the local handle embedded in a
/// [`StreamRequest`]; the producer side is the remote handle the server
/// deserializes. Producer sends are unreliable at-most-once; ordering
/// holds per connection.
pub struct ReplyStream<T: StreamReply> {
    queue: Rc<NetNotifiedQueueWithErrors<T>>,
    errors: Rc<ErrorSlot>,
}

impl<T: StreamReply> ReplyStream<T> {
    /// A fresh local stream with an unallocated endpoint.
    pub fn new() -> Self {
        Self {
            queue: Rc::new(NetNotifiedQueueWithErrors::new(EndpointRef::empty(false))),
            errors: Rc::new(ErrorSlot {
                error: RefCell::new(None),
                wakers: RefCell::new(Vec::new()),
            }),
        }
    }

    /// A remote producer handle bound to a wire-loaded endpoint.
    pub(crate) fn from_endpoint(endpoint: Endpoint) -> Self {
        Self {
            queue: Rc::new(NetNotifiedQueueWithErrors::new(EndpointRef::remote(
                endpoint, false,
            ))),
            errors: Rc::new(ErrorSlot {
                error: RefCell::new(None),
                wakers: RefCell::new(Vec::new()),
            }),
        }
    }

    fn receiver(&self) -> Rc<dyn MessageReceiver> {
        Rc::clone(&self.queue) as Rc<dyn MessageReceiver>
    }

    /// The stream's endpoint, registering the receiver at `priority` on
    /// first observation.
    pub fn get_endpoint(&self, priority: TaskPriority) -> Endpoint {
        self.queue.endpoint.get_endpoint(&self.receiver(), priority)
    }

    /// Send one value, unreliably, counting its bytes against the window.
    ///
    /// The first value sent through a remote handle carries the producer's
    /// acknowledgement endpoint so the consumer knows where credits go.
    /// Sending never blocks; pair with [`on_ready`](ReplyStream::on_ready)
    /// to honor backpressure.
    pub fn send(&self, mut value: T) {
        if let Some(endpoint) = self.queue.endpoint.remote_endpoint() {
            let acks = &self.queue.acknowledgements;
            if !acks.is_bound() {
                value.set_acknowledge_endpoint(AcknowledgementReceiver::get_endpoint(
                    acks,
                    TaskPriority::DefaultEndpoint,
                ));
            }
            acks.bytes_sent
                .set(acks.bytes_sent.get() + value.expected_size() as i64);
            match wire::encode_ok(&value) {
                Ok(bytes) => transport().send_unreliable(bytes, &endpoint, true),
                Err(e) => tracing::error!(error = %e, "failed to serialize stream value; dropped"),
            }
        } else {
            self.queue.push(value);
        }
    }

    /// Deliver `error` to the consumer and to the side
    /// [`on_error`](ReplyStream::on_error) future. Streams end with
    /// [`ReplyError::EndOfStream`] through this path.
    pub fn send_error(&self, error: ReplyError) {
        if let Some(endpoint) = self.queue.endpoint.remote_endpoint() {
            if let Some(bytes) = wire::encode_err::<T>(&error) {
                transport().send_unreliable(bytes, &endpoint, true);
            }
        } else {
            self.queue.deliver_error(error.clone());
        }
        self.errors.set(error);
    }

    /// Backpressure gate: ready while fewer than
    /// [`ACKNOWLEDGE_WINDOW_BYTES`] are unacknowledged, otherwise resolves
    /// when credits arrive — or fails with
    /// [`ReplyError::RequestMaybeDelivered`] if the consumer's endpoint
    /// disconnects first.
    pub fn on_ready(&self) -> OnReadyFuture<T> {
        let disconnect = match self.queue.endpoint.remote_endpoint() {
            Some(endpoint) if !self.queue.acknowledgements.window_open() => {
                Some(failure_monitor().on_disconnect_or_failure(&endpoint))
            }
            _ => None,
        };
        OnReadyFuture {
            queue: Rc::clone(&self.queue),
            disconnect,
        }
    }

    /// Wait for the next value. Fails with the stream's terminal error
    /// once delivered values are drained.
    pub fn recv(&self) -> StreamRecvFuture<'_, T> {
        StreamRecvFuture { queue: &self.queue }
    }

    /// Side future observing errors sent through this handle; used by
    /// housekeeping that must notice a stream being ended.
    pub fn on_error(&self) -> OnErrorFuture {
        OnErrorFuture {
            errors: Rc::clone(&self.errors),
        }
    }

    /// Whether no values are queued.
    pub fn is_empty(&self) -> bool {
        self.queue.inner.borrow().queue.is_empty()
    }

    /// Number of queued values.
    pub fn len(&self) -> usize {
        self.queue.inner.borrow().queue.len()
    }

    /// Bytes sent by this producer (debug aid).
    pub fn bytes_sent(&self) -> i64 {
        self.queue.acknowledgements.bytes_sent.get()
    }

    /// Cumulative bytes acknowledged (debug aid).
    pub fn bytes_acknowledged(&self) -> i64 {
        self.queue.acknowledgements.bytes_acknowledged.get()
    }

    /// Close this consumer with `RequestMaybeDelivered` when `signal`
    /// fires before the stream ends.
    pub(crate) fn install_disconnect_signal(&self, signal: MonitorFuture) {
        *self.queue.disconnect.borrow_mut() = Some(signal);
    }
}

impl<T: StreamReply> Default for ReplyStream<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: StreamReply> Clone for ReplyStream<T> {
    fn clone(&self) -> Self {
        self.queue.refs.add_promise();
        Self {
            queue: Rc::clone(&self.queue),
            errors: Rc::clone(&self.errors),
        }
    }
}

impl<T: StreamReply> Drop for ReplyStream<T> {
    fn drop(&mut self) {
        self.queue.del_promise_ref();
    }
}

/// On the wire a reply stream is its full endpoint, like a request stream.
impl<T: StreamReply> Serialize for ReplyStream<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let endpoint = self.get_endpoint(TaskPriority::DefaultEndpoint);
        assert!(
            endpoint.address.is_valid(),
            "cannot serialize a reply stream without a reachable address"
        );
        endpoint.serialize(serializer)
    }
}

impl<'de, T: StreamReply> Deserialize<'de> for ReplyStream<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let endpoint = Endpoint::deserialize(deserializer)?;
        Ok(ReplyStream::from_endpoint(endpoint))
    }
}

/// Future returned by [`ReplyStream::recv`].
pub struct StreamRecvFuture<'a, T: StreamReply> {
    queue: &'a Rc<NetNotifiedQueueWithErrors<T>>,
}

impl<T: StreamReply> Future for StreamRecvFuture<'_, T> {
    type Output = Result<T, ReplyError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.queue.poll_next(cx)
    }
}

/// Future returned by [`ReplyStream::on_ready`].
pub struct OnReadyFuture<T: StreamReply> {
    queue: Rc<NetNotifiedQueueWithErrors<T>>,
    disconnect: Option<MonitorFuture>,
}

impl<T: StreamReply> Future for OnReadyFuture<T> {
    type Output = Result<(), ReplyError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let acks = &this.queue.acknowledgements;
        if acks.window_open() {
            return Poll::Ready(Ok(()));
        }
        if let Some(signal) = this.disconnect.as_mut()
            && signal.as_mut().poll(cx).is_ready()
        {
            return Poll::Ready(Err(ReplyError::RequestMaybeDelivered));
        }
        acks.ready_wakers.borrow_mut().push(cx.waker().clone());
        Poll::Pending
    }
}

/// Future returned by [`ReplyStream::on_error`].
pub struct OnErrorFuture {
    errors: Rc<ErrorSlot>,
}

impl Future for OnErrorFuture {
    type Output = ReplyError;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(error) = self.errors.error.borrow().clone() {
            return Poll::Ready(error);
        }
        self.errors.wakers.borrow_mut().push(cx.waker().clone());
        Poll::Pending
    }
}
