//! One-shot reply primitive.
//!
//! [`ReplyPromise`] is the producer half and [`ReplyFuture`] the consumer
//! half of a single typed reply. The pair is wire-transparent: serializing
//! a promise writes only its endpoint token, and the peer that
//! deserializes it gets a *remote* promise whose fulfilment sends the
//! serialized `ErrorOr<T>` straight back to the originator — exactly once,
//! including the broken-promise sent when the promise is dropped unfulfilled.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use rill_core::{Endpoint, TaskPriority, UID};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ReplyError;
use crate::failure_monitor::failure_monitor;
use crate::receiver::{EndpointRef, MessageReceiver, RefCounts};
use crate::transport::transport;
use crate::wire::{self, Message};

/// A request type: a payload carrying the [`ReplyPromise`] its server side
/// fulfils. `ReplyPromise<T>` itself implements `Request`, covering the
/// case where the request *is* a bare reply slot.
pub trait Request: Message {
    /// Reply payload type.
    type Reply: Message;

    /// The embedded reply slot.
    fn reply(&self) -> &ReplyPromise<Self::Reply>;

    /// Mutable access to the reply slot, for [`reset_reply`].
    fn reply_mut(&mut self) -> &mut ReplyPromise<Self::Reply>;
}

/// Bind the request's reply endpoint at the given priority before the
/// request is enqueued or sent.
pub fn set_reply_priority<R: Request>(request: &R, priority: TaskPriority) {
    request.reply().get_endpoint(priority);
}

/// Replace the request's reply slot with a fresh local one, breaking any
/// prior association.
pub fn reset_reply<R: Request>(request: &mut R) {
    request.reply_mut().reset();
}

/// [`reset_reply`], then bind the fresh endpoint at `priority`.
pub fn reset_reply_with_priority<R: Request>(request: &mut R, priority: TaskPriority) {
    request.reply_mut().reset();
    request.reply().get_endpoint(priority);
}

struct SavState<T> {
    fulfilled: bool,
    value: Option<Result<T, ReplyError>>,
    wakers: Vec<Waker>,
}

/// Single-assignment value with an endpoint: the receiver behind a
/// [`ReplyPromise`]/[`ReplyFuture`] pair.
pub(crate) struct NetSav<T> {
    refs: RefCounts,
    endpoint: EndpointRef,
    state: RefCell<SavState<T>>,
}

impl<T: Message> NetSav<T> {
    fn new_local() -> Self {
        Self {
            refs: RefCounts::new(1, 0),
            endpoint: EndpointRef::empty(false),
            state: RefCell::new(SavState {
                fulfilled: false,
                value: None,
                wakers: Vec::new(),
            }),
        }
    }

    fn new_remote(endpoint: Endpoint) -> Self {
        Self {
            refs: RefCounts::new(1, 0),
            endpoint: EndpointRef::remote(endpoint, false),
            state: RefCell::new(SavState {
                fulfilled: false,
                value: None,
                wakers: Vec::new(),
            }),
        }
    }

    fn can_be_set(&self) -> bool {
        !self.state.borrow().fulfilled
    }

    fn set_local(&self, result: Result<T, ReplyError>) {
        let mut state = self.state.borrow_mut();
        state.fulfilled = true;
        state.value = Some(result);
        for waker in state.wakers.drain(..) {
            waker.wake();
        }
    }

    /// Fulfil exactly once: a remote promise serializes and sends the
    /// `ErrorOr<T>` to its endpoint, a local one wakes its future.
    fn fulfill(&self, result: Result<T, ReplyError>) {
        if !self.can_be_set() {
            tracing::trace!("ignoring second fulfilment of reply");
            return;
        }
        if let Some(endpoint) = self.endpoint.remote_endpoint() {
            self.state.borrow_mut().fulfilled = true;
            let bytes = match result {
                Ok(value) => match wire::encode_ok(&value) {
                    Ok(bytes) => Some(bytes),
                    Err(e) => {
                        tracing::error!(error = %e, "failed to serialize reply; sending error");
                        wire::encode_err::<T>(&ReplyError::Serialization {
                            message: e.to_string(),
                        })
                    }
                },
                Err(error) => wire::encode_err::<T>(&error),
            };
            if let Some(bytes) = bytes {
                transport().send_unreliable(bytes, &endpoint, false);
            }
        } else {
            self.set_local(result);
        }
    }

    fn del_promise_ref(&self) {
        if self.refs.del_promise()
            && self.can_be_set()
            && (self.refs.futures() > 0 || self.endpoint.is_remote())
        {
            self.fulfill(Err(ReplyError::BrokenPromise));
        }
    }

    fn poll_take(&self, cx: &mut Context<'_>) -> Poll<Result<T, ReplyError>> {
        let mut state = self.state.borrow_mut();
        if let Some(value) = state.value.take() {
            return Poll::Ready(value);
        }
        assert!(!state.fulfilled, "reply future polled after completion");
        state.wakers.push(cx.waker().clone());
        Poll::Pending
    }
}

impl<T: Message> MessageReceiver for NetSav<T> {
    fn receive(&self, payload: &[u8]) {
        if !self.can_be_set() {
            return;
        }
        // Transient producer ref held while decoding, so delivery cannot
        // race the last handle's teardown into a second fulfilment.
        self.refs.add_promise();
        match wire::decode::<Result<T, ReplyError>>(payload) {
            Ok(result) => {
                if matches!(result, Err(ReplyError::BrokenPromise))
                    && let Some(endpoint) = self.endpoint.endpoint()
                {
                    failure_monitor().endpoint_not_found(&endpoint);
                }
                self.set_local(result);
            }
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable reply message");
            }
        }
        self.del_promise_ref();
    }
}

/// Producer handle for a single typed reply.
///
/// Fulfil with [`send`](ReplyPromise::send) or
/// [`send_error`](ReplyPromise::send_error). Dropping every promise handle
/// without fulfilling delivers [`ReplyError::BrokenPromise`] to the
/// consumer — locally for a local promise, over the wire for one that was
/// deserialized from a request.
pub struct ReplyPromise<T: Message> {
    sav: Rc<NetSav<T>>,
}

impl<T: Message> ReplyPromise<T> {
    /// A fresh local promise with an unallocated endpoint.
    pub fn new() -> Self {
        Self {
            sav: Rc::new(NetSav::new_local()),
        }
    }

    /// A remote promise bound to a wire-loaded endpoint.
    pub(crate) fn from_endpoint(endpoint: Endpoint) -> Self {
        Self {
            sav: Rc::new(NetSav::new_remote(endpoint)),
        }
    }

    /// Fulfil with a value.
    pub fn send(&self, value: T) {
        self.sav.fulfill(Ok(value));
    }

    /// Fulfil with an error.
    pub fn send_error(&self, error: ReplyError) {
        self.sav.fulfill(Err(error));
    }

    /// Whether the promise has been fulfilled.
    pub fn is_set(&self) -> bool {
        !self.sav.can_be_set()
    }

    /// Consumer future for this promise's reply.
    pub fn get_future(&self) -> ReplyFuture<T> {
        self.sav.refs.add_future();
        ReplyFuture {
            sav: Rc::clone(&self.sav),
        }
    }

    /// The promise's endpoint, registering the receiver at `priority` on
    /// first observation. Repeated calls return the same endpoint.
    pub fn get_endpoint(&self, priority: TaskPriority) -> Endpoint {
        let receiver: Rc<dyn MessageReceiver> = Rc::clone(&self.sav) as Rc<dyn MessageReceiver>;
        self.sav.endpoint.get_endpoint(&receiver, priority)
    }

    /// Replace this handle with a fresh local promise.
    pub fn reset(&mut self) {
        *self = ReplyPromise::new();
    }

    /// Outstanding producer handles (debug aid).
    pub fn promise_ref_count(&self) -> usize {
        self.sav.refs.promises()
    }

    /// Outstanding consumer futures (debug aid).
    pub fn future_ref_count(&self) -> usize {
        self.sav.refs.futures()
    }
}

impl<T: Message> Default for ReplyPromise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Message> Clone for ReplyPromise<T> {
    fn clone(&self) -> Self {
        self.sav.refs.add_promise();
        Self {
            sav: Rc::clone(&self.sav),
        }
    }
}

impl<T: Message> Drop for ReplyPromise<T> {
    fn drop(&mut self) {
        self.sav.del_promise_ref();
    }
}

impl<T: Message> Request for ReplyPromise<T> {
    type Reply = T;

    fn reply(&self) -> &ReplyPromise<T> {
        self
    }

    fn reply_mut(&mut self) -> &mut ReplyPromise<T> {
        self
    }
}

/// On the wire a promise is only its token; the receiving side resolves
/// the token against the connection's peer address.
impl<T: Message> Serialize for ReplyPromise<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let endpoint = self.get_endpoint(TaskPriority::DefaultPromiseEndpoint);
        endpoint.token.serialize(serializer)
    }
}

impl<'de, T: Message> Deserialize<'de> for ReplyPromise<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let token = UID::deserialize(deserializer)?;
        let endpoint = transport().loaded_endpoint(token);
        Ok(ReplyPromise::from_endpoint(endpoint))
    }
}

/// Consumer future for a [`ReplyPromise`].
///
/// Resolves when the promise is fulfilled, locally or by a wire message.
pub struct ReplyFuture<T: Message> {
    sav: Rc<NetSav<T>>,
}

impl<T: Message> Future for ReplyFuture<T> {
    type Output = Result<T, ReplyError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.sav.poll_take(cx)
    }
}

impl<T: Message> Drop for ReplyFuture<T> {
    fn drop(&mut self) {
        self.sav.refs.del_future();
    }
}
