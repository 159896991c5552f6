use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::{trace, warn};

use crate::error::ExceptionType;
use crate::pdu::message::ProtocolMessage;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ResponseStatus {
    Waiting,
    Ok,
    TimedOut,
}

pub type ResponseCallback = Box<dyn Fn(ProtocolMessage) + Send + Sync>;

#[derive(Debug)]
struct BlockingState {
    status: ResponseStatus,
    reply: Option<ProtocolMessage>,
}

enum ResponseKind {
    /// the sender awaits the reply
    Blocking {
        state: watch::Sender<BlockingState>,
        timeout: Option<Duration>,
    },
    /// the reply is handed to a callback on the channel's reader task
    Callback {
        status: Mutex<ResponseStatus>,
        callback: ResponseCallback,
    },
}

/// A pending response, registered under a request id in a [ResponseTable] while its request is
///  in flight.
pub struct ChannelResponse {
    request_id: AtomicI64,
    kind: ResponseKind,
}

impl Debug for ChannelResponse {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            ResponseKind::Blocking { .. } => "blocking",
            ResponseKind::Callback { .. } => "callback",
        };
        write!(f, "ChannelResponse{{{}:{}:{:?}}}", kind, self.request_id(), self.status())
    }
}

impl ChannelResponse {
    /// A response that is awaited by the sender, for at most `timeout` if that is set
    pub fn blocking(timeout: Option<Duration>) -> Arc<ChannelResponse> {
        Arc::new(ChannelResponse {
            request_id: AtomicI64::new(0),
            kind: ResponseKind::Blocking {
                state: watch::Sender::new(BlockingState {
                    status: ResponseStatus::Waiting,
                    reply: None,
                }),
                timeout,
            },
        })
    }

    pub fn callback(callback: impl Fn(ProtocolMessage) + Send + Sync + 'static) -> Arc<ChannelResponse> {
        Arc::new(ChannelResponse {
            request_id: AtomicI64::new(0),
            kind: ResponseKind::Callback {
                status: Mutex::new(ResponseStatus::Waiting),
                callback: Box::new(callback),
            },
        })
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self.kind, ResponseKind::Blocking { .. })
    }

    pub fn request_id(&self) -> i64 {
        self.request_id.load(Ordering::Acquire)
    }

    pub fn timeout(&self) -> Option<Duration> {
        match &self.kind {
            ResponseKind::Blocking { timeout, .. } => *timeout,
            ResponseKind::Callback { .. } => None,
        }
    }

    fn set_request_id(&self, request_id: i64) {
        self.request_id.store(request_id, Ordering::Release);
    }

    pub fn status(&self) -> ResponseStatus {
        match &self.kind {
            ResponseKind::Blocking { state, .. } => state.borrow().status,
            ResponseKind::Callback { status, .. } => *lock(status),
        }
    }

    /// Deliver the reply. Only the first delivery after construction or [ChannelResponse::reset]
    ///  has an effect, later ones are ignored.
    pub fn set_reply(&self, msg: ProtocolMessage) {
        match &self.kind {
            ResponseKind::Blocking { state, .. } => {
                state.send_if_modified(|state| {
                    if state.status != ResponseStatus::Waiting {
                        trace!("ignoring redundant reply for request {}", msg.request_id());
                        return false;
                    }
                    state.status = ResponseStatus::Ok;
                    state.reply = Some(msg);
                    true
                });
            }
            ResponseKind::Callback { status, callback } => {
                {
                    let mut status = lock(status);
                    if *status != ResponseStatus::Waiting {
                        trace!("ignoring redundant reply for request {}", msg.request_id());
                        return;
                    }
                    *status = ResponseStatus::Ok;
                }
                callback(msg);
            }
        }
    }

    /// Wait until the reply arrives or the timeout expires. A callback response does not wait, it
    ///  returns its current status right away.
    pub async fn wait(&self) -> ResponseStatus {
        match &self.kind {
            ResponseKind::Blocking { state, timeout } => {
                let mut rx = state.subscribe();
                let reply_arrived = rx.wait_for(|s| s.status != ResponseStatus::Waiting);

                match timeout {
                    None => {
                        // the sender is owned by self, so the channel can not be closed while we wait
                        let _ = reply_arrived.await;
                    }
                    Some(timeout) => {
                        if tokio::time::timeout(*timeout, reply_arrived).await.is_err() {
                            state.send_if_modified(|s| {
                                if s.status == ResponseStatus::Waiting {
                                    s.status = ResponseStatus::TimedOut;
                                    true
                                }
                                else {
                                    false
                                }
                            });
                        }
                    }
                }
                self.status()
            }
            ResponseKind::Callback { status, .. } => *lock(status),
        }
    }

    pub fn take_reply(&self) -> Option<ProtocolMessage> {
        match &self.kind {
            ResponseKind::Blocking { state, .. } => {
                let mut result = None;
                state.send_if_modified(|s| {
                    result = s.reply.take();
                    false
                });
                result
            }
            ResponseKind::Callback { .. } => None,
        }
    }

    /// Prepare for reuse with a resent request
    pub fn reset(&self) {
        match &self.kind {
            ResponseKind::Blocking { state, .. } => {
                state.send_modify(|s| {
                    s.status = ResponseStatus::Waiting;
                    s.reply = None;
                });
            }
            ResponseKind::Callback { status, .. } => {
                *lock(status) = ResponseStatus::Waiting;
            }
        }
    }
}

fn lock(status: &Mutex<ResponseStatus>) -> std::sync::MutexGuard<'_, ResponseStatus> {
    // the guarded value is a plain enum, so a poisoned lock still holds a consistent value
    status.lock().unwrap_or_else(|e| e.into_inner())
}

/// The correlation table: pending responses by request id
#[derive(Default)]
pub struct ResponseTable {
    last_request_id: AtomicI64,
    pending: Mutex<FxHashMap<i64, Arc<ChannelResponse>>>,
}

impl ResponseTable {
    fn pending(&self) -> std::sync::MutexGuard<'_, FxHashMap<i64, Arc<ChannelResponse>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a response under a fresh request id and return that id. Every call assigns a new
    ///  id, so a resent request never receives a reply intended for a previous attempt.
    pub fn register(&self, response: &Arc<ChannelResponse>) -> i64 {
        let request_id = self.last_request_id.fetch_add(1, Ordering::AcqRel) + 1;
        response.set_request_id(request_id);
        self.pending().insert(request_id, response.clone());
        request_id
    }

    pub fn remove(&self, request_id: i64) -> Option<Arc<ChannelResponse>> {
        self.pending().remove(&request_id)
    }

    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }

    /// Hand a reply to the response registered for its request id. A reply without a matching
    ///  entry is logged and dropped.
    pub fn dispatch(&self, msg: ProtocolMessage) -> bool {
        let request_id = msg.request_id();
        match self.remove(request_id) {
            Some(response) => {
                trace!("dispatching reply {:?}", msg.header());
                response.set_reply(msg);
                true
            }
            None => {
                warn!("received reply for request id {} without a pending request - dropping {:?}", request_id, msg.header());
                false
            }
        }
    }

    /// Unblock all pending requests with an exception reply, emptying the table
    pub fn fail_all(&self, exception_type: ExceptionType, message: &str) {
        let pending = std::mem::take(&mut *self.pending());
        if !pending.is_empty() {
            trace!("failing {} pending requests with {:?}", pending.len(), exception_type);
        }
        for (request_id, response) in pending {
            let mut reply = ProtocolMessage::local_exception(exception_type, message);
            reply.set_request_id(request_id);
            response.set_reply(reply);
        }
    }
}
