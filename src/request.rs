//! Client-side request handles.
//!
//! A [`Request`](Request) targets the single queue serving its resolved uid
//! set; a [`MultiRequest`](MultiRequest) sends one child per target uid over
//! that uid's direct queue and gathers every reply under one deadline.

use crate::control::AddQueue;
use crate::dispatcher::{Dispatcher, ReceiverStatus};
use crate::error::{RpcError, RpcErrorKind};
use crate::message::{self, RpcMessage};
use crate::payload::SessionData;
use crate::response::{RawResponse, ResponseHandle};
use crate::OptionalTimeout;
use redis::Commands;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Predicate over fresh receiver statuses, used to pick request targets.
pub type StatusFilter = Arc<dyn Fn(&ReceiverStatus) -> bool + Send + Sync>;

/// Below this remainder the gather loop stops instead of issuing another
/// blocking pop; redis treats a zero timeout as infinite.
const MIN_POP_WINDOW: Duration = Duration::from_millis(10);

/// How a request picks its receivers: an explicit uid set, a status
/// predicate, or (when neither is given) "whoever has the class registered".
struct TargetSpec {
    filter: Option<StatusFilter>,
    targets: Option<BTreeSet<String>>,
}

impl TargetSpec {
    fn new() -> Self {
        Self {
            filter: None,
            targets: None,
        }
    }

    fn resolve(&self, dispatcher: &Dispatcher, class_id: &str) -> Result<BTreeSet<String>, RpcError> {
        if self.filter.is_some() && self.targets.is_some() {
            return Err(RpcError::invalid_argument(
                "can't provide both a filter and a target list",
            ));
        }
        if let Some(targets) = &self.targets {
            return Ok(targets.clone());
        }
        let statuses = dispatcher.filter_services(|status| match &self.filter {
            Some(filter) => filter(status),
            None => status.registered_messages.contains(class_id),
        })?;
        Ok(statuses.into_iter().map(|s| s.uid).collect())
    }
}

/// Picks the queue serving exactly `uids`. When none exists and `provision`
/// is allowed, a fresh queue is provisioned by asking every target to listen
/// on it. Children of that provisioning fan-out are single-uid requests,
/// which always resolve to the target's direct queues, so the recursion
/// bottoms out.
fn resolve_queue(
    dispatcher: &Dispatcher,
    uids: &BTreeSet<String>,
    provision: bool,
) -> Result<String, RpcError> {
    let preexisting = dispatcher.queues_serving_exactly(uids)?;
    if let Some(queue) = preexisting.into_iter().next() {
        return Ok(queue);
    }
    if !provision {
        return Err(RpcError::new(
            RpcErrorKind::NoSuitableReceiver,
            "no queue serves the target set",
        ));
    }
    let queue = dispatcher.new_queue_name();
    debug!(%queue, targets = uids.len(), "provisioning a queue for the target set");
    MultiRequest::new(
        dispatcher.clone(),
        AddQueue {
            name: queue.clone(),
        },
    )
    .targets(uids.iter().cloned())
    .send_and_wait(None)?;
    Ok(queue)
}

/// A single-target request. Send exactly once, then wait.
pub struct Request<M: RpcMessage> {
    dispatcher: Dispatcher,
    message: M,
    spec: TargetSpec,
    session_data: Option<SessionData>,
    handle: Option<ResponseHandle>,
    finished: bool,
}

impl<M: RpcMessage> Request<M> {
    pub fn new(dispatcher: Dispatcher, message: M) -> Self {
        Self {
            dispatcher,
            message,
            spec: TargetSpec::new(),
            session_data: None,
            handle: None,
            finished: false,
        }
    }

    /// Restricts the request to receivers passing the predicate.
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&ReceiverStatus) -> bool + Send + Sync + 'static,
    {
        self.spec.filter = Some(Arc::new(filter));
        self
    }

    pub(crate) fn filter_shared(mut self, filter: StatusFilter) -> Self {
        self.spec.filter = Some(filter);
        self
    }

    /// Aims the request at an explicit uid set.
    pub fn targets<I>(mut self, uids: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        self.spec.targets = Some(uids.into_iter().collect());
        self
    }

    /// Attaches session data that travels with the request payload.
    pub fn session_data(mut self, data: SessionData) -> Self {
        self.session_data = Some(data);
        self
    }

    pub fn sent(&self) -> bool {
        self.handle.is_some()
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Task id, available once sent.
    pub fn task_id(&self) -> Option<&str> {
        self.handle.as_ref().map(|h| h.task_id())
    }

    /// Resolves targets and queue, then enqueues the message. Errors with
    /// [`NoSuitableReceiver`](RpcErrorKind::NoSuitableReceiver) when nothing
    /// fresh matches and with
    /// [`InvalidArgument`](RpcErrorKind::InvalidArgument) on a second send.
    pub fn send_async(&mut self) -> Result<(), RpcError> {
        if self.handle.is_some() {
            return Err(RpcError::invalid_argument(
                "this request has already been sent",
            ));
        }
        let targets = self.spec.resolve(&self.dispatcher, M::CLASS_ID)?;
        if targets.is_empty() {
            return Err(RpcError::new(
                RpcErrorKind::NoSuitableReceiver,
                "no suitable receiver services were found",
            ));
        }
        let queue = resolve_queue(&self.dispatcher, &targets, true)?;
        let envelope = message::envelope(&self.message)?;
        let handle =
            self.dispatcher
                .queue_task(&queue, envelope, self.session_data.clone(), None)?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Blocks for the reply. Must follow [`send_async`](Self::send_async).
    pub fn wait(&mut self, timeout: OptionalTimeout) -> Result<M::Reply, RpcError> {
        let response = self.wait_raw(timeout)?;
        message::decode_reply::<M>(response.payload.returned_value)
    }

    /// Like [`wait`](Self::wait) but hands back the whole response payload.
    pub fn wait_raw(&mut self, timeout: OptionalTimeout) -> Result<RawResponse, RpcError> {
        let handle = self.handle.as_ref().ok_or_else(|| {
            RpcError::invalid_argument("tried to wait on a request that was not sent")
        })?;
        let response = handle.wait(timeout)?;
        self.finished = true;
        Ok(response)
    }

    /// Single-shot send plus wait.
    pub fn send_and_wait(mut self, timeout: OptionalTimeout) -> Result<M::Reply, RpcError> {
        self.send_async()?;
        self.wait(timeout)
    }

    /// Releases the underlying response handle, e.g. to park it in a
    /// session.
    pub fn into_handle(self) -> Option<ResponseHandle> {
        self.handle
    }
}

struct Child {
    uid: String,
    handle: ResponseHandle,
    response: Option<RawResponse>,
}

/// Fan-out variant: one logical send, N targets, gather-all wait. Replies
/// come back in the captured target-set order regardless of arrival order.
pub struct MultiRequest<M: RpcMessage> {
    dispatcher: Dispatcher,
    message: M,
    spec: TargetSpec,
    session_data: Option<SessionData>,
    children: Vec<Child>,
    sent: bool,
}

impl<M: RpcMessage> MultiRequest<M> {
    pub fn new(dispatcher: Dispatcher, message: M) -> Self {
        Self {
            dispatcher,
            message,
            spec: TargetSpec::new(),
            session_data: None,
            children: Vec::new(),
            sent: false,
        }
    }

    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&ReceiverStatus) -> bool + Send + Sync + 'static,
    {
        self.spec.filter = Some(Arc::new(filter));
        self
    }

    pub fn targets<I>(mut self, uids: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        self.spec.targets = Some(uids.into_iter().collect());
        self
    }

    pub fn session_data(mut self, data: SessionData) -> Self {
        self.session_data = Some(data);
        self
    }

    pub fn sent(&self) -> bool {
        self.sent
    }

    /// Uids captured at send time, in reply order.
    pub fn target_uids(&self) -> Vec<String> {
        self.children.iter().map(|c| c.uid.clone()).collect()
    }

    /// Sends one child per target uid over that uid's own queue.
    pub fn send_async(&mut self) -> Result<(), RpcError> {
        if self.sent {
            return Err(RpcError::invalid_argument(
                "this request has already been sent",
            ));
        }
        let targets = self.spec.resolve(&self.dispatcher, M::CLASS_ID)?;
        if targets.is_empty() {
            return Err(RpcError::new(
                RpcErrorKind::NoSuitableReceiver,
                "no suitable receiver services were found",
            ));
        }
        let envelope = message::envelope(&self.message)?;
        for uid in targets {
            let single = BTreeSet::from([uid.clone()]);
            let queue = resolve_queue(&self.dispatcher, &single, false)?;
            let handle = self.dispatcher.queue_task(
                &queue,
                envelope.clone(),
                self.session_data.clone(),
                None,
            )?;
            self.children.push(Child {
                uid,
                handle,
                response: None,
            });
        }
        self.sent = true;
        Ok(())
    }

    /// Pops the union of the children's reply lists until every child has
    /// answered or the deadline passes. Fewer than N replies is a
    /// [`PartialTimeout`](RpcErrorKind::PartialTimeout).
    pub fn wait(&mut self, timeout: OptionalTimeout) -> Result<Vec<M::Reply>, RpcError> {
        if !self.sent {
            return Err(RpcError::invalid_argument(
                "tried to wait on a request that was not sent",
            ));
        }
        let timeout = timeout.unwrap_or(self.dispatcher.default_timeout());
        let deadline = Instant::now() + timeout;
        let mut conn = self.dispatcher.connection()?;
        while self.children.iter().any(|c| c.response.is_none()) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining < MIN_POP_WINDOW {
                break;
            }
            let pending: Vec<String> = self
                .children
                .iter()
                .filter(|c| c.response.is_none())
                .map(|c| c.handle.task_id().to_string())
                .collect();
            let result = conn.brpop::<&[String], Option<(String, Vec<u8>)>>(
                &pending,
                remaining.as_secs_f64(),
            )?;
            let Some((reply_list, bytes)) = result else {
                break;
            };
            let child = self
                .children
                .iter_mut()
                .find(|c| c.handle.task_id() == reply_list);
            match child {
                Some(child) => child.response = Some(child.handle.accept(&bytes)?),
                None => debug!(%reply_list, "pop from a list no child owns; dropping"),
            }
        }
        let got = self.children.iter().filter(|c| c.response.is_some()).count();
        let expected = self.children.len();
        if got < expected {
            return Err(RpcError::new(
                RpcErrorKind::PartialTimeout { got, expected },
                format!("timeout waiting for replies, got {got} out of {expected}"),
            ));
        }
        self.children
            .iter_mut()
            .map(|c| {
                let response = c.response.take().map(|r| r.payload.returned_value);
                message::decode_reply::<M>(response.flatten())
            })
            .collect()
    }

    pub fn send_and_wait(mut self, timeout: OptionalTimeout) -> Result<Vec<M::Reply>, RpcError> {
        self.send_async()?;
        self.wait(timeout)
    }
}
