//! Caller-side session: pins consecutive requests to the receiver that
//! answered first and threads `session_data` through every exchange.

use crate::dispatcher::Dispatcher;
use crate::error::RpcError;
use crate::message::{self, RpcMessage};
use crate::payload::SessionData;
use crate::request::{Request, StatusFilter};
use crate::response::ResponseHandle;
use crate::OptionalTimeout;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Sticky-receiver facade over [`Request`](Request). One request may be in
/// flight at a time; the uid of the first responder becomes the session's
/// target for every later send.
pub struct Session {
    dispatcher: Dispatcher,
    session_id: String,
    service_uid: Option<String>,
    filter: Option<StatusFilter>,
    session_data: SessionData,
    pending: Option<ResponseHandle>,
}

impl Session {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            session_id: format!("rdisq_session_{}", Uuid::new_v4()),
            service_uid: None,
            filter: None,
            session_data: SessionData::new(),
            pending: None,
        }
    }

    /// Restricts which receivers the session may stick to. Only consulted
    /// until the first response pins a uid.
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&crate::dispatcher::ReceiverStatus) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Uid the session is pinned to, once the first response arrived.
    pub fn service_uid(&self) -> Option<&str> {
        self.service_uid.as_deref()
    }

    pub fn session_data(&self) -> &SessionData {
        &self.session_data
    }

    pub fn session_data_mut(&mut self) -> &mut SessionData {
        &mut self.session_data
    }

    pub fn set_session_data(&mut self, data: SessionData) {
        self.session_data = data;
    }

    /// Sends a message carrying the current session data. Refuses while a
    /// previous request is still pending.
    pub fn send<M: RpcMessage>(&mut self, message: M) -> Result<(), RpcError> {
        if self.pending.is_some() {
            return Err(RpcError::invalid_argument(
                "the previous request of this session is not done yet",
            ));
        }
        let mut request = Request::new(self.dispatcher.clone(), message)
            .session_data(self.session_data.clone());
        request = match (&self.service_uid, &self.filter) {
            (Some(uid), _) => request.targets([uid.clone()]),
            (None, Some(filter)) => request.filter_shared(filter.clone()),
            (None, None) => request,
        };
        request.send_async()?;
        self.pending = request.into_handle();
        Ok(())
    }

    /// Waits for the pending reply, adopts the session data the receiver
    /// returned, and pins the responder's uid when not pinned yet.
    pub fn wait<M: RpcMessage>(&mut self, timeout: OptionalTimeout) -> Result<M::Reply, RpcError> {
        let handle = self.pending.take().ok_or_else(|| {
            RpcError::invalid_argument("there is no pending request to wait on")
        })?;
        let response = handle.wait(timeout)?;
        if let Some(data) = response.payload.session_data {
            self.session_data = data;
        }
        if self.service_uid.is_none() {
            debug!(
                session_id = %self.session_id,
                service_uid = %response.payload.service_uid,
                "session pinned to receiver"
            );
            self.service_uid = Some(response.payload.service_uid.clone());
        }
        message::decode_reply::<M>(response.payload.returned_value)
    }

    pub fn send_and_wait<M: RpcMessage>(
        &mut self,
        message: M,
        timeout: OptionalTimeout,
    ) -> Result<M::Reply, RpcError> {
        self.send(message)?;
        self.wait::<M>(timeout)
    }
}
