//! Client-side handle for one request/response exchange. The task id names
//! the reply list; the only blocking call is [`wait`](ResponseHandle::wait).

use crate::dispatcher::Dispatcher;
use crate::error::RpcError;
use crate::payload::ResponsePayload;
use crate::OptionalTimeout;
use redis::Commands;
use std::time::{Duration, Instant};
use tracing::debug;

/// A decoded response together with the caller-observed round-trip time.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub payload: ResponsePayload,
    /// Time from enqueue to the response being popped on the caller side.
    pub total_time: Duration,
}

/// Future-like handle bound to a single task id.
pub struct ResponseHandle {
    dispatcher: Dispatcher,
    task_id: String,
    called_at: Instant,
}

impl ResponseHandle {
    pub(crate) fn new(dispatcher: Dispatcher, task_id: String) -> Self {
        Self {
            dispatcher,
            task_id,
            called_at: Instant::now(),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Whether a response is already sitting on the reply list. Does not
    /// block and does not consume it.
    pub fn is_processed(&self) -> Result<bool, RpcError> {
        let mut conn = self.dispatcher.connection()?;
        let len: u64 = conn.llen(&self.task_id)?;
        Ok(len > 0)
    }

    /// Blocks until the response arrives or `timeout` (the dispatcher
    /// default when `None`) elapses. A captured handler failure is re-raised
    /// here as [`HandlerException`](crate::RpcErrorKind::HandlerException).
    pub fn wait(&self, timeout: OptionalTimeout) -> Result<RawResponse, RpcError> {
        let timeout = timeout.unwrap_or(self.dispatcher.default_timeout());
        let mut conn = self.dispatcher.connection()?;
        let result = conn.brpop::<&str, Option<(String, Vec<u8>)>>(
            &self.task_id,
            timeout.as_secs_f64(),
        )?;
        let Some((_, bytes)) = result else {
            return Err(RpcError::timeout(&self.task_id));
        };
        conn.del::<&str, ()>(&self.task_id)?;
        self.accept(&bytes)
    }

    /// Decodes a response payload popped from this handle's reply list by an
    /// external poller (the multi-request gather loop).
    pub(crate) fn accept(&self, bytes: &[u8]) -> Result<RawResponse, RpcError> {
        let mut payload: ResponsePayload = self.dispatcher.decode(bytes)?;
        let total_time = self.called_at.elapsed();
        debug!(
            task_id = %self.task_id,
            service_uid = %payload.service_uid,
            processing_time_seconds = payload.processing_time_seconds,
            "response received"
        );
        if let Some(raised) = payload.raised_exception.take() {
            return Err(RpcError::handler_exception(raised));
        }
        Ok(RawResponse {
            payload,
            total_time,
        })
    }
}
