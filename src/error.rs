//! This module covers everything related to error handling in this crate.

use crate::payload::HandlerError;
use r2d2::Error as R2d2Error;
use redis::RedisError;
use serde_json::Error as SerdeJsonError;
use std::error::Error;
use std::fmt;
use std::sync::PoisonError;
use std::time::SystemTimeError;

/// Error kinds used in this crate. For more specific error handling use the
/// source error.
#[non_exhaustive]
#[derive(Debug)]
pub enum RpcErrorKind {
    /// No response arrived on the reply list within the wait window.
    Timeout {
        /// Id of the task that went unanswered.
        task_id: String,
    },
    /// A multi-target request finished with missing replies.
    PartialTimeout { got: usize, expected: usize },
    /// No fresh receiver matched the target filter or uid set at send time.
    NoSuitableReceiver,
    /// Caller misuse: both filter and targets, double send, duplicate
    /// registration, ill-formed names.
    InvalidArgument,
    /// A handler instance of the wrong shape was supplied at registration.
    InvalidHandlerInstance,
    /// A bound handler had no instance and no sibling to borrow one from.
    MissingHandlerInstance,
    /// The remote handler failed; carries the captured error.
    HandlerException(HandlerError),
    /// A popped task id did not match its payload. Fatal for that request
    /// only.
    InternalInvariantViolation,
    /// Redis connection failure. Transient for the receiver loop.
    ConnectionLost,
    /// Encoding/decoding failure.
    Codec,
    /// Error when accessing memory, e.g. poisoned lock. Should not ever happen.
    MemoryAccessError,
    /// Errors which can't be matched with any other kind.
    Other,
}

impl RpcErrorKind {
    /// Short stable label, also used when a failure crosses the wire.
    pub fn label(&self) -> &'static str {
        match self {
            RpcErrorKind::Timeout { .. } => "timeout",
            RpcErrorKind::PartialTimeout { .. } => "partial_timeout",
            RpcErrorKind::NoSuitableReceiver => "no_suitable_receiver",
            RpcErrorKind::InvalidArgument => "invalid_argument",
            RpcErrorKind::InvalidHandlerInstance => "invalid_handler_instance",
            RpcErrorKind::MissingHandlerInstance => "missing_handler_instance",
            RpcErrorKind::HandlerException(_) => "handler_exception",
            RpcErrorKind::InternalInvariantViolation => "internal_invariant_violation",
            RpcErrorKind::ConnectionLost => "connection_lost",
            RpcErrorKind::Codec => "codec",
            RpcErrorKind::MemoryAccessError => "memory_access_error",
            RpcErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for RpcErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcErrorKind::Timeout { task_id } => write!(f, "timeout waiting on task {task_id}"),
            RpcErrorKind::PartialTimeout { got, expected } => {
                write!(f, "timeout waiting for replies, got {got} out of {expected}")
            }
            other => f.write_str(other.label()),
        }
    }
}

/// Error type for this crate. It carries a semantic kind, which may help with
/// handling. For more exhaustive information please use
/// [`RpcError::get_ref()`](RpcError::get_ref).
#[derive(Debug)]
pub struct RpcError {
    /// Error kind
    kind: RpcErrorKind,
    /// Source error or string.
    error: Box<dyn Error + Send + Sync>,
}

impl RpcError {
    /// Constructs a new error from the given `kind` and `error`. Error may be
    /// another structure which implements the [`Error`](Error) trait, or often
    /// a [`String`](String).
    pub fn new<E>(kind: RpcErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        Self {
            kind,
            error: error.into(),
        }
    }

    pub fn invalid_argument<E>(error: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        Self::new(RpcErrorKind::InvalidArgument, error)
    }

    pub fn timeout(task_id: &str) -> Self {
        Self::new(
            RpcErrorKind::Timeout {
                task_id: task_id.to_string(),
            },
            format!("no response for task {task_id} within the wait window"),
        )
    }

    pub fn handler_exception(error: HandlerError) -> Self {
        let text = error.to_string();
        Self::new(RpcErrorKind::HandlerException(error), text)
    }

    /// Returns [`kind`](Self::kind).
    pub fn kind(&self) -> &RpcErrorKind {
        &self.kind
    }

    /// Consumes self and returns the source `error`.
    pub fn into_inner(self) -> Box<dyn Error + Send + Sync> {
        self.error
    }

    /// Returns a reference to the source error.
    pub fn get_ref(&self) -> &(dyn Error + 'static) {
        self.error.as_ref()
    }
}

impl From<RedisError> for RpcError {
    fn from(error: RedisError) -> Self {
        RpcError::new(RpcErrorKind::ConnectionLost, error)
    }
}

impl From<SerdeJsonError> for RpcError {
    fn from(error: SerdeJsonError) -> Self {
        RpcError::new(RpcErrorKind::Codec, error)
    }
}

impl From<R2d2Error> for RpcError {
    fn from(error: R2d2Error) -> Self {
        RpcError::new(RpcErrorKind::ConnectionLost, error)
    }
}

impl From<SystemTimeError> for RpcError {
    fn from(error: SystemTimeError) -> Self {
        RpcError::new(RpcErrorKind::Other, error)
    }
}

/// Converts [`PoisonError`](PoisonError) into [`RpcError`](RpcError). Error content is dropped.
impl<T> From<PoisonError<T>> for RpcError {
    fn from(_: PoisonError<T>) -> Self {
        RpcError::new(RpcErrorKind::MemoryAccessError, "Cannot access guard.")
    }
}

/// Converts a local error into its on-the-wire form, preserving the kind
/// label and message.
impl From<RpcError> for HandlerError {
    fn from(error: RpcError) -> Self {
        match error.kind {
            RpcErrorKind::HandlerException(inner) => inner,
            kind => HandlerError::new(kind.label(), error.error.to_string()),
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RpcError ({}): {}", self.kind, self.error)
    }
}

impl Error for RpcError {
    /// Returns [`RpcError::get_ref()`](Self::get_ref) result, which is the error source.
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.error.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redis_errors_map_to_connection_lost() {
        let source = RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "broker gone",
        ));
        let error = RpcError::from(source);
        assert!(matches!(error.kind(), RpcErrorKind::ConnectionLost));
    }

    #[test]
    fn serde_errors_map_to_codec() {
        let source = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let error = RpcError::from(source);
        assert!(matches!(error.kind(), RpcErrorKind::Codec));
    }

    #[test]
    fn handler_exception_keeps_the_remote_kind() {
        let error = RpcError::handler_exception(HandlerError::new("sabotage", "boom"));
        let wire = HandlerError::from(error);
        assert_eq!(wire.kind, "sabotage");
        assert_eq!(wire.message, "boom");
    }

    #[test]
    fn local_kinds_cross_the_wire_as_labels() {
        let error = RpcError::invalid_argument("both filter and targets");
        let wire = HandlerError::from(error);
        assert_eq!(wire.kind, "invalid_argument");
        assert_eq!(wire.message, "both filter and targets");
    }
}
