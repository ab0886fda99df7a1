//! Structures that cross the wire: request and response payloads, the message
//! envelope, and captured handler failures. All of them pass through the
//! configured [`Codec`](crate::codec::Codec).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::error::Error;
use std::fmt;

/// Arbitrary key/value data a session threads through consecutive calls.
pub type SessionData = Map<String, Value>;

/// Plain JSON object, used for tags and constructor keyword arguments.
pub type JsonMap = Map<String, Value>;

/// A message together with its class identity, so any queue can carry any
/// registered class and the receiver can still dispatch it.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MessageEnvelope {
    /// Class id of the contained message.
    pub class: String,
    /// The encoded message itself.
    pub body: Value,
}

/// Stored under the request key with a TTL equal to `timeout`, so abandoned
/// tasks disappear even if no receiver ever picks them up.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RequestPayload {
    pub task_id: String,
    /// Request time-to-live in seconds.
    pub timeout: u64,
    pub message: MessageEnvelope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_data: Option<SessionData>,
}

/// A handler failure captured on the receiver and re-raised at the caller.
/// Round-trips through the codec with kind and message intact.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    /// Stable failure label, e.g. `invalid_argument` or an application kind.
    pub kind: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// A generic application-level failure.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new("handler_error", message)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl Error for HandlerError {}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError::msg(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError::msg(message)
    }
}

/// Pushed onto the per-task reply list, which then expires after the request
/// timeout.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ResponsePayload {
    pub returned_value: Option<Value>,
    pub raised_exception: Option<HandlerError>,
    pub processing_time_seconds: f64,
    /// Uid of the receiver that produced this response.
    pub service_uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_data: Option<SessionData>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_payload_round_trips() {
        let payload = RequestPayload {
            task_id: "q1h-1-abc".into(),
            timeout: 10,
            message: MessageEnvelope {
                class: "calc.sum".into(),
                body: json!({"first": 1, "second": 2}),
            },
            session_data: None,
        };
        let bytes = serde_json::to_vec(&payload).unwrap();
        let decoded: RequestPayload = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.task_id, payload.task_id);
        assert_eq!(decoded.timeout, 10);
        assert_eq!(decoded.message.class, "calc.sum");
        assert!(decoded.session_data.is_none());
    }

    #[test]
    fn absent_session_data_is_not_serialized() {
        let payload = ResponsePayload {
            returned_value: Some(json!(3)),
            raised_exception: None,
            processing_time_seconds: 0.01,
            service_uid: "uid-1".into(),
            session_data: None,
        };
        let text = serde_json::to_string(&payload).unwrap();
        assert!(!text.contains("session_data"));
    }

    #[test]
    fn captured_exception_survives_the_round_trip() {
        let payload = ResponsePayload {
            returned_value: None,
            raised_exception: Some(HandlerError::new("sabotage", "boom")),
            processing_time_seconds: 0.5,
            service_uid: "uid-1".into(),
            session_data: None,
        };
        let bytes = serde_json::to_vec(&payload).unwrap();
        let decoded: ResponsePayload = serde_json::from_slice(&bytes).unwrap();
        let raised = decoded.raised_exception.unwrap();
        assert_eq!(raised.kind, "sabotage");
        assert_eq!(raised.message, "boom");
    }
}
