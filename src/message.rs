//! The typed message contract and queue naming.
//!
//! Each message class carries a globally unique string id. The id is the
//! routing key the discovery layer matches on, and the base name of the
//! class's queues.

use crate::error::RpcError;
use crate::payload::MessageEnvelope;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Separates the uid from the rest of a direct queue name. Uids, service
/// names and class ids must not contain it, otherwise queue names would not
/// parse unambiguously.
pub const DIRECT_QUEUE_DELIMITER: char = '@';

/// An application message that defines one RPC method.
///
/// `CLASS_ID` must be unique across every class sharing the broker; the
/// usual convention is a dotted `module.name` path. `Reply` is what the
/// registered handler returns.
pub trait RpcMessage: Serialize + DeserializeOwned + Send + 'static {
    const CLASS_ID: &'static str;
    type Reply: Serialize + DeserializeOwned + Send + 'static;
}

/// Queue every receiver of the service competes on. Redis arbitrates which
/// listener dequeues, which is what gives load balancing.
pub fn broadcast_queue_name(service_name: &str, class_id: &str) -> String {
    format!("{service_name}_{class_id}")
}

/// Queue only the receiver with `uid` serves.
pub fn direct_queue_name(uid: &str, service_name: &str, class_id: &str) -> String {
    format!("{uid}{DIRECT_QUEUE_DELIMITER}{service_name}_{class_id}")
}

/// Uids, service names, class ids and user queue names all have to stay
/// delimiter-free.
pub fn validate_name_component(value: &str) -> Result<(), RpcError> {
    if value.is_empty() {
        return Err(RpcError::invalid_argument("empty name component"));
    }
    if value.contains(DIRECT_QUEUE_DELIMITER) {
        return Err(RpcError::invalid_argument(format!(
            "name component {value:?} contains the reserved delimiter {DIRECT_QUEUE_DELIMITER:?}"
        )));
    }
    Ok(())
}

/// Wraps a message with its class identity for the wire.
pub fn envelope<M: RpcMessage>(message: &M) -> Result<MessageEnvelope, RpcError> {
    Ok(MessageEnvelope {
        class: M::CLASS_ID.to_string(),
        body: serde_json::to_value(message)?,
    })
}

/// Decodes a reply value returned by a remote handler.
pub(crate) fn decode_reply<M: RpcMessage>(value: Option<Value>) -> Result<M::Reply, RpcError> {
    Ok(serde_json::from_value(value.unwrap_or(Value::Null))?)
}
