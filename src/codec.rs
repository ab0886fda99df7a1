//! Pluggable payload encoding. The interchange representation is
//! [`serde_json::Value`], so an alternative codec only has to map values to
//! bytes and back; the payload structs never change. Both sides of the wire
//! must run the same codec.

use crate::error::RpcError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Symmetric encoder/decoder for everything that goes through the broker.
pub trait Codec: Send + Sync {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, RpcError>;
    fn decode(&self, bytes: &[u8]) -> Result<Value, RpcError>;
}

/// Default codec. Plain JSON bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, RpcError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, RpcError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Encodes any serializable structure through the given codec.
pub fn encode_as<T: Serialize>(codec: &dyn Codec, value: &T) -> Result<Vec<u8>, RpcError> {
    let value = serde_json::to_value(value)?;
    codec.encode(&value)
}

/// Decodes bytes produced by [`encode_as`](encode_as) back into a structure.
pub fn decode_as<T: DeserializeOwned>(codec: &dyn Codec, bytes: &[u8]) -> Result<T, RpcError> {
    let value = codec.decode(bytes)?;
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::HandlerError;
    use serde_json::json;

    #[test]
    fn json_codec_round_trips_values() {
        let codec = JsonCodec;
        let value = json!({"a": [1, 2, 3], "b": "text"});
        let bytes = codec.encode(&value).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), value);
    }

    #[test]
    fn typed_round_trip_through_the_codec() {
        let codec = JsonCodec;
        let error = HandlerError::new("sabotage", "boom");
        let bytes = encode_as(&codec, &error).unwrap();
        let decoded: HandlerError = decode_as(&codec, &bytes).unwrap();
        assert_eq!(decoded, error);
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let codec = JsonCodec;
        assert!(codec.decode(b"{not json").is_err());
    }
}
