//! JSON body codec shared by the client and the consumer.
//!
//! Request bodies are JSON objects or arrays. Reply bodies are whatever the
//! remote processor produced; by convention an object with an `"error"` key
//! reports a failure instead of a result.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::{Result, RpcError};

/// Key under which processors report failures in a reply body.
pub const ERROR_KEY: &str = "error";

/// Serialize a request payload into a message body.
///
/// # Errors
///
/// - `RpcError::Serialization` if `payload` cannot be serialized.
/// - `RpcError::InvalidPayload` if it is not a JSON object or array.
pub fn encode_payload<T>(payload: &T) -> Result<Bytes>
where
    T: Serialize + ?Sized,
{
    let value = serde_json::to_value(payload)?;

    if !(value.is_object() || value.is_array()) {
        return Err(RpcError::InvalidPayload(format!(
            "expected a JSON object or array at top level, got {}",
            kind_of(&value)
        )));
    }

    Ok(Bytes::from(serde_json::to_vec(&value)?))
}

/// Parse a reply body.
pub fn decode_reply(body: &[u8]) -> Result<Value> {
    serde_json::from_slice(body).map_err(|e| RpcError::Decode(format!("reply is not valid JSON: {e}")))
}

/// Turn an `{"error": ...}` reply into `RpcError::Remote`.
pub fn reject_error_reply(reply: Value) -> Result<Value> {
    match reply {
        Value::Object(mut map) if map.contains_key(ERROR_KEY) => {
            Err(RpcError::Remote(map.remove(ERROR_KEY).unwrap_or(Value::Null)))
        }
        other => Ok(other),
    }
}

/// Extract `reply[field]` as a list of typed records.
///
/// Every element must match `T`; the first mismatch fails the whole reply.
pub fn take_records<T>(reply: Value, field: &str) -> Result<Vec<T>>
where
    T: DeserializeOwned,
{
    let mut reply = reject_error_reply(reply)?;

    let list = match reply.get_mut(field).map(Value::take) {
        Some(Value::Array(items)) => items,
        Some(other) => {
            return Err(RpcError::Decode(format!(
                "field '{field}' must be a list, got {}",
                kind_of(&other)
            )))
        }
        None => return Err(RpcError::Decode(format!("reply has no '{field}' field"))),
    };

    list.into_iter()
        .enumerate()
        .map(|(index, item)| {
            serde_json::from_value(item)
                .map_err(|e| RpcError::Decode(format!("{field}[{index}]: {e}")))
        })
        .collect()
}

pub(crate) fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Item {
        id: u32,
    }

    #[test]
    fn test_encode_rejects_scalars() {
        // ---
        assert!(encode_payload(&json!({"x": 1})).is_ok());
        assert!(encode_payload(&json!([1, 2])).is_ok());

        let err = encode_payload(&json!(42)).unwrap_err();
        assert!(matches!(err, RpcError::InvalidPayload(_)));
    }

    #[test]
    fn test_decode_reply_reports_garbage() {
        // ---
        let err = decode_reply(b"<html>").unwrap_err();
        assert!(matches!(err, RpcError::Decode(_)));
    }

    #[test]
    fn test_error_reply_becomes_remote() {
        // ---
        let err = reject_error_reply(json!({"error": "Product not found"})).unwrap_err();
        match err {
            RpcError::Remote(detail) => assert_eq!(detail, json!("Product not found")),
            other => panic!("unexpected error: {other:?}"),
        }

        let ok = reject_error_reply(json!({"products": []})).unwrap();
        assert_eq!(ok, json!({"products": []}));
    }

    #[test]
    fn test_take_records_validates_each_element() {
        // ---
        let items: Vec<Item> = take_records(json!({"items": [{"id": 1}, {"id": 2}]}), "items").unwrap();
        assert_eq!(items, vec![Item { id: 1 }, Item { id: 2 }]);

        let err = take_records::<Item>(json!({"items": [{"id": 1}, {"id": "x"}]}), "items").unwrap_err();
        match err {
            RpcError::Decode(msg) => assert!(msg.starts_with("items[1]"), "{msg}"),
            other => panic!("unexpected error: {other:?}"),
        }

        let err = take_records::<Item>(json!({"other": []}), "items").unwrap_err();
        assert!(matches!(err, RpcError::Decode(_)));
    }
}
