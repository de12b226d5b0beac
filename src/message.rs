//! Wire-level message type.
//!
//! Every task or payload travelling through a queue is stamped with a
//! send-time timestamp and carries an arbitrary JSON object body. On the
//! wire the body is flattened next to `ts`, so a delivered message looks
//! like `{"ts": 1700000000000, "bar": "X"}`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{Error, Result};

/// Current epoch time in milliseconds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Payload delivered to a listener.
///
/// Constructed at send time, immutable after. The `ts` field is always
/// injected by the sending side; any `ts` present in the caller's payload
/// is discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Send-time timestamp, epoch milliseconds.
    pub ts: u64,

    /// Arbitrary key/value payload, flattened on the wire.
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl Message {
    /// Create an empty message carrying only the current timestamp.
    pub fn new() -> Self {
        Self {
            ts: now_millis(),
            data: Map::new(),
        }
    }

    /// Build a message from a caller-supplied payload, injecting `ts`.
    ///
    /// Accepts a JSON object or `null` (treated as an empty payload).
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` for any other JSON value; the
    /// payload must be a keyed object so it can be flattened next to `ts`.
    pub fn from_payload(payload: Value) -> Result<Self> {
        let mut data = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(Error::InvalidArgument(format!(
                    "payload must be a JSON object, got: {other}"
                )))
            }
        };
        data.remove("ts");

        Ok(Self {
            ts: now_millis(),
            data,
        })
    }

    /// Look up a payload field by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Decode a message from its JSON wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Encode the message into its JSON wire form.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_payload_injects_ts() {
        // ---
        let msg = Message::from_payload(json!({"bar": "X"})).unwrap();
        assert!(msg.ts > 0);
        assert_eq!(msg.get("bar"), Some(&json!("X")));
    }

    #[test]
    fn test_from_payload_discards_caller_ts() {
        // ---
        let msg = Message::from_payload(json!({"ts": 1, "bar": "X"})).unwrap();
        assert_ne!(msg.ts, 1);
        assert!(msg.get("ts").is_none());
    }

    #[test]
    fn test_from_payload_rejects_non_object() {
        // ---
        assert!(matches!(
            Message::from_payload(json!([1, 2])),
            Err(Error::InvalidArgument(_))
        ));
        assert!(Message::from_payload(Value::Null).unwrap().data.is_empty());
    }

    #[test]
    fn test_wire_round_trip() {
        // ---
        let msg = Message::from_payload(json!({"bar": "X"})).unwrap();
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }
}
