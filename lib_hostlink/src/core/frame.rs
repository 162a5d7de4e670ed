//! # Wire Frames
//!
//! Outbound commands are `{id, method, params}` text frames. Inbound frames are
//! either replies (`{id, result}` / `{id, error: {message, code}}`) or
//! unsolicited events (`{method, params}` with no id).
//!
//! Decoding here is strict: anything that does not match one of those shapes is
//! reported as [`BridgeError::MalformedFrame`] and the caller decides whether to
//! log and move on. Tolerant decoding lives at the ingestion boundary only.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BridgeError, BridgeResult, RemoteError};

/// An outbound command frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandFrame {
    /// Correlation id, unique for the lifetime of the correlator.
    pub id: u64,
    /// Remote method name, e.g. `Runtime.evaluate`.
    pub method: String,
    /// Method parameters; always an object on the wire.
    pub params: Value,
}

impl CommandFrame {
    /// Serializes the frame into the text payload written to the socket.
    pub fn to_text(&self) -> BridgeResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Reply to the command with the given id.
    Reply {
        /// Correlation id echoed by the host.
        id: u64,
        /// `result` on success, `error` on failure.
        outcome: Result<Value, RemoteError>,
    },
    /// Unsolicited event.
    Event {
        /// Event name, e.g. `Runtime.bindingCalled`.
        method: String,
        /// Event parameters (`Value::Null` when absent).
        params: Value,
    },
}

impl InboundFrame {
    /// Parses one text frame.
    pub fn parse(text: &str) -> BridgeResult<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| BridgeError::MalformedFrame(format!("invalid json: {e}")))?;
        Self::from_value(value)
    }

    /// Classifies an already-parsed JSON document.
    pub fn from_value(mut value: Value) -> BridgeResult<Self> {
        let obj = value
            .as_object_mut()
            .ok_or_else(|| BridgeError::MalformedFrame("frame is not an object".to_string()))?;

        if let Some(raw_id) = obj.get("id") {
            let id = raw_id
                .as_u64()
                .ok_or_else(|| BridgeError::MalformedFrame(format!("non-integer id {raw_id}")))?;

            if let Some(error) = obj.remove("error") {
                let remote = parse_remote_error(error)
                    .ok_or_else(|| BridgeError::MalformedFrame(format!("reply #{id} has unreadable error")))?;
                return Ok(InboundFrame::Reply { id, outcome: Err(remote) });
            }
            if let Some(result) = obj.remove("result") {
                return Ok(InboundFrame::Reply { id, outcome: Ok(result) });
            }
            return Err(BridgeError::MalformedFrame(format!(
                "reply #{id} carries neither result nor error"
            )));
        }

        if let Some(method) = obj.get("method").and_then(Value::as_str) {
            let method = method.to_string();
            let params = obj.remove("params").unwrap_or(Value::Null);
            return Ok(InboundFrame::Event { method, params });
        }

        Err(BridgeError::MalformedFrame("frame has neither id nor method".to_string()))
    }
}

/// Reads `{message, code}`; the host sometimes sends a bare string instead.
fn parse_remote_error(error: Value) -> Option<RemoteError> {
    match error {
        Value::String(message) => Some(RemoteError::new(message, None)),
        Value::Object(map) => {
            let message = map
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let code = map.get("code").and_then(Value::as_i64);
            Some(RemoteError::new(message, code))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_frame_serializes_flat() {
        let frame = CommandFrame {
            id: 7,
            method: "Runtime.evaluate".to_string(),
            params: json!({"expression": "1+1"}),
        };
        let text = frame.to_text().unwrap();
        let back: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(back, json!({"id": 7, "method": "Runtime.evaluate", "params": {"expression": "1+1"}}));
    }

    #[test]
    fn parses_result_and_error_replies() {
        let ok = InboundFrame::parse(r#"{"id":3,"result":{"value":1}}"#).unwrap();
        assert_eq!(ok, InboundFrame::Reply { id: 3, outcome: Ok(json!({"value": 1})) });

        let err = InboundFrame::parse(r#"{"id":4,"error":{"message":"nope","code":-32000}}"#).unwrap();
        assert_eq!(
            err,
            InboundFrame::Reply { id: 4, outcome: Err(RemoteError::new("nope", Some(-32000))) }
        );
    }

    #[test]
    fn parses_events() {
        let ev = InboundFrame::parse(r#"{"method":"Runtime.bindingCalled","params":{"name":"x"}}"#).unwrap();
        assert_eq!(
            ev,
            InboundFrame::Event { method: "Runtime.bindingCalled".to_string(), params: json!({"name": "x"}) }
        );
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(matches!(InboundFrame::parse("not json"), Err(BridgeError::MalformedFrame(_))));
        assert!(matches!(InboundFrame::parse("[1,2]"), Err(BridgeError::MalformedFrame(_))));
        assert!(matches!(InboundFrame::parse(r#"{"id":"abc","result":{}}"#), Err(BridgeError::MalformedFrame(_))));
        assert!(matches!(InboundFrame::parse(r#"{"id":9}"#), Err(BridgeError::MalformedFrame(_))));
        assert!(matches!(InboundFrame::parse(r#"{"foo":1}"#), Err(BridgeError::MalformedFrame(_))));
    }
}
