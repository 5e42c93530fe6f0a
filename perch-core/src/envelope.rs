//! Application envelope carried inside data frames.
//!
//! Outbound calls are `[ack_id, [[0, ["call", {"fn": m, "args": a}]], seq]]`;
//! inbound data is either a session object or a bundle of
//! `[[0, [target, data]], seq]` entries trailed by the peer's sequence id.

use serde_json::{json, Value};

/// Decoded payload of one inbound data frame.
#[derive(Debug, Clone, PartialEq)]
pub enum DataPayload {
    /// Session handshake object.
    Session(Value),
    /// Multiplexed application messages plus the highest sequence id seen.
    Bundle {
        messages: Vec<(String, Value)>,
        last_seq: u64,
    },
    /// `[2]`: the server asks us to close.
    CloseRequest,
    /// Recognized but carrying nothing actionable.
    Ignored,
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("bundle carries no trailing sequence id")]
    MissingSequence,
    #[error("unrecognized data payload shape")]
    Unrecognized,
}

/// Encode an application call envelope.
pub fn encode_call(ack_id: u64, seq: u64, method: &str, args: &[Value]) -> Value {
    json!([ack_id, [[0, ["call", {"fn": method, "args": args}]], seq]])
}

/// Encode the graceful-shutdown envelope.
pub fn encode_close(ack_id: u64, seq: u64) -> Value {
    json!([ack_id, [[2], seq]])
}

/// Encode a bare ack envelope.
pub fn encode_ack(ack_id: u64) -> Value {
    json!([ack_id])
}

/// Parse the payload of an inbound data frame.
pub fn parse_data(data: &Value) -> Result<DataPayload, EnvelopeError> {
    if data.is_object() {
        if data.get("session").is_some() {
            return Ok(DataPayload::Session(data.clone()));
        }
        return Err(EnvelopeError::Unrecognized);
    }
    let arr = match data.as_array() {
        Some(a) => a,
        None => return Err(EnvelopeError::Unrecognized),
    };
    if arr.len() > 1 {
        return parse_bundle(&arr[1..]);
    }
    match arr.first().and_then(Value::as_u64) {
        Some(2) => Ok(DataPayload::CloseRequest),
        // `[0]` is a server-side I/O hiccup; not fatal, nothing to deliver.
        _ => Ok(DataPayload::Ignored),
    }
}

fn parse_bundle(entries: &[Value]) -> Result<DataPayload, EnvelopeError> {
    let last_seq = entries
        .last()
        .and_then(Value::as_array)
        .and_then(|e| e.last())
        .and_then(Value::as_u64)
        .ok_or(EnvelopeError::MissingSequence)?;

    let mut messages = Vec::with_capacity(entries.len());
    for entry in entries {
        // Each entry is [[kind, [target, data]], seq]; malformed entries are
        // skipped, never fatal to the bundle.
        let item = match entry.as_array().and_then(|e| e.first()).and_then(Value::as_array) {
            Some(i) => i,
            None => continue,
        };
        match item.first().and_then(Value::as_u64) {
            // Kind 2 is a flush marker with nothing attached.
            Some(2) => continue,
            Some(0) => {}
            _ => continue,
        }
        let inner = match item.get(1).and_then(Value::as_array) {
            Some(i) => i,
            None => continue,
        };
        // Targets may be numeric error codes; normalize to a string key.
        let target = match inner.first() {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => continue,
        };
        let payload = inner.get(1).cloned().unwrap_or(Value::Null);
        messages.push((target, payload));
    }
    Ok(DataPayload::Bundle { messages, last_seq })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_envelope_shape() {
        let v = encode_call(7, 3, "chat", &[json!("nick"), json!("hello")]);
        assert_eq!(v, json!([7, [[0, ["call", {"fn": "chat", "args": ["nick", "hello"]}]], 3]]));
    }

    #[test]
    fn close_envelope_shape() {
        assert_eq!(encode_close(9, 4), json!([9, [[2], 4]]));
        assert_eq!(encode_ack(12), json!([12]));
    }

    #[test]
    fn session_object() {
        let p = parse_data(&json!({"session": "abc", "ack": 0})).unwrap();
        match p {
            DataPayload::Session(v) => assert_eq!(v["session"], "abc"),
            other => panic!("expected Session, got {other:?}"),
        }
    }

    #[test]
    fn bundle_with_two_messages() {
        let data = json!([
            0,
            [[0, ["chat", {"nick": "a"}]], 1],
            [[0, ["userCount", 4]], 2]
        ]);
        match parse_data(&data).unwrap() {
            DataPayload::Bundle { messages, last_seq } => {
                assert_eq!(last_seq, 2);
                assert_eq!(messages.len(), 2);
                assert_eq!(messages[0].0, "chat");
                assert_eq!(messages[1].0, "userCount");
                assert_eq!(messages[1].1, json!(4));
            }
            other => panic!("expected Bundle, got {other:?}"),
        }
    }

    #[test]
    fn numeric_error_target_becomes_string() {
        let data = json!([0, [[0, [429, {"info": 1}]], 5]]);
        match parse_data(&data).unwrap() {
            DataPayload::Bundle { messages, .. } => assert_eq!(messages[0].0, "429"),
            other => panic!("expected Bundle, got {other:?}"),
        }
    }

    #[test]
    fn flush_and_malformed_entries_are_skipped() {
        let data = json!([0, [[2], 1], ["garbage"], [[0, ["time", 1000]], 3]]);
        match parse_data(&data).unwrap() {
            DataPayload::Bundle { messages, last_seq } => {
                assert_eq!(last_seq, 3);
                assert_eq!(messages, vec![("time".to_string(), json!(1000))]);
            }
            other => panic!("expected Bundle, got {other:?}"),
        }
    }

    #[test]
    fn close_request_and_ignored() {
        assert_eq!(parse_data(&json!([2])).unwrap(), DataPayload::CloseRequest);
        assert_eq!(parse_data(&json!([0])).unwrap(), DataPayload::Ignored);
        assert_eq!(parse_data(&json!([])).unwrap(), DataPayload::Ignored);
    }

    #[test]
    fn unrecognized_shapes_error() {
        assert!(parse_data(&json!({"nope": 1})).is_err());
        assert!(parse_data(&json!("text")).is_err());
        assert!(matches!(
            parse_data(&json!([0, [[0, ["chat", {}]]]])),
            Err(EnvelopeError::MissingSequence)
        ));
    }
}
