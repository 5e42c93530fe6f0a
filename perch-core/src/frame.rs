//! Framing: one leading ASCII digit as the frame-type tag + optional JSON payload text.

use std::time::Duration;

use serde_json::Value;

/// One transport-level frame, decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Handshake info pushed by the server right after the transport opens.
    Open(HandshakeInfo),
    /// Server is tearing the connection down.
    Close,
    /// Keep-alive ping.
    Ping,
    /// Reply to a ping.
    Pong,
    /// Application data envelope (see the envelope module).
    Message(Value),
    /// Reciprocal frame sent in response to a noop.
    Upgrade,
    /// No-op; the peer expects an upgrade frame back.
    Noop,
}

/// Negotiated parameters carried by the open frame.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeInfo {
    pub ping_interval: Duration,
}

/// Error decoding a frame (empty input, unknown tag, or bad JSON payload).
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown frame tag '{0}'")]
    UnknownTag(char),
    #[error("bad frame payload: {0}")]
    BadPayload(#[from] serde_json::Error),
    #[error("open frame missing pingInterval")]
    MissingPingInterval,
}

/// Decode one frame from its text form.
pub fn decode(text: &str) -> Result<Frame, FrameError> {
    let mut chars = text.chars();
    let tag = chars.next().ok_or(FrameError::Empty)?;
    let rest = chars.as_str();
    match tag {
        '0' => {
            let v: Value = serde_json::from_str(rest)?;
            let ms = v
                .get("pingInterval")
                .and_then(Value::as_f64)
                .ok_or(FrameError::MissingPingInterval)?;
            Ok(Frame::Open(HandshakeInfo {
                ping_interval: Duration::from_millis(ms.max(0.0) as u64),
            }))
        }
        '1' => Ok(Frame::Close),
        '2' => Ok(Frame::Ping),
        '3' => Ok(Frame::Pong),
        '4' => Ok(Frame::Message(serde_json::from_str(rest)?)),
        '5' => Ok(Frame::Upgrade),
        '6' => Ok(Frame::Noop),
        other => Err(FrameError::UnknownTag(other)),
    }
}

/// Encode a frame into its text form. JSON payloads are compact.
pub fn encode(frame: &Frame) -> String {
    match frame {
        Frame::Open(info) => format!("0{{\"pingInterval\":{}}}", info.ping_interval.as_millis()),
        Frame::Close => "1".into(),
        Frame::Ping => "2".into(),
        Frame::Pong => "3".into(),
        Frame::Message(v) => format!("4{}", v),
        Frame::Upgrade => "5".into(),
        Frame::Noop => "6".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_open_frame() {
        let f = decode("0{\"pingInterval\":25000,\"pingTimeout\":60000}").unwrap();
        match f {
            Frame::Open(info) => assert_eq!(info.ping_interval, Duration::from_secs(25)),
            other => panic!("expected Open, got {other:?}"),
        }
    }

    #[test]
    fn decode_control_frames() {
        assert_eq!(decode("1").unwrap(), Frame::Close);
        assert_eq!(decode("2").unwrap(), Frame::Ping);
        assert_eq!(decode("3").unwrap(), Frame::Pong);
        assert_eq!(decode("5").unwrap(), Frame::Upgrade);
        assert_eq!(decode("6").unwrap(), Frame::Noop);
    }

    #[test]
    fn decode_data_frame() {
        let f = decode("4[0,[[0,[\"chat\",{}]],1]]").unwrap();
        assert!(matches!(f, Frame::Message(_)));
    }

    #[test]
    fn empty_and_unknown() {
        assert!(matches!(decode(""), Err(FrameError::Empty)));
        assert!(matches!(decode("9zzz"), Err(FrameError::UnknownTag('9'))));
    }

    #[test]
    fn malformed_payload_is_an_error_not_a_panic() {
        assert!(matches!(decode("4[not json"), Err(FrameError::BadPayload(_))));
        assert!(matches!(decode("0{}"), Err(FrameError::MissingPingInterval)));
    }

    #[test]
    fn encode_roundtrip_message() {
        let v = json!([3, [[0, ["chat", {"nick": "a"}]], 4]]);
        let text = encode(&Frame::Message(v.clone()));
        assert!(text.starts_with('4'));
        assert_eq!(decode(&text).unwrap(), Frame::Message(v));
    }

    #[test]
    fn encode_is_compact() {
        let text = encode(&Frame::Message(json!([1])));
        assert_eq!(text, "4[1]");
    }
}
