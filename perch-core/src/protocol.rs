//! Per-connection wire state machine.
//!
//! Host-driven like the rest of this crate: the host feeds raw frame text via
//! [`ProtocolState::on_frame`] and keep-alive ticks via
//! [`ProtocolState::on_keepalive`], and performs the returned [`WireAction`]s.

use std::time::Duration;

use serde_json::Value;

use crate::envelope::{self, DataPayload};
use crate::frame::{self, Frame, FrameError};

/// Keep-alive period assumed until the open frame supplies one.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(20);

/// Maximum inbound sequence backlog tolerated before an ack is forced.
pub const MAX_UNACKED: u64 = 10;

/// Connection lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Handshaking,
    Open,
    Closing,
    Closed,
}

/// Connection-fatal protocol failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("last ping remained unanswered")]
    PingTimeout,
    #[error("connection closed remotely")]
    RemoteClose,
}

/// Action for the host to perform after feeding a frame or a tick.
#[derive(Debug, PartialEq)]
pub enum WireAction {
    /// Write this frame text to the transport.
    Send(String),
    /// Hand these (target, data) messages to the dispatch layer.
    Dispatch(Vec<(String, Value)>),
    /// The server requested a graceful close.
    Close,
    /// Fatal; surface to every blocked caller and tear the connection down.
    Fatal(ProtocolError),
}

/// Mutable per-connection wire state. Owned by the connection task; callers
/// outside the loop read it only through the owning connection's accessors.
#[derive(Debug)]
pub struct ProtocolState {
    phase: Phase,
    max_seen_id: u64,
    last_acked_id: u64,
    send_counter: u64,
    ping_interval: Duration,
    awaiting_pong: bool,
    unacked_window: u64,
    session: Option<Value>,
}

impl ProtocolState {
    pub fn new() -> Self {
        Self::with_window(MAX_UNACKED)
    }

    pub fn with_window(unacked_window: u64) -> Self {
        Self {
            phase: Phase::Disconnected,
            max_seen_id: 0,
            last_acked_id: 0,
            send_counter: 1,
            ping_interval: DEFAULT_PING_INTERVAL,
            awaiting_pong: false,
            unacked_window: unacked_window.max(1),
            session: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn connected(&self) -> bool {
        self.phase == Phase::Open
    }

    pub fn ping_interval(&self) -> Duration {
        self.ping_interval
    }

    pub fn max_seen_id(&self) -> u64 {
        self.max_seen_id
    }

    pub fn last_acked_id(&self) -> u64 {
        self.last_acked_id
    }

    pub fn session(&self) -> Option<&Value> {
        self.session.as_ref()
    }

    /// Disconnected → Handshaking, when a connect is scheduled.
    pub fn begin_handshake(&mut self) {
        if self.phase == Phase::Disconnected {
            self.phase = Phase::Handshaking;
        }
    }

    /// Handshaking → Open, when the transport reports the handshake done.
    pub fn on_transport_open(&mut self) {
        if self.phase == Phase::Handshaking {
            self.phase = Phase::Open;
        }
    }

    /// Open → Closing, when we initiate a graceful close.
    pub fn begin_close(&mut self) {
        if matches!(self.phase, Phase::Open | Phase::Handshaking) {
            self.phase = Phase::Closing;
        }
    }

    /// Terminal; any phase may collapse here.
    pub fn mark_closed(&mut self) {
        self.phase = Phase::Closed;
    }

    /// Feed one inbound frame. `Err` means the single frame was malformed and
    /// must be dropped; the connection continues.
    pub fn on_frame(&mut self, text: &str) -> Result<Vec<WireAction>, FrameError> {
        match frame::decode(text)? {
            Frame::Open(info) => {
                self.ping_interval = info.ping_interval;
                Ok(vec![])
            }
            Frame::Close => {
                self.phase = Phase::Closed;
                Ok(vec![WireAction::Fatal(ProtocolError::RemoteClose)])
            }
            Frame::Pong => {
                self.awaiting_pong = false;
                Ok(vec![])
            }
            Frame::Noop => Ok(vec![WireAction::Send(frame::encode(&Frame::Upgrade))]),
            // We never initiate the upgrade dance; inbound ping/upgrade frames
            // carry nothing actionable for a client.
            Frame::Ping | Frame::Upgrade => Ok(vec![]),
            Frame::Message(data) => self.on_data(&data),
        }
    }

    fn on_data(&mut self, data: &Value) -> Result<Vec<WireAction>, FrameError> {
        let payload = match envelope::parse_data(data) {
            Ok(p) => p,
            // Unrecognized payload shapes are dropped per-frame.
            Err(_) => return Ok(vec![]),
        };
        match payload {
            DataPayload::Session(v) => {
                self.session = Some(v);
                Ok(vec![])
            }
            DataPayload::CloseRequest => {
                self.phase = Phase::Closing;
                Ok(vec![WireAction::Close])
            }
            DataPayload::Ignored => Ok(vec![]),
            DataPayload::Bundle { messages, last_seq } => {
                let mut actions = Vec::with_capacity(2);
                if last_seq > self.max_seen_id {
                    self.max_seen_id = last_seq;
                }
                if self.max_seen_id - self.last_acked_id >= self.unacked_window {
                    actions.push(WireAction::Send(self.ack_frame()));
                }
                if !messages.is_empty() {
                    actions.push(WireAction::Dispatch(messages));
                }
                Ok(actions)
            }
        }
    }

    /// One keep-alive tick. Emits a ping and the periodic ack (which doubles
    /// as a heartbeat even with an empty backlog); errors when the previous
    /// ping went unanswered.
    pub fn on_keepalive(&mut self) -> Result<Vec<WireAction>, ProtocolError> {
        if self.phase != Phase::Open {
            return Ok(vec![]);
        }
        if self.awaiting_pong {
            self.phase = Phase::Closed;
            return Err(ProtocolError::PingTimeout);
        }
        self.awaiting_pong = true;
        Ok(vec![
            WireAction::Send(frame::encode(&Frame::Ping)),
            WireAction::Send(self.ack_frame()),
        ])
    }

    /// Encode an application call, consuming one sequence number.
    pub fn encode_call(&mut self, method: &str, args: &[Value]) -> String {
        let seq = self.send_counter;
        self.send_counter += 1;
        frame::encode(&Frame::Message(envelope::encode_call(
            self.max_seen_id,
            seq,
            method,
            args,
        )))
    }

    /// Encode the graceful-shutdown envelope, consuming one sequence number.
    pub fn encode_close_call(&mut self) -> String {
        let seq = self.send_counter;
        self.send_counter += 1;
        frame::encode(&Frame::Message(envelope::encode_close(self.max_seen_id, seq)))
    }

    /// Acks are monotonic: this advances `last_acked_id` to `max_seen_id`,
    /// never past it and never backwards.
    fn ack_frame(&mut self) -> String {
        self.last_acked_id = self.max_seen_id;
        frame::encode(&Frame::Message(envelope::encode_ack(self.last_acked_id)))
    }
}

impl Default for ProtocolState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open_state() -> ProtocolState {
        let mut s = ProtocolState::new();
        s.begin_handshake();
        s.on_transport_open();
        s
    }

    fn bundle_frame(target: &str, data: Value, seq: u64) -> String {
        format!("4{}", json!([0, [[0, [target, data]], seq]]))
    }

    #[test]
    fn lifecycle_phases() {
        let mut s = ProtocolState::new();
        assert_eq!(s.phase(), Phase::Disconnected);
        s.begin_handshake();
        assert_eq!(s.phase(), Phase::Handshaking);
        assert!(!s.connected());
        s.on_transport_open();
        assert_eq!(s.phase(), Phase::Open);
        assert!(s.connected());
        s.begin_close();
        assert_eq!(s.phase(), Phase::Closing);
        s.mark_closed();
        assert_eq!(s.phase(), Phase::Closed);
    }

    #[test]
    fn open_frame_adjusts_ping_interval() {
        let mut s = open_state();
        s.on_frame("0{\"pingInterval\":5000}").unwrap();
        assert_eq!(s.ping_interval(), Duration::from_secs(5));
    }

    #[test]
    fn close_frame_is_fatal() {
        let mut s = open_state();
        let actions = s.on_frame("1").unwrap();
        assert!(matches!(
            actions.as_slice(),
            [WireAction::Fatal(ProtocolError::RemoteClose)]
        ));
        assert_eq!(s.phase(), Phase::Closed);
    }

    #[test]
    fn noop_triggers_reciprocal_upgrade() {
        let mut s = open_state();
        let actions = s.on_frame("6").unwrap();
        assert_eq!(actions, vec![WireAction::Send("5".into())]);
    }

    #[test]
    fn malformed_frame_is_dropped_not_fatal() {
        let mut s = open_state();
        assert!(s.on_frame("4{bad").is_err());
        assert!(s.connected());
    }

    #[test]
    fn session_object_is_recorded() {
        let mut s = open_state();
        s.on_frame("4{\"session\":\"xyz\"}").unwrap();
        assert_eq!(s.session().unwrap()["session"], "xyz");
    }

    #[test]
    fn ack_never_exceeds_max_seen() {
        let mut s = open_state();
        for seq in 1..=5u64 {
            s.on_frame(&bundle_frame("time", json!(seq * 1000), seq)).unwrap();
            assert!(s.last_acked_id() <= s.max_seen_id());
        }
    }

    #[test]
    fn forced_ack_once_window_is_reached() {
        // Window of 2, frames with seqs 1, 2, 3. The ack for id 2 must go
        // out when frame 2 arrives, before frame 3.
        let mut s = ProtocolState::with_window(2);
        s.begin_handshake();
        s.on_transport_open();

        let a1 = s.on_frame(&bundle_frame("chat", json!({}), 1)).unwrap();
        assert!(matches!(a1.as_slice(), [WireAction::Dispatch(_)]));

        let a2 = s.on_frame(&bundle_frame("chat", json!({}), 2)).unwrap();
        assert_eq!(a2[0], WireAction::Send("4[2]".into()));
        assert_eq!(s.last_acked_id(), 2);

        let a3 = s.on_frame(&bundle_frame("chat", json!({}), 3)).unwrap();
        assert!(matches!(a3.as_slice(), [WireAction::Dispatch(_)]));
        assert_eq!(s.max_seen_id(), 3);
        assert_eq!(s.last_acked_id(), 2);
    }

    #[test]
    fn gap_never_exceeds_window() {
        let mut s = ProtocolState::with_window(3);
        s.begin_handshake();
        s.on_transport_open();
        for seq in 1..=20u64 {
            s.on_frame(&bundle_frame("time", json!(0), seq)).unwrap();
            assert!(s.max_seen_id() - s.last_acked_id() < 3);
        }
    }

    #[test]
    fn stale_sequence_does_not_regress() {
        let mut s = open_state();
        s.on_frame(&bundle_frame("time", json!(0), 8)).unwrap();
        s.on_frame(&bundle_frame("time", json!(0), 3)).unwrap();
        assert_eq!(s.max_seen_id(), 8);
    }

    #[test]
    fn keepalive_pings_and_acks() {
        let mut s = open_state();
        s.on_frame(&bundle_frame("time", json!(0), 4)).unwrap();
        let actions = s.on_keepalive().unwrap();
        assert_eq!(
            actions,
            vec![WireAction::Send("2".into()), WireAction::Send("4[4]".into())]
        );
        assert_eq!(s.last_acked_id(), 4);
    }

    #[test]
    fn unanswered_ping_is_fatal_on_next_tick() {
        let mut s = open_state();
        s.on_keepalive().unwrap();
        assert!(matches!(s.on_keepalive(), Err(ProtocolError::PingTimeout)));
        assert_eq!(s.phase(), Phase::Closed);
    }

    #[test]
    fn pong_rearms_the_keepalive() {
        let mut s = open_state();
        s.on_keepalive().unwrap();
        s.on_frame("3").unwrap();
        assert!(s.on_keepalive().is_ok());
    }

    #[test]
    fn keepalive_is_a_noop_when_not_open() {
        let mut s = ProtocolState::new();
        assert!(s.on_keepalive().unwrap().is_empty());
    }

    #[test]
    fn call_sequence_counter_is_monotonic() {
        let mut s = open_state();
        s.on_frame(&bundle_frame("time", json!(0), 7)).unwrap();
        let c1 = s.encode_call("chat", &[json!("nick"), json!("hi")]);
        let c2 = s.encode_call("chat", &[json!("nick"), json!("again")]);
        assert_eq!(c1, format!("4{}", json!([7, [[0, ["call", {"fn": "chat", "args": ["nick", "hi"]}]], 1]])));
        assert_eq!(c2, format!("4{}", json!([7, [[0, ["call", {"fn": "chat", "args": ["nick", "again"]}]], 2]])));
    }

    #[test]
    fn close_call_consumes_a_sequence_number() {
        let mut s = open_state();
        let c = s.encode_close_call();
        assert_eq!(c, format!("4{}", json!([0, [[2], 1]])));
        let next = s.encode_call("report", &[]);
        assert!(next.contains("],2]"));
    }

    #[test]
    fn server_close_request() {
        let mut s = open_state();
        let actions = s.on_frame("4[2]").unwrap();
        assert_eq!(actions, vec![WireAction::Close]);
        assert_eq!(s.phase(), Phase::Closing);
    }
}
