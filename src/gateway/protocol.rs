//! Gateway protocol state machine, free of I/O.
//!
//! The session driver feeds it every inbound frame and every heartbeat tick and
//! executes the actions it returns. Keeping the handshake here lets it be tested
//! without a socket.

use serde_json::Value;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::events::{RawEvent, SessionIdentity};
use super::frames::{GatewayFrame, IdentifyInfo};
use super::message::PlatformMessage;
use crate::constants::{dispatch, opcodes};

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolAction {
    Send(GatewayFrame),
    /// (Re)start the heartbeat timer with the server-provided interval
    StartHeartbeat(Duration),
    Ready(SessionIdentity),
    Dispatch(RawEvent),
    /// Tear the connection down and reconnect from scratch
    Reconnect { reason: String },
}

#[derive(Debug)]
pub struct GatewayProtocol {
    identify: IdentifyInfo,
    sequence: Option<u64>,
    awaiting_ack: bool,
    identified: bool,
    session: Option<SessionIdentity>,
}

impl GatewayProtocol {
    pub fn new(identify: IdentifyInfo) -> Self {
        Self {
            identify,
            sequence: None,
            awaiting_ack: false,
            identified: false,
            session: None,
        }
    }

    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    pub fn session(&self) -> Option<&SessionIdentity> {
        self.session.as_ref()
    }

    pub fn handle_frame(&mut self, frame: GatewayFrame) -> Vec<ProtocolAction> {
        if let Some(sequence) = frame.s {
            self.sequence = Some(sequence);
        }

        match frame.op {
            opcodes::HELLO => self.handle_hello(&frame),
            opcodes::HEARTBEAT_ACK => {
                self.awaiting_ack = false;
                trace!("💓 GATEWAY: Heartbeat acknowledged");
                Vec::new()
            }
            opcodes::HEARTBEAT => {
                // Server-requested heartbeat goes out immediately
                vec![ProtocolAction::Send(GatewayFrame::heartbeat(self.sequence))]
            }
            opcodes::RECONNECT => vec![ProtocolAction::Reconnect {
                reason: "server requested reconnect".to_string(),
            }],
            opcodes::INVALID_SESSION => vec![ProtocolAction::Reconnect {
                reason: "invalid session".to_string(),
            }],
            opcodes::DISPATCH => self.handle_dispatch(frame),
            other => {
                trace!(op = other, "GATEWAY: Ignoring opcode");
                Vec::new()
            }
        }
    }

    fn handle_hello(&mut self, frame: &GatewayFrame) -> Vec<ProtocolAction> {
        let Some(interval_ms) = frame.heartbeat_interval_ms().filter(|ms| *ms > 0) else {
            return vec![ProtocolAction::Reconnect {
                reason: "hello without heartbeat interval".to_string(),
            }];
        };

        let mut actions = vec![ProtocolAction::StartHeartbeat(Duration::from_millis(interval_ms))];
        if !self.identified {
            self.identified = true;
            actions.push(ProtocolAction::Send(GatewayFrame::identify(&self.identify)));
            debug!(heartbeat_interval_ms = interval_ms, "🔐 GATEWAY: Hello received, identifying");
        }
        actions
    }

    fn handle_dispatch(&mut self, frame: GatewayFrame) -> Vec<ProtocolAction> {
        let event_type = frame.t.unwrap_or_default();
        match event_type.as_str() {
            dispatch::READY => {
                let Some(session_id) = frame.d.get("session_id").and_then(Value::as_str) else {
                    warn!("⚠️ GATEWAY: READY without session id");
                    return Vec::new();
                };
                let user = frame.d.get("user");
                let identity = SessionIdentity {
                    session_id: session_id.to_string(),
                    user_id: user
                        .and_then(|u| u.get("id"))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    username: user
                        .and_then(|u| u.get("username"))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                };
                self.session = Some(identity.clone());
                vec![ProtocolAction::Ready(identity)]
            }
            dispatch::MESSAGE_CREATE | dispatch::MESSAGE_UPDATE => {
                match serde_json::from_value::<PlatformMessage>(frame.d) {
                    Ok(message) if event_type == dispatch::MESSAGE_CREATE => {
                        vec![ProtocolAction::Dispatch(RawEvent::MessageCreate(message))]
                    }
                    Ok(message) => vec![ProtocolAction::Dispatch(RawEvent::MessageUpdate(message))],
                    Err(e) => {
                        warn!(event_type = %event_type, error = %e, "⚠️ GATEWAY: Dropping malformed message payload");
                        Vec::new()
                    }
                }
            }
            _ => vec![ProtocolAction::Dispatch(RawEvent::Other { event_type })],
        }
    }

    /// Heartbeat timer fired. An outstanding unacknowledged heartbeat means the
    /// connection is a zombie.
    pub fn heartbeat_tick(&mut self) -> ProtocolAction {
        if self.awaiting_ack {
            return ProtocolAction::Reconnect {
                reason: "heartbeat not acknowledged".to_string(),
            };
        }
        self.awaiting_ack = true;
        ProtocolAction::Send(GatewayFrame::heartbeat(self.sequence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn protocol() -> GatewayProtocol {
        GatewayProtocol::new(IdentifyInfo {
            token: "token".into(),
            intents: 33281,
        })
    }

    fn frame(value: serde_json::Value) -> GatewayFrame {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_hello_starts_heartbeat_and_identifies_once() {
        let mut protocol = protocol();
        let actions = protocol.handle_frame(frame(json!({"op": 10, "d": {"heartbeat_interval": 1000}})));
        assert_eq!(actions[0], ProtocolAction::StartHeartbeat(Duration::from_secs(1)));
        assert!(matches!(&actions[1], ProtocolAction::Send(f) if f.op == opcodes::IDENTIFY));

        let again = protocol.handle_frame(frame(json!({"op": 10, "d": {"heartbeat_interval": 1000}})));
        assert_eq!(again.len(), 1);
    }

    #[test]
    fn test_ready_captures_session() {
        let mut protocol = protocol();
        let actions = protocol.handle_frame(frame(json!({
            "op": 0, "s": 1, "t": "READY",
            "d": {"session_id": "abc", "user": {"id": "42", "username": "relay"}}
        })));
        let ProtocolAction::Ready(identity) = &actions[0] else {
            panic!("expected ready, got {actions:?}");
        };
        assert_eq!(identity.session_id, "abc");
        assert_eq!(identity.username.as_deref(), Some("relay"));
        assert_eq!(protocol.sequence(), Some(1));
        assert!(protocol.session().is_some());
    }

    #[test]
    fn test_heartbeat_echoes_latest_sequence() {
        let mut protocol = protocol();
        protocol.handle_frame(frame(json!({"op": 0, "s": 7, "t": "TYPING_START", "d": {}})));
        let ProtocolAction::Send(heartbeat) = protocol.heartbeat_tick() else {
            panic!("expected heartbeat");
        };
        assert_eq!(heartbeat.d, json!(7));
    }

    #[test]
    fn test_missing_ack_is_zombie() {
        let mut protocol = protocol();
        assert!(matches!(protocol.heartbeat_tick(), ProtocolAction::Send(_)));
        assert!(matches!(protocol.heartbeat_tick(), ProtocolAction::Reconnect { .. }));

        let mut acked = self::protocol();
        acked.heartbeat_tick();
        acked.handle_frame(frame(json!({"op": 11})));
        assert!(matches!(acked.heartbeat_tick(), ProtocolAction::Send(_)));
    }

    #[test]
    fn test_message_dispatch_and_unknown_events() {
        let mut protocol = protocol();
        let actions = protocol.handle_frame(frame(json!({
            "op": 0, "s": 2, "t": "MESSAGE_CREATE",
            "d": {"id": "M1", "channel_id": "C1", "nonce": "J1", "content": "**fox** (Waiting to start)"}
        })));
        assert!(matches!(&actions[0], ProtocolAction::Dispatch(RawEvent::MessageCreate(m)) if m.id == "M1"));

        let other = protocol.handle_frame(frame(json!({"op": 0, "s": 3, "t": "PRESENCE_UPDATE", "d": {}})));
        assert!(matches!(&other[0], ProtocolAction::Dispatch(RawEvent::Other { event_type }) if event_type == "PRESENCE_UPDATE"));

        // Malformed payload is dropped
        let dropped = protocol.handle_frame(frame(json!({"op": 0, "s": 4, "t": "MESSAGE_UPDATE", "d": {"content": 5}})));
        assert!(dropped.is_empty());
    }

    #[test]
    fn test_server_requested_reconnect() {
        let mut protocol = protocol();
        assert!(matches!(
            protocol.handle_frame(frame(json!({"op": 7}))).as_slice(),
            [ProtocolAction::Reconnect { .. }]
        ));
        assert!(matches!(
            protocol.handle_frame(frame(json!({"op": 9, "d": false}))).as_slice(),
            [ProtocolAction::Reconnect { .. }]
        ));
    }
}
