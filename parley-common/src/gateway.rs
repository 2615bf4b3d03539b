//! Voice gateway messages
//!
//! Every frame on the signaling WebSocket is a JSON object of the form
//! `{"op": <int>, "d": <payload>}`. The opcode decides how `d` is read, so
//! messages are decoded in two steps: first into a raw envelope, then the
//! payload according to the opcode.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Opcodes
// =============================================================================

pub const OP_IDENTIFY: u8 = 0;
pub const OP_SELECT_PROTOCOL: u8 = 1;
pub const OP_READY: u8 = 2;
pub const OP_HEARTBEAT: u8 = 3;
pub const OP_SESSION_DESCRIPTION: u8 = 4;
pub const OP_SPEAKING: u8 = 5;
pub const OP_HEARTBEAT_ACK: u8 = 6;
pub const OP_HELLO: u8 = 8;
pub const OP_CLIENT_DISCONNECT: u8 = 13;

/// Speaking flag for normal microphone transmission
pub const SPEAKING_MICROPHONE: u8 = 1 << 0;

/// Transport protocol name used in `SelectProtocol`
pub const PROTOCOL_UDP: &str = "udp";

/// The only encryption mode this client implements
pub const MODE_XCHACHA20_POLY1305: &str = "aead_xchacha20_poly1305";

// =============================================================================
// Payloads
// =============================================================================

/// Authenticate the voice session (client → relay)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identify {
    pub server_id: String,
    pub user_id: String,
    pub session_id: String,
    pub token: String,
}

/// Local address and chosen mode inside `SelectProtocol`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolData {
    pub address: String,
    pub port: u16,
    pub mode: String,
}

/// Tell the relay which transport and cipher we picked (client → relay)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectProtocol {
    pub protocol: String,
    pub data: ProtocolData,
}

impl SelectProtocol {
    /// UDP selection for the given discovered address
    pub fn udp(address: String, port: u16, mode: &str) -> Self {
        Self {
            protocol: PROTOCOL_UDP.to_string(),
            data: ProtocolData {
                address,
                port,
                mode: mode.to_string(),
            },
        }
    }
}

/// Relay media endpoint and our SSRC (relay → client)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ready {
    pub ssrc: u32,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub modes: Vec<String>,
}

impl Ready {
    /// Pick the first offered mode we support
    pub fn select_mode(&self) -> Option<&str> {
        self.modes
            .iter()
            .map(String::as_str)
            .find(|mode| *mode == MODE_XCHACHA20_POLY1305)
    }
}

/// Negotiated cipher and key (relay → client)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub mode: String,
    pub secret_key: [u8; 32],
}

/// Speaking state of one SSRC (both directions)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Speaking {
    pub speaking: u8,
    #[serde(default)]
    pub delay: u32,
    pub ssrc: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Heartbeat interval announced on connect (relay → client)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    /// Interval in milliseconds; relays send this as a float
    pub heartbeat_interval: f64,
}

/// Another participant left the call (relay → client)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDisconnect {
    pub user_id: String,
}

// =============================================================================
// Envelope
// =============================================================================

#[derive(Serialize, Deserialize)]
struct RawMessage {
    op: u8,
    #[serde(default)]
    d: Value,
}

/// A decoded voice gateway message
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayMessage {
    Identify(Identify),
    SelectProtocol(SelectProtocol),
    Ready(Ready),
    /// Nonce, echoed back by the relay in `HeartbeatAck`
    Heartbeat(u64),
    SessionDescription(SessionDescription),
    Speaking(Speaking),
    HeartbeatAck(u64),
    Hello(Hello),
    ClientDisconnect(ClientDisconnect),
    /// Any opcode this client does not handle
    Unknown { op: u8, d: Value },
}

impl GatewayMessage {
    /// Opcode of this message
    pub fn op(&self) -> u8 {
        match self {
            GatewayMessage::Identify(_) => OP_IDENTIFY,
            GatewayMessage::SelectProtocol(_) => OP_SELECT_PROTOCOL,
            GatewayMessage::Ready(_) => OP_READY,
            GatewayMessage::Heartbeat(_) => OP_HEARTBEAT,
            GatewayMessage::SessionDescription(_) => OP_SESSION_DESCRIPTION,
            GatewayMessage::Speaking(_) => OP_SPEAKING,
            GatewayMessage::HeartbeatAck(_) => OP_HEARTBEAT_ACK,
            GatewayMessage::Hello(_) => OP_HELLO,
            GatewayMessage::ClientDisconnect(_) => OP_CLIENT_DISCONNECT,
            GatewayMessage::Unknown { op, .. } => *op,
        }
    }

    /// Encode to the `{"op", "d"}` JSON text form
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let d = match self {
            GatewayMessage::Identify(p) => serde_json::to_value(p)?,
            GatewayMessage::SelectProtocol(p) => serde_json::to_value(p)?,
            GatewayMessage::Ready(p) => serde_json::to_value(p)?,
            GatewayMessage::Heartbeat(nonce) => Value::from(*nonce),
            GatewayMessage::SessionDescription(p) => serde_json::to_value(p)?,
            GatewayMessage::Speaking(p) => serde_json::to_value(p)?,
            GatewayMessage::HeartbeatAck(nonce) => Value::from(*nonce),
            GatewayMessage::Hello(p) => serde_json::to_value(p)?,
            GatewayMessage::ClientDisconnect(p) => serde_json::to_value(p)?,
            GatewayMessage::Unknown { d, .. } => d.clone(),
        };
        serde_json::to_string(&RawMessage { op: self.op(), d })
    }

    /// Decode a text frame
    ///
    /// Unknown opcodes decode successfully as `Unknown`; a known opcode with a
    /// malformed payload is an error.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let raw: RawMessage = serde_json::from_str(text)?;
        let message = match raw.op {
            OP_IDENTIFY => GatewayMessage::Identify(serde_json::from_value(raw.d)?),
            OP_SELECT_PROTOCOL => GatewayMessage::SelectProtocol(serde_json::from_value(raw.d)?),
            OP_READY => GatewayMessage::Ready(serde_json::from_value(raw.d)?),
            OP_HEARTBEAT => GatewayMessage::Heartbeat(nonce_from(&raw.d)),
            OP_SESSION_DESCRIPTION => {
                GatewayMessage::SessionDescription(serde_json::from_value(raw.d)?)
            }
            OP_SPEAKING => GatewayMessage::Speaking(serde_json::from_value(raw.d)?),
            OP_HEARTBEAT_ACK => GatewayMessage::HeartbeatAck(nonce_from(&raw.d)),
            OP_HELLO => GatewayMessage::Hello(serde_json::from_value(raw.d)?),
            OP_CLIENT_DISCONNECT => {
                GatewayMessage::ClientDisconnect(serde_json::from_value(raw.d)?)
            }
            op => GatewayMessage::Unknown { op, d: raw.d },
        };
        Ok(message)
    }
}

/// Read a heartbeat nonce from either a bare number or `{"nonce": n}`
fn nonce_from(d: &Value) -> u64 {
    d.as_u64()
        .or_else(|| d.get("nonce").and_then(Value::as_u64))
        .unwrap_or(0)
}
