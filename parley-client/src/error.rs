//! Error type for the voice engine

use parley_common::WireError;
use thiserror::Error;

/// Errors raised by signaling, transport, codecs and devices
#[derive(Debug, Error)]
pub enum VoiceError {
    /// Relay sent something we could not act on
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid gateway message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed packet: {0}")]
    Wire(#[from] WireError),

    /// Authentication failed on an incoming packet, or sealing failed
    #[error("packet failed to decrypt")]
    Crypto,

    /// A send was attempted before the session key arrived
    #[error("no session key installed")]
    NoSecretKey,

    /// The relay offered no encryption mode we implement
    #[error("relay offered no supported encryption mode")]
    UnsupportedEncryption,

    #[error("no reply to IP discovery")]
    DiscoveryTimeout,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("audio device error: {0}")]
    Device(String),

    /// The transport was used before `connect` or after `stop`
    #[error("transport is not connected")]
    NotConnected,

    /// The UDP receive thread hit a socket error it cannot recover from
    #[error("voice transport failed: {0}")]
    TransportFailed(String),

    #[error("session closed")]
    Disconnected,
}

impl From<tokio_tungstenite::tungstenite::Error> for VoiceError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        VoiceError::WebSocket(Box::new(e))
    }
}

impl From<opus::Error> for VoiceError {
    fn from(e: opus::Error) -> Self {
        VoiceError::Codec(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_error_converts() {
        let err: VoiceError = WireError::InvalidAddress.into();
        assert!(matches!(err, VoiceError::Wire(WireError::InvalidAddress)));
        assert_eq!(
            err.to_string(),
            "malformed packet: invalid address in discovery reply"
        );
    }

    #[test]
    fn test_json_error_converts() {
        let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: VoiceError = parse.into();
        assert!(err.to_string().starts_with("invalid gateway message"));
    }
}
