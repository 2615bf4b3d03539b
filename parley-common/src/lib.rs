//! Parley Common Library
//!
//! Wire formats shared by the Parley voice transport: the voice gateway's
//! JSON messages, the RTP header and packetizer, and the UDP discovery packet.

pub mod audio;
mod error;
pub mod discovery;
pub mod gateway;
pub mod rtp;

pub use error::WireError;

/// Voice gateway protocol version requested in the connection URL
pub const GATEWAY_VERSION: u8 = 4;

/// Build the WebSocket URL for a relay endpoint
///
/// Endpoints are handed out as bare `host[:port]` strings; a scheme is only
/// added when missing so that tests can point at a plain `ws://` listener.
pub fn gateway_url(endpoint: &str) -> String {
    let endpoint = endpoint.trim_end_matches('/');
    if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
        format!("{}/?v={}", endpoint, GATEWAY_VERSION)
    } else {
        format!("wss://{}/?v={}", endpoint, GATEWAY_VERSION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_url_adds_scheme() {
        assert_eq!(
            gateway_url("relay.example.com:443"),
            "wss://relay.example.com:443/?v=4"
        );
    }

    #[test]
    fn test_gateway_url_keeps_scheme() {
        assert_eq!(gateway_url("ws://127.0.0.1:9000/"), "ws://127.0.0.1:9000/?v=4");
    }
}
