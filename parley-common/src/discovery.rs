//! UDP IP discovery packets
//!
//! Before the relay accepts media it needs to learn the client's public
//! address. The client sends a fixed 74-byte probe and the relay echoes back
//! the address and port it observed.
//!
//! ```text
//! +--------+--------+---------------+-----------------------+--------+
//! | Type   | Length | SSRC          | Address (NUL padded)  | Port   |
//! | 2 B    | 2 B    | 4 B           | 64 B                  | 2 B    |
//! +--------+--------+---------------+-----------------------+--------+
//! ```

use crate::WireError;

/// Total size of a discovery packet in bytes
pub const DISCOVERY_PACKET_SIZE: usize = 74;

/// Value of the length field (packet size minus type and length)
pub const DISCOVERY_LENGTH: u16 = 70;

/// Type marker of an outgoing probe
pub const DISCOVERY_REQUEST: u16 = 0x0001;

/// Type marker of the relay's reply
pub const DISCOVERY_RESPONSE: u16 = 0x0002;

const ADDRESS_START: usize = 8;
const ADDRESS_END: usize = 72;

/// Address and port the relay observed for us
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredAddress {
    pub ip: String,
    pub port: u16,
}

/// Build the probe packet for the given SSRC
pub fn build_request(ssrc: u32) -> [u8; DISCOVERY_PACKET_SIZE] {
    let mut packet = [0u8; DISCOVERY_PACKET_SIZE];
    packet[0..2].copy_from_slice(&DISCOVERY_REQUEST.to_be_bytes());
    packet[2..4].copy_from_slice(&DISCOVERY_LENGTH.to_be_bytes());
    packet[4..8].copy_from_slice(&ssrc.to_be_bytes());
    packet
}

/// Parse the relay's reply
///
/// # Returns
///
/// The observed address, or a `WireError` if the packet is short, carries the
/// wrong marker, or holds no readable address.
pub fn parse_response(data: &[u8]) -> Result<DiscoveredAddress, WireError> {
    if data.len() < DISCOVERY_PACKET_SIZE {
        return Err(WireError::TooShort {
            len: data.len(),
            min: DISCOVERY_PACKET_SIZE,
        });
    }

    let marker = u16::from_be_bytes([data[0], data[1]]);
    if marker != DISCOVERY_RESPONSE {
        return Err(WireError::UnexpectedMarker(marker));
    }

    let field = &data[ADDRESS_START..ADDRESS_END];
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    let ip = std::str::from_utf8(&field[..end]).map_err(|_| WireError::InvalidAddress)?;
    if ip.is_empty() {
        return Err(WireError::InvalidAddress);
    }

    let port = u16::from_be_bytes([data[ADDRESS_END], data[ADDRESS_END + 1]]);

    Ok(DiscoveredAddress {
        ip: ip.to_string(),
        port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(ip: &str, port: u16) -> Vec<u8> {
        let mut packet = vec![0u8; DISCOVERY_PACKET_SIZE];
        packet[0..2].copy_from_slice(&DISCOVERY_RESPONSE.to_be_bytes());
        packet[2..4].copy_from_slice(&DISCOVERY_LENGTH.to_be_bytes());
        packet[4..8].copy_from_slice(&42u32.to_be_bytes());
        packet[ADDRESS_START..ADDRESS_START + ip.len()].copy_from_slice(ip.as_bytes());
        packet[72..74].copy_from_slice(&port.to_be_bytes());
        packet
    }

    #[test]
    fn test_request_layout() {
        let packet = build_request(0xDEADBEEF);
        assert_eq!(packet.len(), 74);
        assert_eq!(&packet[0..2], &[0x00, 0x01]);
        assert_eq!(&packet[2..4], &[0x00, 70]);
        assert_eq!(&packet[4..8], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(packet[8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_parse_reply() {
        let parsed = parse_response(&reply("203.0.113.7", 50004)).unwrap();
        assert_eq!(
            parsed,
            DiscoveredAddress {
                ip: "203.0.113.7".to_string(),
                port: 50004,
            }
        );
    }

    #[test]
    fn test_parse_reply_full_width_address() {
        // An address filling all 64 bytes has no terminating NUL
        let ip = "a".repeat(64);
        let parsed = parse_response(&reply(&ip, 1)).unwrap();
        assert_eq!(parsed.ip, ip);
    }

    #[test]
    fn test_parse_reply_wrong_marker() {
        let mut packet = reply("10.0.0.1", 1234);
        packet[1] = 0x01;
        assert_eq!(
            parse_response(&packet),
            Err(WireError::UnexpectedMarker(0x0001))
        );
    }

    #[test]
    fn test_parse_reply_too_short() {
        assert_eq!(
            parse_response(&[0u8; 20]),
            Err(WireError::TooShort { len: 20, min: 74 })
        );
    }

    #[test]
    fn test_parse_reply_empty_address() {
        assert_eq!(
            parse_response(&reply("", 1234)),
            Err(WireError::InvalidAddress)
        );
    }

    #[test]
    fn test_parse_reply_invalid_utf8() {
        let mut packet = reply("", 1234);
        packet[ADDRESS_START] = 0xFF;
        assert_eq!(parse_response(&packet), Err(WireError::InvalidAddress));
    }
}
