//! RTP framing for voice packets
//!
//! Wire format of the fixed header (big-endian):
//! ```text
//! +--------+--------+----------------+
//! | V/P/X  | M / PT |    Sequence    |
//! +--------+--------+----------------+
//! |            Timestamp             |
//! +----------------------------------+
//! |               SSRC               |
//! +----------------------------------+
//! |   encrypted payload ... | tag    |
//! +----------------------------------+
//! ```
//!
//! The relay places a one-byte-header extension (`0xBEDE`) at the front of
//! the *encrypted* payload, so it can only be stripped after decryption.

use crate::WireError;
use crate::audio::OPUS_PAYLOAD_TYPE;

/// Size of the fixed RTP header in bytes
pub const RTP_HEADER_SIZE: usize = 12;

/// First header byte: version 2, no padding, no extension, no CSRCs
pub const RTP_VERSION_FLAGS: u8 = 0x80;

/// Marker for a one-byte-header RTP extension (RFC 8285)
pub const RTP_EXTENSION_MARKER: [u8; 2] = [0xBE, 0xDE];

/// Conservative ceiling for a single RTP payload, well below typical path MTU
pub const RTP_MAX_PAYLOAD: usize = 1100;

/// The fixed 12-byte RTP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    /// Version/padding/extension/CSRC-count byte
    pub flags: u8,
    /// Payload type (without the marker bit)
    pub payload_type: u8,
    /// Marker bit
    pub marker: bool,
    /// Sequence number, +1 per packet
    pub sequence: u16,
    /// Media timestamp in samples
    pub timestamp: u32,
    /// Synchronization source of the sender
    pub ssrc: u32,
}

impl RtpHeader {
    /// Create an Opus audio header
    pub fn opus(sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            flags: RTP_VERSION_FLAGS,
            payload_type: OPUS_PAYLOAD_TYPE,
            marker: false,
            sequence,
            timestamp,
            ssrc,
        }
    }

    /// Serialize to the 12-byte wire form
    pub fn to_bytes(&self) -> [u8; RTP_HEADER_SIZE] {
        let mut bytes = [0u8; RTP_HEADER_SIZE];
        bytes[0] = self.flags;
        bytes[1] = (self.payload_type & 0x7F) | if self.marker { 0x80 } else { 0 };
        bytes[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        bytes
    }

    /// Parse the fixed header from the start of a datagram
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < RTP_HEADER_SIZE {
            return Err(WireError::TooShort {
                len: data.len(),
                min: RTP_HEADER_SIZE,
            });
        }

        let version = data[0] >> 6;
        if version != 2 {
            return Err(WireError::UnsupportedVersion(version));
        }

        Ok(Self {
            flags: data[0],
            payload_type: data[1] & 0x7F,
            marker: data[1] & 0x80 != 0,
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        })
    }

    /// Whether the extension bit is set
    pub fn has_extension(&self) -> bool {
        self.flags & 0x10 != 0
    }
}

/// Strip a leading `0xBEDE` header extension from a decrypted payload
///
/// Payloads without the marker are returned unchanged.
pub fn strip_header_extension(payload: &[u8]) -> Result<&[u8], WireError> {
    if payload.len() < 4 || payload[0..2] != RTP_EXTENSION_MARKER {
        return Ok(payload);
    }

    let words = u16::from_be_bytes([payload[2], payload[3]]) as usize;
    let skip = 4 + words * 4;
    if skip > payload.len() {
        return Err(WireError::ExtensionOverrun {
            words,
            len: payload.len(),
        });
    }

    Ok(&payload[skip..])
}

// =============================================================================
// Sequencing
// =============================================================================

/// Sequence/timestamp state for one outgoing RTP stream
///
/// A single instance must be the only writer for a given SSRC so that
/// sequence numbers and timestamps never interleave out of order.
#[derive(Debug, Clone)]
pub struct RtpSequencer {
    sequence: u16,
    timestamp: u32,
    timestamp_step: u32,
}

impl RtpSequencer {
    /// Create a sequencer whose timestamp advances by `timestamp_step` per frame
    pub fn new(timestamp_step: u32) -> Self {
        Self {
            sequence: 0,
            timestamp: 0,
            timestamp_step,
        }
    }

    /// Start from explicit counter values
    pub fn with_start(sequence: u16, timestamp: u32, timestamp_step: u32) -> Self {
        Self {
            sequence,
            timestamp,
            timestamp_step,
        }
    }

    /// Increment and return the sequence number for the next packet
    pub fn next_sequence(&mut self) -> u16 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }

    /// Advance the timestamp by one frame and return it
    pub fn next_timestamp(&mut self) -> u32 {
        self.timestamp = self.timestamp.wrapping_add(self.timestamp_step);
        self.timestamp
    }

    /// Last sequence number handed out
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Last timestamp handed out
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }
}

// =============================================================================
// Packetizer
// =============================================================================

/// Splits encoded media units into RTP-sized payloads
///
/// Opus frames always fit in a single packet; larger units (video) are split
/// into consecutive chunks that each consume their own sequence number.
#[derive(Debug, Clone, Copy)]
pub struct RtpPacketizer {
    max_payload: usize,
}

impl RtpPacketizer {
    /// Create a packetizer with the given payload ceiling
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload: max_payload.max(1),
        }
    }

    /// Payload ceiling in bytes
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Number of packets a unit of `len` bytes needs
    pub fn packet_count(&self, len: usize) -> usize {
        len.div_ceil(self.max_payload).max(1)
    }

    /// Split a media unit into payload-sized chunks
    ///
    /// An empty unit still produces one (empty) chunk.
    pub fn fragment<'a>(&self, unit: &'a [u8]) -> Vec<&'a [u8]> {
        if unit.is_empty() {
            return vec![unit];
        }
        unit.chunks(self.max_payload).collect()
    }
}

impl Default for RtpPacketizer {
    fn default() -> Self {
        Self::new(RTP_MAX_PAYLOAD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_wire_layout() {
        let header = RtpHeader::opus(0x0102, 0x03040506, 0x0708090A);
        let bytes = header.to_bytes();
        assert_eq!(
            bytes,
            [0x80, 0x78, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A]
        );
        assert_eq!(RtpHeader::parse(&bytes).unwrap(), header);
    }

    #[test]
    fn test_header_marker_bit() {
        let mut header = RtpHeader::opus(1, 2, 3);
        header.marker = true;
        let bytes = header.to_bytes();
        assert_eq!(bytes[1], 0xF8);
        let parsed = RtpHeader::parse(&bytes).unwrap();
        assert!(parsed.marker);
        assert_eq!(parsed.payload_type, OPUS_PAYLOAD_TYPE);
    }

    #[test]
    fn test_parse_too_short() {
        assert_eq!(
            RtpHeader::parse(&[0x80; 5]),
            Err(WireError::TooShort { len: 5, min: 12 })
        );
    }

    #[test]
    fn test_parse_rejects_wrong_version() {
        let mut bytes = RtpHeader::opus(1, 1, 1).to_bytes();
        bytes[0] = 0x40;
        assert_eq!(
            RtpHeader::parse(&bytes),
            Err(WireError::UnsupportedVersion(1))
        );
    }

    #[test]
    fn test_extension_flag() {
        let mut bytes = RtpHeader::opus(1, 1, 1).to_bytes();
        assert!(!RtpHeader::parse(&bytes).unwrap().has_extension());
        bytes[0] = 0x90;
        assert!(RtpHeader::parse(&bytes).unwrap().has_extension());
    }

    #[test]
    fn test_strip_extension() {
        // Marker, 2 words of extension data, then the opus payload
        let payload = [0xBE, 0xDE, 0x00, 0x02, 1, 2, 3, 4, 5, 6, 7, 8, 0xAA, 0xBB];
        assert_eq!(strip_header_extension(&payload).unwrap(), &[0xAA, 0xBB]);
    }

    #[test]
    fn test_strip_extension_absent() {
        let payload = [0xF8, 0xFF, 0xFE];
        assert_eq!(strip_header_extension(&payload).unwrap(), &payload);
    }

    #[test]
    fn test_strip_extension_overrun() {
        let payload = [0xBE, 0xDE, 0x00, 0x05, 1, 2, 3, 4];
        assert_eq!(
            strip_header_extension(&payload),
            Err(WireError::ExtensionOverrun { words: 5, len: 8 })
        );
    }

    #[test]
    fn test_sequence_increments_by_one() {
        let mut seq = RtpSequencer::new(960);
        let mut last = seq.sequence();
        for _ in 0..100 {
            let next = seq.next_sequence();
            assert_eq!(next, last.wrapping_add(1));
            last = next;
        }
    }

    #[test]
    fn test_sequence_wraps_at_16_bits() {
        let mut seq = RtpSequencer::with_start(u16::MAX - 1, 0, 960);
        assert_eq!(seq.next_sequence(), u16::MAX);
        assert_eq!(seq.next_sequence(), 0);
        assert_eq!(seq.next_sequence(), 1);
    }

    #[test]
    fn test_timestamp_advances_by_step_and_wraps() {
        let mut seq = RtpSequencer::with_start(0, u32::MAX - 100, 960);
        assert_eq!(seq.next_timestamp(), 859);
        assert_eq!(seq.next_timestamp(), 1819);
    }

    #[test]
    fn test_packetizer_single_packet_for_audio() {
        let packetizer = RtpPacketizer::default();
        let frame = vec![0u8; 160];
        let chunks = packetizer.fragment(&frame);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 160);
    }

    #[test]
    fn test_packetizer_fragments_large_unit() {
        let packetizer = RtpPacketizer::default();
        let unit: Vec<u8> = (0..2500).map(|i| (i % 251) as u8).collect();
        let chunks = packetizer.fragment(&unit);
        assert_eq!(chunks.len(), 3);
        assert_eq!(packetizer.packet_count(unit.len()), 3);
        assert!(chunks.iter().all(|c| c.len() <= RTP_MAX_PAYLOAD));
        assert_eq!(chunks.concat(), unit);
    }

    #[test]
    fn test_packetizer_empty_unit() {
        let packetizer = RtpPacketizer::default();
        assert_eq!(packetizer.fragment(&[]).len(), 1);
        assert_eq!(packetizer.packet_count(0), 1);
    }
}
