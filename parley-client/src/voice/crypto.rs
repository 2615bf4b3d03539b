//! Per-packet voice encryption
//!
//! Media is sealed with XChaCha20-Poly1305 under the session key handed out
//! in `SessionDescription`. The 24-byte nonce is the packet's own RTP header
//! followed by zeros, so nothing extra travels on the wire except the
//! 16-byte tag appended after the ciphertext:
//!
//! ```text
//! [ RTP header (12) ][ ciphertext (n) ][ tag (16) ]
//! ```

use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{Key, KeyInit, Tag, XChaCha20Poly1305, XNonce};
use parley_common::rtp::{RTP_HEADER_SIZE, RtpHeader};

use crate::error::VoiceError;

/// Session key length
pub const KEY_SIZE: usize = 32;

/// XChaCha20 nonce length
pub const NONCE_SIZE: usize = 24;

/// Poly1305 tag length
pub const TAG_SIZE: usize = 16;

/// Smallest datagram that can hold a sealed packet
pub const MIN_SEALED_LEN: usize = RTP_HEADER_SIZE + TAG_SIZE;

/// Build the nonce for a packet from its serialized header
pub fn nonce_from_header(header: &[u8; RTP_HEADER_SIZE]) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..RTP_HEADER_SIZE].copy_from_slice(header);
    nonce
}

/// Seals outgoing and opens incoming RTP packets
pub struct SessionCipher {
    cipher: XChaCha20Poly1305,
}

impl SessionCipher {
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Build a complete datagram into `out`
    ///
    /// `out` is cleared first; its capacity is reused so steady-state sends
    /// do not allocate.
    pub fn seal(
        &self,
        header: &RtpHeader,
        payload: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<(), VoiceError> {
        let header_bytes = header.to_bytes();
        let nonce = nonce_from_header(&header_bytes);

        out.clear();
        out.extend_from_slice(&header_bytes);
        out.extend_from_slice(payload);

        let tag = self
            .cipher
            .encrypt_in_place_detached(
                XNonce::from_slice(&nonce),
                &[],
                &mut out[RTP_HEADER_SIZE..],
            )
            .map_err(|_| VoiceError::Crypto)?;
        out.extend_from_slice(&tag);
        Ok(())
    }

    /// Authenticate and decrypt a datagram in place
    ///
    /// # Returns
    /// * `Ok((header, payload))` - The parsed header and the plaintext, which
    ///   borrows from `packet`
    /// * `Err` - Short or malformed packet, or failed authentication
    pub fn open<'a>(&self, packet: &'a mut [u8]) -> Result<(RtpHeader, &'a [u8]), VoiceError> {
        if packet.len() < MIN_SEALED_LEN {
            return Err(VoiceError::Wire(parley_common::WireError::TooShort {
                len: packet.len(),
                min: MIN_SEALED_LEN,
            }));
        }

        let header = RtpHeader::parse(packet)?;
        let mut header_bytes = [0u8; RTP_HEADER_SIZE];
        header_bytes.copy_from_slice(&packet[..RTP_HEADER_SIZE]);
        let nonce = nonce_from_header(&header_bytes);

        let tag_start = packet.len() - TAG_SIZE;
        let (body, tag) = packet.split_at_mut(tag_start);
        let ciphertext = &mut body[RTP_HEADER_SIZE..];

        self.cipher
            .decrypt_in_place_detached(
                XNonce::from_slice(&nonce),
                &[],
                ciphertext,
                Tag::from_slice(tag),
            )
            .map_err(|_| VoiceError::Crypto)?;

        Ok((header, &packet[RTP_HEADER_SIZE..tag_start]))
    }
}
