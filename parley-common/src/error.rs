//! Errors produced while decoding wire data

use thiserror::Error;

/// Malformed or unexpected bytes on the wire
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// Buffer shorter than the fixed part of the format
    #[error("packet too short: {len} bytes (need at least {min})")]
    TooShort { len: usize, min: usize },
    /// Discovery reply carried the wrong type marker
    #[error("unexpected discovery marker {0:#06x}")]
    UnexpectedMarker(u16),
    /// Discovery reply address was not valid UTF-8 or was empty
    #[error("invalid address in discovery reply")]
    InvalidAddress,
    /// RTP version bits were not 2
    #[error("unsupported RTP version {0}")]
    UnsupportedVersion(u8),
    /// Header extension claims more words than the payload holds
    #[error("header extension overruns payload ({words} words, {len} bytes)")]
    ExtensionOverrun { words: usize, len: usize },
}
