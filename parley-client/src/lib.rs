//! Parley voice client
//!
//! The real-time voice layer of the Parley chat client: signaling with the
//! voice relay, encrypted RTP over UDP, and the capture and playback
//! pipelines around the Opus codec.

pub mod config;
pub mod error;
pub mod voice;

pub use config::VoiceSettings;
pub use error::VoiceError;
pub use voice::engine::{VoiceEngine, VoiceEvent};
pub use voice::session::{ConnectParams, VoiceConnection};
