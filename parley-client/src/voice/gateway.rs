//! Voice signaling client
//!
//! The handshake is driven by `SignalingMachine`, which turns each relay
//! message into a list of `SignalingAction`s and performs no I/O itself.
//! `GatewaySocket` carries the JSON frames over the WebSocket, and
//! `Heartbeater` keeps the connection alive from its own thread.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use futures_util::{SinkExt, StreamExt};
use once_cell::sync::Lazy;
use parley_common::discovery::DiscoveredAddress;
use parley_common::gateway::{
    GatewayMessage, Identify, MODE_XCHACHA20_POLY1305, SPEAKING_MICROPHONE, SelectProtocol,
    Speaking,
};
use parley_common::gateway_url;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config};
use tracing::{debug, info, warn};

use super::crypto::KEY_SIZE;
use crate::error::VoiceError;

// =============================================================================
// Constants
// =============================================================================

/// Heartbeat interval used when the relay's Hello carries an unusable one
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

// =============================================================================
// State
// =============================================================================

/// Where the handshake currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    /// WebSocket not yet open
    Connecting,
    AwaitingHello,
    AwaitingReady,
    AwaitingSessionDescription,
    /// Key installed and media flowing
    Connected,
    Disconnected,
}

impl std::fmt::Display for SignalingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SignalingState::Connecting => "connecting",
            SignalingState::AwaitingHello => "awaiting hello",
            SignalingState::AwaitingReady => "awaiting ready",
            SignalingState::AwaitingSessionDescription => "awaiting session description",
            SignalingState::Connected => "connected",
            SignalingState::Disconnected => "disconnected",
        };
        write!(f, "{}", name)
    }
}

/// Side effects the session must carry out, in order
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingAction {
    /// Start sending heartbeats at this interval
    StartHeartbeat(Duration),
    Send(GatewayMessage),
    /// Bind the UDP transport, set the SSRC, then run discovery and report
    /// the result through `SignalingMachine::on_discovered`
    ConnectTransport { ip: String, port: u16, ssrc: u32 },
    InstallKey([u8; KEY_SIZE]),
    /// Send the Opus silence frames that open the NAT path
    SendSilence,
    /// Start the capture and playback pipelines
    StartMedia,
    /// A remote user id now owns this SSRC
    SpeakerMapped { ssrc: u32, user_id: String },
    /// The relay says this SSRC stopped speaking
    SpeakerSilent(u32),
    /// A remote user left the call
    UserLeft(String),
}

// =============================================================================
// Signaling Machine
// =============================================================================

/// The handshake state machine
#[derive(Debug)]
pub struct SignalingMachine {
    state: SignalingState,
    identify: Identify,
    ssrc: Option<u32>,
    mode: Option<String>,
}

impl SignalingMachine {
    pub fn new(identify: Identify) -> Self {
        Self {
            state: SignalingState::Connecting,
            identify,
            ssrc: None,
            mode: None,
        }
    }

    pub fn state(&self) -> SignalingState {
        self.state
    }

    /// SSRC assigned by the relay in `Ready`
    pub fn ssrc(&self) -> Option<u32> {
        self.ssrc
    }

    /// Encryption mode chosen from the relay's offer
    pub fn mode(&self) -> Option<&str> {
        self.mode.as_deref()
    }

    /// The WebSocket is open
    pub fn opened(&mut self) {
        if self.state == SignalingState::Connecting {
            self.state = SignalingState::AwaitingHello;
        }
    }

    /// The session is over; every later message is ignored
    pub fn close(&mut self) {
        self.state = SignalingState::Disconnected;
    }

    /// Advance on one relay message
    ///
    /// # Returns
    /// Actions to perform in order. Unexpected messages yield none; a relay
    /// that offers no usable encryption mode is an error.
    pub fn on_message(
        &mut self,
        message: GatewayMessage,
    ) -> Result<Vec<SignalingAction>, VoiceError> {
        match (self.state, message) {
            (SignalingState::AwaitingHello, GatewayMessage::Hello(hello)) => {
                let interval = heartbeat_interval(hello.heartbeat_interval);
                self.state = SignalingState::AwaitingReady;
                Ok(vec![
                    SignalingAction::StartHeartbeat(interval),
                    SignalingAction::Send(GatewayMessage::Identify(self.identify.clone())),
                ])
            }
            (SignalingState::AwaitingReady, GatewayMessage::Ready(ready)) => {
                let mode = ready
                    .select_mode()
                    .ok_or(VoiceError::UnsupportedEncryption)?
                    .to_string();
                info!(ssrc = ready.ssrc, ip = %ready.ip, port = ready.port, mode = %mode, "voice ready");

                self.ssrc = Some(ready.ssrc);
                self.mode = Some(mode);
                self.state = SignalingState::AwaitingSessionDescription;
                Ok(vec![SignalingAction::ConnectTransport {
                    ip: ready.ip,
                    port: ready.port,
                    ssrc: ready.ssrc,
                }])
            }
            (
                SignalingState::AwaitingSessionDescription,
                GatewayMessage::SessionDescription(description),
            ) => {
                if description.mode != MODE_XCHACHA20_POLY1305 {
                    return Err(VoiceError::UnsupportedEncryption);
                }
                let ssrc = self
                    .ssrc
                    .ok_or_else(|| VoiceError::Protocol("session description before ready".to_string()))?;

                self.state = SignalingState::Connected;
                Ok(vec![
                    SignalingAction::InstallKey(description.secret_key),
                    SignalingAction::SendSilence,
                    SignalingAction::Send(GatewayMessage::Speaking(Speaking {
                        speaking: SPEAKING_MICROPHONE,
                        delay: 0,
                        ssrc,
                        user_id: None,
                    })),
                    SignalingAction::StartMedia,
                ])
            }
            (_, GatewayMessage::HeartbeatAck(nonce)) => {
                let rtt = unix_millis().saturating_sub(nonce);
                debug!(rtt_ms = rtt, "heartbeat acknowledged");
                Ok(Vec::new())
            }
            (
                SignalingState::AwaitingSessionDescription | SignalingState::Connected,
                GatewayMessage::Speaking(speaking),
            ) => {
                if Some(speaking.ssrc) == self.ssrc {
                    return Ok(Vec::new());
                }
                let mut actions = Vec::new();
                if let Some(user_id) = speaking.user_id {
                    actions.push(SignalingAction::SpeakerMapped {
                        ssrc: speaking.ssrc,
                        user_id,
                    });
                }
                if speaking.speaking == 0 {
                    actions.push(SignalingAction::SpeakerSilent(speaking.ssrc));
                }
                Ok(actions)
            }
            (
                SignalingState::AwaitingSessionDescription | SignalingState::Connected,
                GatewayMessage::ClientDisconnect(disconnect),
            ) => Ok(vec![SignalingAction::UserLeft(disconnect.user_id)]),
            (state, message) => {
                warn!(op = message.op(), %state, "ignoring unexpected gateway message");
                Ok(Vec::new())
            }
        }
    }

    /// Discovery finished; select the protocol with our public address
    pub fn on_discovered(
        &mut self,
        address: DiscoveredAddress,
    ) -> Result<Vec<SignalingAction>, VoiceError> {
        if self.state != SignalingState::AwaitingSessionDescription {
            warn!(state = %self.state, "discovery result outside handshake");
            return Ok(Vec::new());
        }
        let mode = self.mode.as_deref().ok_or(VoiceError::UnsupportedEncryption)?;
        Ok(vec![SignalingAction::Send(GatewayMessage::SelectProtocol(
            SelectProtocol::udp(address.ip, address.port, mode),
        ))])
    }
}

fn heartbeat_interval(millis: f64) -> Duration {
    if !millis.is_finite() || millis <= 0.0 {
        warn!(
            interval_ms = millis,
            "invalid heartbeat interval, using {:?}", DEFAULT_HEARTBEAT_INTERVAL
        );
        return DEFAULT_HEARTBEAT_INTERVAL;
    }
    Duration::from_secs_f64(millis / 1000.0)
}

/// Milliseconds since the Unix epoch, used as heartbeat nonces
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Gateway Socket
// =============================================================================

/// TLS settings for `wss://` relays, verified against the webpki roots
static TLS_CONFIG: Lazy<Arc<ClientConfig>> = Lazy::new(|| {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
});

/// JSON message framing over the voice WebSocket
pub struct GatewaySocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl GatewaySocket {
    /// Open the WebSocket to a relay endpoint
    ///
    /// # Arguments
    /// * `endpoint` - Host (optionally with port), or a full ws/wss URL
    pub async fn connect(endpoint: &str) -> Result<Self, VoiceError> {
        let url = gateway_url(endpoint);
        info!(%url, "connecting to voice gateway");
        let connector = Connector::Rustls(Arc::clone(&TLS_CONFIG));
        let (stream, _) =
            connect_async_tls_with_config(url.as_str(), None, false, Some(connector)).await?;
        Ok(Self { stream })
    }

    pub async fn send(&mut self, message: &GatewayMessage) -> Result<(), VoiceError> {
        let text = message.to_json()?;
        self.stream.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Next gateway message
    ///
    /// Malformed frames are logged and skipped.
    ///
    /// # Returns
    /// `Ok(None)` once the relay closes the connection
    pub async fn next(&mut self) -> Result<Option<GatewayMessage>, VoiceError> {
        while let Some(frame) = self.stream.next().await {
            match frame? {
                Message::Text(text) => match GatewayMessage::from_json(text.as_str()) {
                    Ok(message) => return Ok(Some(message)),
                    Err(e) => warn!("ignoring malformed gateway message: {}", e),
                },
                Message::Close(frame) => {
                    info!(?frame, "voice gateway closed");
                    return Ok(None);
                }
                _ => {}
            }
        }
        Ok(None)
    }

    /// Send a close frame
    pub async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!("gateway close failed: {}", e);
        }
    }
}

// =============================================================================
// Heartbeater
// =============================================================================

/// Periodic heartbeat sender
///
/// Runs on a plain thread so heartbeats keep going even if the session's
/// runtime is busy. Each beat is pushed into the session's outbound queue.
pub struct Heartbeater {
    cancel: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Heartbeater {
    /// Start beating every `interval`
    pub fn spawn(
        interval: Duration,
        outbound: mpsc::UnboundedSender<GatewayMessage>,
    ) -> Result<Self, VoiceError> {
        let (cancel, cancel_rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("parley-heartbeat".to_string())
            .spawn(move || {
                loop {
                    match cancel_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            if outbound.send(GatewayMessage::Heartbeat(unix_millis())).is_err() {
                                break;
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;
        debug!(interval_ms = interval.as_millis() as u64, "heartbeat started");
        Ok(Self {
            cancel: Some(cancel),
            handle: Some(handle),
        })
    }

    /// Stop beating and wait for the thread
    pub fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("heartbeat thread panicked");
        }
    }
}

impl Drop for Heartbeater {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_common::gateway::{ClientDisconnect, Hello, Ready, SessionDescription};

    fn identify() -> Identify {
        Identify {
            server_id: "srv".to_string(),
            user_id: "me".to_string(),
            session_id: "sess".to_string(),
            token: "tok".to_string(),
        }
    }

    fn ready() -> Ready {
        Ready {
            ssrc: 42,
            ip: "10.0.0.1".to_string(),
            port: 5000,
            modes: vec!["plain".to_string(), MODE_XCHACHA20_POLY1305.to_string()],
        }
    }

    fn description() -> SessionDescription {
        SessionDescription {
            mode: MODE_XCHACHA20_POLY1305.to_string(),
            secret_key: [9u8; 32],
        }
    }

    fn hello() -> GatewayMessage {
        GatewayMessage::Hello(Hello {
            heartbeat_interval: 13750.0,
        })
    }

    fn machine_at_session_description() -> SignalingMachine {
        let mut machine = SignalingMachine::new(identify());
        machine.opened();
        machine.on_message(hello()).unwrap();
        machine.on_message(GatewayMessage::Ready(ready())).unwrap();
        machine
    }

    #[test]
    fn test_full_handshake() {
        let mut machine = SignalingMachine::new(identify());
        assert_eq!(machine.state(), SignalingState::Connecting);
        machine.opened();
        assert_eq!(machine.state(), SignalingState::AwaitingHello);

        let actions = machine.on_message(hello()).unwrap();
        assert_eq!(
            actions,
            vec![
                SignalingAction::StartHeartbeat(Duration::from_millis(13750)),
                SignalingAction::Send(GatewayMessage::Identify(identify())),
            ]
        );
        assert_eq!(machine.state(), SignalingState::AwaitingReady);

        let actions = machine.on_message(GatewayMessage::Ready(ready())).unwrap();
        assert_eq!(
            actions,
            vec![SignalingAction::ConnectTransport {
                ip: "10.0.0.1".to_string(),
                port: 5000,
                ssrc: 42,
            }]
        );
        assert_eq!(machine.ssrc(), Some(42));
        assert_eq!(machine.mode(), Some(MODE_XCHACHA20_POLY1305));

        let actions = machine
            .on_discovered(DiscoveredAddress {
                ip: "203.0.113.5".to_string(),
                port: 40000,
            })
            .unwrap();
        assert_eq!(
            actions,
            vec![SignalingAction::Send(GatewayMessage::SelectProtocol(
                SelectProtocol::udp("203.0.113.5".to_string(), 40000, MODE_XCHACHA20_POLY1305)
            ))]
        );

        let actions = machine
            .on_message(GatewayMessage::SessionDescription(description()))
            .unwrap();
        assert_eq!(actions.len(), 4);
        assert_eq!(actions[0], SignalingAction::InstallKey([9u8; 32]));
        assert_eq!(actions[1], SignalingAction::SendSilence);
        assert!(matches!(
            &actions[2],
            SignalingAction::Send(GatewayMessage::Speaking(s)) if s.ssrc == 42
        ));
        assert_eq!(actions[3], SignalingAction::StartMedia);
        assert_eq!(machine.state(), SignalingState::Connected);
    }

    #[test]
    fn test_unsupported_modes_fail() {
        let mut machine = SignalingMachine::new(identify());
        machine.opened();
        machine.on_message(hello()).unwrap();
        let mut offer = ready();
        offer.modes = vec!["xsalsa20_poly1305".to_string()];
        assert!(matches!(
            machine.on_message(GatewayMessage::Ready(offer)),
            Err(VoiceError::UnsupportedEncryption)
        ));
    }

    #[test]
    fn test_session_description_with_other_mode_fails() {
        let mut machine = machine_at_session_description();
        let mut other = description();
        other.mode = "xsalsa20_poly1305".to_string();
        assert!(matches!(
            machine.on_message(GatewayMessage::SessionDescription(other)),
            Err(VoiceError::UnsupportedEncryption)
        ));
    }

    #[test]
    fn test_out_of_order_messages_are_ignored() {
        let mut machine = SignalingMachine::new(identify());
        machine.opened();
        let actions = machine.on_message(GatewayMessage::Ready(ready())).unwrap();
        assert!(actions.is_empty());
        assert_eq!(machine.state(), SignalingState::AwaitingHello);

        let actions = machine
            .on_message(GatewayMessage::SessionDescription(description()))
            .unwrap();
        assert!(actions.is_empty());

        let actions = machine
            .on_message(GatewayMessage::Unknown {
                op: 99,
                d: serde_json::Value::Null,
            })
            .unwrap();
        assert!(actions.is_empty());
    }

    #[test]
    fn test_invalid_heartbeat_interval_falls_back() {
        for interval in [0.0, -1.0, f64::NAN] {
            let mut machine = SignalingMachine::new(identify());
            machine.opened();
            let actions = machine
                .on_message(GatewayMessage::Hello(Hello {
                    heartbeat_interval: interval,
                }))
                .unwrap();
            assert_eq!(
                actions,
                vec![
                    SignalingAction::StartHeartbeat(DEFAULT_HEARTBEAT_INTERVAL),
                    SignalingAction::Send(GatewayMessage::Identify(identify())),
                ]
            );
            assert_eq!(machine.state(), SignalingState::AwaitingReady);
        }
    }

    #[test]
    fn test_discovery_outside_handshake_is_ignored() {
        let mut machine = SignalingMachine::new(identify());
        let actions = machine
            .on_discovered(DiscoveredAddress {
                ip: "1.2.3.4".to_string(),
                port: 1,
            })
            .unwrap();
        assert!(actions.is_empty());
    }

    #[test]
    fn test_remote_speaking_maps_user() {
        let mut machine = machine_at_session_description();
        let actions = machine
            .on_message(GatewayMessage::Speaking(Speaking {
                speaking: 1,
                delay: 0,
                ssrc: 7,
                user_id: Some("bob".to_string()),
            }))
            .unwrap();
        assert_eq!(
            actions,
            vec![SignalingAction::SpeakerMapped {
                ssrc: 7,
                user_id: "bob".to_string()
            }]
        );

        // Echo of our own SSRC
        let actions = machine
            .on_message(GatewayMessage::Speaking(Speaking {
                speaking: 1,
                delay: 0,
                ssrc: 42,
                user_id: Some("me".to_string()),
            }))
            .unwrap();
        assert!(actions.is_empty());
    }

    #[test]
    fn test_remote_stop_speaking() {
        let mut machine = machine_at_session_description();
        let actions = machine
            .on_message(GatewayMessage::Speaking(Speaking {
                speaking: 0,
                delay: 0,
                ssrc: 7,
                user_id: Some("bob".to_string()),
            }))
            .unwrap();
        assert_eq!(
            actions,
            vec![
                SignalingAction::SpeakerMapped {
                    ssrc: 7,
                    user_id: "bob".to_string()
                },
                SignalingAction::SpeakerSilent(7),
            ]
        );

        let actions = machine
            .on_message(GatewayMessage::Speaking(Speaking {
                speaking: 0,
                delay: 0,
                ssrc: 8,
                user_id: None,
            }))
            .unwrap();
        assert_eq!(actions, vec![SignalingAction::SpeakerSilent(8)]);

        // Our own SSRC going quiet is not a remote speaker
        let actions = machine
            .on_message(GatewayMessage::Speaking(Speaking {
                speaking: 0,
                delay: 0,
                ssrc: 42,
                user_id: None,
            }))
            .unwrap();
        assert!(actions.is_empty());
    }

    #[test]
    fn test_client_disconnect_removes_user() {
        let mut machine = machine_at_session_description();
        let actions = machine
            .on_message(GatewayMessage::ClientDisconnect(ClientDisconnect {
                user_id: "bob".to_string(),
            }))
            .unwrap();
        assert_eq!(actions, vec![SignalingAction::UserLeft("bob".to_string())]);
    }

    #[test]
    fn test_closed_machine_ignores_everything() {
        let mut machine = machine_at_session_description();
        machine.close();
        let actions = machine
            .on_message(GatewayMessage::SessionDescription(description()))
            .unwrap();
        assert!(actions.is_empty());
        assert_eq!(machine.state(), SignalingState::Disconnected);
    }

    #[test]
    fn test_heartbeater_sends_nonces() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut heartbeater = Heartbeater::spawn(Duration::from_millis(10), tx).unwrap();
        std::thread::sleep(Duration::from_millis(60));
        heartbeater.stop();

        let mut beats = 0;
        while let Ok(message) = rx.try_recv() {
            assert!(matches!(message, GatewayMessage::Heartbeat(nonce) if nonce > 0));
            beats += 1;
        }
        assert!(beats >= 2);
    }

    #[test]
    fn test_heartbeater_stops_promptly() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut heartbeater = Heartbeater::spawn(Duration::from_secs(60), tx).unwrap();
        let start = std::time::Instant::now();
        heartbeater.stop();
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
