//! Encrypted RTP over UDP
//!
//! One socket per call, aimed at the relay address from `Ready`. Before the
//! session key arrives the only thing ever sent is the IP discovery probe;
//! afterwards every datagram is an RTP packet sealed by `SessionCipher`.
//!
//! Receiving happens on a dedicated thread that blocks on the socket with a
//! short read timeout, so `stop` can end it promptly.

use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, bounded};
use parley_common::audio::{MAX_OPUS_PACKET_SIZE, VOICE_FRAME_LEN};
use parley_common::discovery::{self, DiscoveredAddress};
use parley_common::rtp::{RtpHeader, RtpPacketizer, RtpSequencer};
use tracing::{debug, error, info, warn};

use super::crypto::{KEY_SIZE, SessionCipher};
use crate::error::VoiceError;

// =============================================================================
// Constants
// =============================================================================

/// Buffer size for receiving packets
const RECV_BUFFER_SIZE: usize = 2048;

/// Receive poll timeout (lets the receive thread notice `stop`)
const RECV_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Default time to wait for the discovery reply
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Encoded frames that may wait for the sender thread
const SEND_QUEUE_CAPACITY: usize = 32;

// =============================================================================
// Traits
// =============================================================================

/// Receives decrypted packets on the transport's receive thread
pub trait ReceiveHandler: Send + 'static {
    /// A packet from the relay that authenticated under the session key
    fn on_packet(&mut self, header: RtpHeader, payload: &[u8], received_at: Instant);

    /// The socket failed; the receive thread is about to exit
    fn on_error(&mut self, error: VoiceError);
}

/// Destination for encoded frames produced by the capture pipeline
pub trait PacketSink: Send {
    /// Hand off one encoded frame; must not block
    fn send_frame(&mut self, frame: &[u8]);
}

// =============================================================================
// UDP Transport
// =============================================================================

struct SendState {
    sequencer: RtpSequencer,
    packet: Vec<u8>,
}

/// Secure datagram transport to one relay
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    ssrc: AtomicU32,
    cipher: Arc<RwLock<Option<SessionCipher>>>,
    send: Mutex<SendState>,
    packetizer: RtpPacketizer,
    running: Arc<AtomicBool>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    /// Bind a local socket and target it at the relay
    ///
    /// # Arguments
    /// * `ip` - Relay media address from `Ready`
    /// * `port` - Relay media port from `Ready`
    pub fn connect(ip: &str, port: u16) -> Result<Self, VoiceError> {
        let remote = (ip, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| VoiceError::Protocol(format!("unresolvable relay address {}", ip)))?;

        let bind: SocketAddr = if remote.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind)?;
        socket.set_read_timeout(Some(RECV_POLL_TIMEOUT))?;

        let local = socket.local_addr()?;
        info!(%remote, %local, "voice transport bound");

        Ok(Self {
            socket: Arc::new(socket),
            remote,
            ssrc: AtomicU32::new(0),
            cipher: Arc::new(RwLock::new(None)),
            send: Mutex::new(SendState {
                sequencer: RtpSequencer::new(VOICE_FRAME_LEN as u32),
                packet: Vec::with_capacity(RECV_BUFFER_SIZE),
            }),
            packetizer: RtpPacketizer::default(),
            running: Arc::new(AtomicBool::new(false)),
            receiver: Mutex::new(None),
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_addr(&self) -> Result<SocketAddr, VoiceError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn set_ssrc(&self, ssrc: u32) {
        self.ssrc.store(ssrc, Ordering::Relaxed);
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc.load(Ordering::Relaxed)
    }

    /// Install the session key; sends are refused until this is called
    pub fn set_secret_key(&self, key: &[u8; KEY_SIZE]) {
        if let Ok(mut cipher) = self.cipher.write() {
            *cipher = Some(SessionCipher::new(key));
        }
    }

    pub fn has_secret_key(&self) -> bool {
        self.cipher.read().map(|c| c.is_some()).unwrap_or(false)
    }

    /// Learn our public address from the relay
    ///
    /// Sends one probe and waits for the reply, ignoring datagrams from any
    /// other address. Must run before `run` takes over the socket.
    pub fn discover(&self, timeout: Duration) -> Result<DiscoveredAddress, VoiceError> {
        let probe = discovery::build_request(self.ssrc());
        self.socket.send_to(&probe, self.remote)?;

        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; RECV_BUFFER_SIZE];

        let result = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break Err(VoiceError::DiscoveryTimeout);
            }
            self.socket
                .set_read_timeout(Some(remaining.min(RECV_POLL_TIMEOUT)))?;

            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) if from == self.remote => {
                    match discovery::parse_response(&buf[..len]) {
                        Ok(address) => break Ok(address),
                        Err(e) => debug!("ignoring non-discovery packet: {}", e),
                    }
                }
                Ok((_, from)) => debug!(%from, "ignoring packet from unknown source"),
                Err(e) if is_transient(&e) => {}
                Err(e) => break Err(e.into()),
            }
        };

        self.socket.set_read_timeout(Some(RECV_POLL_TIMEOUT))?;
        if let Ok(address) = &result {
            info!(ip = %address.ip, port = address.port, "discovered external address");
        }
        result
    }

    /// Start the receive thread
    ///
    /// Datagrams from the relay are decrypted and passed to `handler`;
    /// anything that fails to authenticate is dropped.
    pub fn run<H: ReceiveHandler>(&self, mut handler: H) -> Result<(), VoiceError> {
        let mut receiver = self
            .receiver
            .lock()
            .map_err(|_| VoiceError::Protocol("receiver lock poisoned".to_string()))?;
        if receiver.is_some() {
            return Ok(());
        }

        self.running.store(true, Ordering::SeqCst);
        let socket = Arc::clone(&self.socket);
        let cipher = Arc::clone(&self.cipher);
        let running = Arc::clone(&self.running);
        let remote = self.remote;

        let handle = thread::Builder::new()
            .name("parley-udp-recv".to_string())
            .spawn(move || {
                let mut buf = [0u8; RECV_BUFFER_SIZE];
                while running.load(Ordering::SeqCst) {
                    let (len, from) = match socket.recv_from(&mut buf) {
                        Ok(received) => received,
                        Err(e) if is_transient(&e) => continue,
                        Err(e) => {
                            if running.load(Ordering::SeqCst) {
                                error!("voice socket failed: {}", e);
                                handler.on_error(e.into());
                            }
                            break;
                        }
                    };
                    if from != remote {
                        continue;
                    }
                    let received_at = Instant::now();

                    let Ok(guard) = cipher.read() else {
                        break;
                    };
                    let Some(session) = guard.as_ref() else {
                        continue;
                    };
                    match session.open(&mut buf[..len]) {
                        Ok((header, payload)) => handler.on_packet(header, payload, received_at),
                        Err(e) => debug!("dropping packet: {}", e),
                    }
                }
            })?;

        *receiver = Some(handle);
        Ok(())
    }

    /// Seal and send one media unit
    ///
    /// Units larger than the RTP payload ceiling are split across several
    /// packets; each packet takes the next sequence number and all of them
    /// share one timestamp.
    ///
    /// # Returns
    /// Number of datagrams sent
    pub fn send_encrypted(&self, unit: &[u8]) -> Result<usize, VoiceError> {
        let cipher = self
            .cipher
            .read()
            .map_err(|_| VoiceError::Protocol("cipher lock poisoned".to_string()))?;
        let cipher = cipher.as_ref().ok_or(VoiceError::NoSecretKey)?;

        let mut state = self
            .send
            .lock()
            .map_err(|_| VoiceError::Protocol("send lock poisoned".to_string()))?;
        let SendState { sequencer, packet } = &mut *state;

        let ssrc = self.ssrc();
        let timestamp = sequencer.next_timestamp();
        let mut sent = 0;
        for chunk in self.packetizer.fragment(unit) {
            let header = RtpHeader::opus(sequencer.next_sequence(), timestamp, ssrc);
            cipher.seal(&header, chunk, packet)?;
            self.socket.send_to(packet, self.remote)?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Stop the receive thread and wait for it
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.receiver.lock().ok().and_then(|mut r| r.take());
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            warn!("voice receive thread panicked");
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    // ConnectionReset is an ICMP port-unreachable echo on some platforms
    matches!(
        e.kind(),
        ErrorKind::WouldBlock
            | ErrorKind::TimedOut
            | ErrorKind::Interrupted
            | ErrorKind::ConnectionReset
    )
}

// =============================================================================
// Send Queue
// =============================================================================

/// One encoded frame, stored inline so queueing never allocates
struct QueuedFrame {
    len: usize,
    data: [u8; MAX_OPUS_PACKET_SIZE],
}

/// `PacketSink` that hands frames to a sender thread
///
/// The capture callback must not make system calls that can block, so it
/// pushes frames into this bounded queue and a dedicated thread does the
/// sealing and sending. Frames are dropped if the queue is full.
pub struct SendQueue {
    tx: Option<Sender<QueuedFrame>>,
    handle: Option<JoinHandle<()>>,
}

impl SendQueue {
    /// Start a sender thread for `transport`
    pub fn spawn(transport: Arc<UdpTransport>) -> Result<Self, VoiceError> {
        let (tx, rx) = bounded::<QueuedFrame>(SEND_QUEUE_CAPACITY);
        let handle = thread::Builder::new()
            .name("parley-udp-send".to_string())
            .spawn(move || {
                // Ends once every SendQueue handle is dropped
                for frame in rx.iter() {
                    if let Err(e) = transport.send_encrypted(&frame.data[..frame.len]) {
                        debug!("send failed: {}", e);
                    }
                }
            })?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }
}

impl PacketSink for SendQueue {
    fn send_frame(&mut self, frame: &[u8]) {
        let len = frame.len().min(MAX_OPUS_PACKET_SIZE);
        let mut queued = QueuedFrame {
            len,
            data: [0u8; MAX_OPUS_PACKET_SIZE],
        };
        queued.data[..len].copy_from_slice(&frame[..len]);
        if let Some(tx) = &self.tx {
            // A full queue means the network is behind; drop the frame
            let _ = tx.try_send(queued);
        }
    }
}

impl Drop for SendQueue {
    fn drop(&mut self) {
        // Disconnect the channel first so the thread's loop ends
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
