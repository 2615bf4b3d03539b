//! Voice session
//!
//! Ties signaling, the UDP transport and the audio devices together for one
//! call. The session runs on a dedicated OS thread with its own
//! single-threaded tokio runtime, because cpal streams are not `Send` and
//! must stay on the thread that created them.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parley_common::audio::{OPUS_SILENCE_FRAME, SILENCE_FRAME_COUNT, VOICE_FRAME_LEN};
use parley_common::gateway::{GatewayMessage, Identify};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::audio::{CaptureDevice, PlaybackDevice};
use super::capture::CapturePipeline;
use super::engine::{ReceiveNotice, VoiceEngine, VoiceEvent};
use super::gateway::{GatewaySocket, Heartbeater, SignalingAction, SignalingMachine, SignalingState};
use super::playback::Mixer;
use super::transport::{DISCOVERY_TIMEOUT, SendQueue, UdpTransport};
use crate::error::VoiceError;

// =============================================================================
// Constants
// =============================================================================

/// How often device health and speaker activity are checked
const MEDIA_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Peak level above which a speaker counts as speaking
const ACTIVITY_THRESHOLD: f32 = 0.01;

// =============================================================================
// Connection Parameters
// =============================================================================

/// Everything needed to join one call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    /// Relay host (optionally with port), or a full ws/wss URL
    pub endpoint: String,
    pub token: String,
    pub session_id: String,
    pub server_id: String,
    /// Current user identity
    pub user_id: String,
}

impl ConnectParams {
    fn identify(&self) -> Identify {
        Identify {
            server_id: self.server_id.clone(),
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            token: self.token.clone(),
        }
    }
}

// =============================================================================
// Session Runner
// =============================================================================

enum SessionCommand {
    Disconnect,
}

/// Running devices for an established session
#[derive(Default)]
struct Media {
    capture: Option<CaptureDevice>,
    playback: Option<PlaybackDevice>,
    encode_errors: u64,
}

struct Session {
    engine: VoiceEngine,
    machine: SignalingMachine,
    outbound: mpsc::UnboundedSender<GatewayMessage>,
    /// Handed to the transport receive thread
    notices: mpsc::UnboundedSender<ReceiveNotice>,
    heartbeat: Option<Heartbeater>,
    transport: Option<Arc<UdpTransport>>,
    media: Media,
    /// Last reported speaking state per SSRC
    activity: HashMap<u32, bool>,
}

impl Session {
    fn new(
        engine: VoiceEngine,
        params: &ConnectParams,
        outbound: mpsc::UnboundedSender<GatewayMessage>,
        notices: mpsc::UnboundedSender<ReceiveNotice>,
    ) -> Self {
        Self {
            engine,
            machine: SignalingMachine::new(params.identify()),
            outbound,
            notices,
            heartbeat: None,
            transport: None,
            media: Media::default(),
            activity: HashMap::new(),
        }
    }

    /// Drive the call until it ends or `commands` asks it to stop
    async fn run(
        &mut self,
        endpoint: &str,
        outbound_rx: &mut mpsc::UnboundedReceiver<GatewayMessage>,
        notices: &mut mpsc::UnboundedReceiver<ReceiveNotice>,
        commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Result<(), VoiceError> {
        self.engine
            .emit(VoiceEvent::StateChanged(SignalingState::Connecting));

        let mut socket = tokio::select! {
            socket = GatewaySocket::connect(endpoint) => socket?,
            _ = commands.recv() => return Ok(()),
        };
        self.transition(|machine| machine.opened());

        let mut poll = tokio::time::interval(MEDIA_POLL_INTERVAL);

        loop {
            tokio::select! {
                message = socket.next() => {
                    let Some(message) = message? else {
                        return Err(VoiceError::Disconnected);
                    };
                    let before = self.machine.state();
                    let actions = self.machine.on_message(message)?;
                    self.perform(actions, &mut socket).await?;
                    self.emit_state_change(before);
                }
                Some(message) = outbound_rx.recv() => {
                    socket.send(&message).await?;
                }
                Some(notice) = notices.recv() => {
                    self.on_notice(notice)?;
                }
                _ = poll.tick() => {
                    self.poll_media();
                }
                command = commands.recv() => {
                    match command {
                        Some(SessionCommand::Disconnect) | None => {
                            socket.close().await;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    fn transition(&mut self, change: impl FnOnce(&mut SignalingMachine)) {
        let before = self.machine.state();
        change(&mut self.machine);
        self.emit_state_change(before);
    }

    fn emit_state_change(&self, before: SignalingState) {
        let after = self.machine.state();
        if after != before {
            info!(from = %before, to = %after, "voice signaling state changed");
            self.engine.emit(VoiceEvent::StateChanged(after));
        }
    }

    /// Carry out signaling actions in order
    async fn perform(
        &mut self,
        actions: Vec<SignalingAction>,
        socket: &mut GatewaySocket,
    ) -> Result<(), VoiceError> {
        let mut pending: VecDeque<SignalingAction> = actions.into();

        while let Some(action) = pending.pop_front() {
            match action {
                SignalingAction::StartHeartbeat(interval) => {
                    self.heartbeat = Some(Heartbeater::spawn(interval, self.outbound.clone())?);
                }
                SignalingAction::Send(message) => socket.send(&message).await?,
                SignalingAction::ConnectTransport { ip, port, ssrc } => {
                    let transport = Arc::new(connect_transport(ip, port, ssrc).await?);
                    let discovered = {
                        let transport = Arc::clone(&transport);
                        tokio::task::spawn_blocking(move || transport.discover(DISCOVERY_TIMEOUT))
                            .await
                            .map_err(|e| VoiceError::Protocol(format!("discovery task failed: {}", e)))??
                    };
                    self.engine.set_local_ssrc(ssrc);
                    self.transport = Some(transport);
                    pending.extend(self.machine.on_discovered(discovered)?);
                }
                SignalingAction::InstallKey(key) => {
                    self.transport()?.set_secret_key(&key);
                }
                SignalingAction::SendSilence => {
                    let transport = self.transport()?;
                    for _ in 0..SILENCE_FRAME_COUNT {
                        transport.send_encrypted(&OPUS_SILENCE_FRAME)?;
                    }
                }
                SignalingAction::StartMedia => {
                    self.start_media()?;
                    self.engine.emit(VoiceEvent::Connected {
                        ssrc: self.engine.local_ssrc(),
                    });
                }
                SignalingAction::SpeakerMapped { ssrc, user_id } => {
                    self.map_speaker(ssrc, user_id)?;
                }
                SignalingAction::SpeakerSilent(ssrc) => self.speaker_silent(ssrc),
                SignalingAction::UserLeft(user_id) => {
                    if let Some(ssrc) = self.engine.registry().ssrc_for_user(&user_id) {
                        self.activity.remove(&ssrc);
                    }
                    self.engine.remove_user(&user_id);
                }
            }
        }
        Ok(())
    }

    /// Act on something the receive thread reported
    fn on_notice(&mut self, notice: ReceiveNotice) -> Result<(), VoiceError> {
        match notice {
            ReceiveNotice::UnknownSsrc(ssrc) => {
                if let Err(e) = self.engine.admit_unknown(ssrc) {
                    warn!(ssrc, "failed to add speaker: {}", e);
                }
                Ok(())
            }
            ReceiveNotice::TransportFailed(reason) => Err(VoiceError::TransportFailed(reason)),
        }
    }

    /// The relay reported that a speaker went quiet
    fn speaker_silent(&mut self, ssrc: u32) {
        let Some(speaker) = self.engine.registry().get(ssrc) else {
            return;
        };
        if self.activity.insert(ssrc, false) != Some(false) {
            self.engine.emit(VoiceEvent::SpeakerActivity {
                ssrc,
                user_id: speaker.user_id().map(str::to_string),
                speaking: false,
            });
        }
    }

    fn transport(&self) -> Result<&Arc<UdpTransport>, VoiceError> {
        self.transport.as_ref().ok_or(VoiceError::NotConnected)
    }

    /// Attach a user id to an SSRC, replacing an anonymous speaker
    fn map_speaker(&self, ssrc: u32, user_id: String) -> Result<(), VoiceError> {
        let registry = self.engine.registry();
        if let Some(existing) = registry.get(ssrc) {
            if existing.user_id() == Some(user_id.as_str()) {
                return Ok(());
            }
            self.engine.remove_speaker(ssrc);
        }
        if let Some(previous) = registry.ssrc_for_user(&user_id) {
            self.engine.remove_speaker(previous);
        }
        self.engine.add_speaker(ssrc, Some(user_id))?;
        Ok(())
    }

    /// Start receiving, then open playback and capture
    ///
    /// A device that fails is reported and left closed; the call carries on
    /// in the other direction.
    fn start_media(&mut self) -> Result<(), VoiceError> {
        let transport = Arc::clone(self.transport()?);
        transport.run(self.engine.receive_handler(self.notices.clone()))?;

        let settings = self.engine.settings();

        let mut mixer = Mixer::new(
            Arc::clone(self.engine.registry()),
            Arc::clone(self.engine.playback_controls()),
            VOICE_FRAME_LEN,
        );
        let playback = PlaybackDevice::open(&settings.output_device, move |out: &mut [f32]| {
            mixer.mix_into(out)
        })
        .and_then(|device| device.start().map(|()| device));
        match playback {
            Ok(device) => self.media.playback = Some(device),
            Err(e) => self.device_failed("playback", e),
        }

        let sink = SendQueue::spawn(transport)?;
        let pipeline = CapturePipeline::new(
            Arc::clone(self.engine.capture_controls()),
            Box::new(sink),
        )?;
        let capture = CaptureDevice::open(&settings.input_device, move |period: &[f32]| {
            pipeline.process_period(period);
        })
        .and_then(|device| device.start().map(|()| device));
        match capture {
            Ok(device) => self.media.capture = Some(device),
            Err(e) => self.device_failed("capture", e),
        }

        Ok(())
    }

    fn device_failed(&self, direction: &str, error: VoiceError) {
        warn!("{} device failed: {}", direction, error);
        self.engine
            .emit(VoiceEvent::DeviceError(format!("{}: {}", direction, error)));
    }

    /// Periodic housekeeping on the session thread
    fn poll_media(&mut self) {
        if let Some(err) = self.media.capture.as_ref().and_then(|d| d.check_error()) {
            self.media.capture = None;
            self.device_failed("capture", VoiceError::Device(err));
        }
        if let Some(err) = self.media.playback.as_ref().and_then(|d| d.check_error()) {
            self.media.playback = None;
            self.device_failed("playback", VoiceError::Device(err));
        }

        let encode_errors = self.engine.capture_controls().encode_errors();
        if encode_errors > self.media.encode_errors {
            warn!(
                failed = encode_errors - self.media.encode_errors,
                "capture frames failed to encode"
            );
            self.media.encode_errors = encode_errors;
        }

        let speakers = self.engine.registry().all();
        self.activity
            .retain(|ssrc, _| speakers.iter().any(|s| s.ssrc() == *ssrc));
        for speaker in speakers {
            let speaking = speaker.level() > ACTIVITY_THRESHOLD;
            let previous = self.activity.insert(speaker.ssrc(), speaking).unwrap_or(false);
            if speaking != previous {
                self.engine.emit(VoiceEvent::SpeakerActivity {
                    ssrc: speaker.ssrc(),
                    user_id: speaker.user_id().map(str::to_string),
                    speaking,
                });
            }
        }
    }

    /// Release everything: devices, heartbeat, transport, decoders
    fn teardown(&mut self) {
        self.media.capture = None;
        self.media.playback = None;
        if let Some(mut heartbeat) = self.heartbeat.take() {
            heartbeat.stop();
        }
        if let Some(transport) = self.transport.take() {
            transport.stop();
        }
        self.engine.shutdown();
        self.activity.clear();
        self.machine.close();
    }
}

async fn connect_transport(ip: String, port: u16, ssrc: u32) -> Result<UdpTransport, VoiceError> {
    tokio::task::spawn_blocking(move || {
        let transport = UdpTransport::connect(&ip, port)?;
        transport.set_ssrc(ssrc);
        Ok(transport)
    })
    .await
    .map_err(|e| VoiceError::Protocol(format!("transport task failed: {}", e)))?
}

async fn run_session(
    engine: VoiceEngine,
    params: ConnectParams,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    notice_tx: mpsc::UnboundedSender<ReceiveNotice>,
    mut notices: mpsc::UnboundedReceiver<ReceiveNotice>,
) {
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel();
    let mut session = Session::new(engine.clone(), &params, outbound, notice_tx);

    let result = session
        .run(&params.endpoint, &mut outbound_rx, &mut notices, &mut commands)
        .await;
    session.teardown();

    let reason = match result {
        Ok(()) => {
            info!("voice session ended");
            None
        }
        Err(e) => {
            error!("voice session failed: {}", e);
            Some(e.to_string())
        }
    };
    engine.emit(VoiceEvent::StateChanged(SignalingState::Disconnected));
    engine.emit(VoiceEvent::Disconnected(reason));
}

// =============================================================================
// Voice Connection Handle
// =============================================================================

/// Handle for one active call
pub struct VoiceConnection {
    command_tx: mpsc::UnboundedSender<SessionCommand>,
    handle: Option<JoinHandle<()>>,
}

impl VoiceConnection {
    /// Join a call
    ///
    /// Returns immediately; progress is reported through the engine's
    /// `VoiceEvent`s.
    pub fn connect(engine: VoiceEngine, params: ConnectParams) -> Result<Self, VoiceError> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (notice_tx, notices) = mpsc::unbounded_channel();

        let handle = std::thread::Builder::new()
            .name("parley-voice".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("failed to create voice runtime: {}", e);
                        engine.emit(VoiceEvent::Disconnected(Some(e.to_string())));
                        return;
                    }
                };
                runtime.block_on(run_session(engine, params, command_rx, notice_tx, notices));
            })?;

        Ok(Self {
            command_tx,
            handle: Some(handle),
        })
    }

    /// Whether the session thread has exited
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Leave the call and wait for teardown to finish
    pub fn disconnect(&mut self) {
        let _ = self.command_tx.send(SessionCommand::Disconnect);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("voice session thread panicked");
        }
    }
}

impl Drop for VoiceConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}
