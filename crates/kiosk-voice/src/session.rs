//! Session lifecycle: acquire resources, run the session task, release.
//!
//! [`SessionController`] is what the kiosk front end holds. `connect()`
//! acquires the output context, the input context, the microphone and the
//! live channel, in that order, and rolls everything back if any step fails.
//! On success a single tokio task owns the resources and the protocol handler
//! and multiplexes channel events, playback completions and microphone blocks
//! until it is cancelled or the channel ends.
//!
//! `disconnect()` cancels that task and waits for it, so every resource is
//! released before it returns. It is safe to call at any time, any number of
//! times.

use std::sync::Arc;
use std::time::Duration;

use kiosk_core::{
    ConnectionStatus, KioskSettings, Menu, SessionObserver, SharedTranscript, Transcript,
    validate_settings,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio_io::{AudioBackend, InputContext, Microphone, OutputDevice};
use crate::capture::CapturePipeline;
use crate::channel::{ChannelConnector, ChannelEvent, LiveChannel, SessionSetup};
use crate::codec::{CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE};
use crate::error::VoiceError;
use crate::playback::{PlaybackId, PlaybackScheduler};
use crate::protocol::{CloseReason, Flow, SessionIo, SessionProtocol, SessionSignals};
use crate::tools::{UPDATE_ORDER, update_order_declaration};

/// Instruction used when the settings do not provide one.
pub fn default_system_instruction(menu: &Menu) -> String {
    format!(
        "You are the voice ordering assistant at a restaurant kiosk. \
         Keep replies short and friendly.\n\nMenu:\n{}\n\n\
         Whenever the customer orders something, call {UPDATE_ORDER} with the \
         item names and quantities.",
        menu.reference_lines()
    )
}

// ── Resources ──────────────────────────────────────────────────────

/// Everything a live session holds. Fields are `None` until acquired and
/// again after release.
///
/// Dropping the struct releases whatever is still held, so a cancelled
/// `connect()` or a panicking session task cannot leak devices.
pub struct SessionResources {
    session_id: String,
    output: Option<Box<dyn OutputDevice>>,
    input: Option<Box<dyn InputContext>>,
    microphone: Option<Box<dyn Microphone>>,
    channel: Option<Box<dyn LiveChannel>>,
}

/// Outcome of [`SessionResources::release_all`].
#[derive(Debug, Default)]
pub struct ReleaseReport {
    pub released: usize,
    pub failures: Vec<(&'static str, VoiceError)>,
}

impl ReleaseReport {
    fn record(&mut self, step: &'static str, result: Result<(), VoiceError>) {
        self.released += 1;
        if let Err(e) = result {
            self.failures.push((step, e));
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

impl SessionResources {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            output: None,
            input: None,
            microphone: None,
            channel: None,
        }
    }

    /// The channel and output context, if both are held.
    pub fn io(&self) -> Option<SessionIo<'_>> {
        Some(SessionIo {
            channel: self.channel.as_deref()?,
            output: self.output.as_deref()?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.output.is_none()
            && self.input.is_none()
            && self.microphone.is_none()
            && self.channel.is_none()
    }

    /// Release everything held. Every step runs even if an earlier one
    /// fails; failures are logged and collected, never returned.
    pub fn release_all(&mut self) -> ReleaseReport {
        let mut report = ReleaseReport::default();

        if let Some(microphone) = self.microphone.take() {
            report.record("microphone", microphone.stop());
        }
        if let Some(channel) = self.channel.take() {
            report.record("channel", channel.close());
        }
        if let Some(input) = self.input.take() {
            report.record("input context", input.close());
        }
        if let Some(output) = self.output.take() {
            report.record("output context", output.close());
        }

        for (step, error) in &report.failures {
            tracing::warn!(session_id = %self.session_id, step, %error, "Release step failed");
        }
        report
    }
}

impl Drop for SessionResources {
    fn drop(&mut self) {
        if !self.is_empty() {
            let report = self.release_all();
            tracing::warn!(
                session_id = %self.session_id,
                released = report.released,
                "Session resources released on drop"
            );
        }
    }
}

// ── Session task ───────────────────────────────────────────────────

/// How a session task finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// `disconnect()` was called.
    Cancelled,
    RemoteClosed(String),
    ChannelError(String),
    /// The channel never reported ready.
    OpenTimeout,
    MicrophoneFailed(String),
}

impl SessionEnd {
    const fn final_status(&self) -> ConnectionStatus {
        match self {
            Self::Cancelled | Self::RemoteClosed(_) => ConnectionStatus::Disconnected,
            Self::ChannelError(_) | Self::OpenTimeout | Self::MicrophoneFailed(_) => {
                ConnectionStatus::Error
            }
        }
    }
}

enum Step {
    Channel(ChannelEvent),
    PlaybackEnded(PlaybackId),
    Capture(Vec<f32>),
    CaptureEnded,
    Stop(SessionEnd),
}

struct LiveSession {
    id: String,
    protocol: SessionProtocol,
    resources: SessionResources,
    events: mpsc::Receiver<ChannelEvent>,
    ended_rx: mpsc::UnboundedReceiver<PlaybackId>,
    capture_rx: Option<mpsc::UnboundedReceiver<Vec<f32>>>,
    cancel: CancellationToken,
    signals: SessionSignals,
    open_timeout: Duration,
    finished: bool,
}

/// A session task that unwinds or is aborted never reaches `teardown`;
/// report it as an error. Resources are released by their own drop.
impl Drop for LiveSession {
    fn drop(&mut self) {
        if !self.finished {
            tracing::error!(session_id = %self.id, "Live session task ended abnormally");
            self.protocol.shutdown();
            self.signals.set_status(ConnectionStatus::Error);
        }
    }
}

/// Puts the status to `Error` if `connect()` is abandoned before it
/// finishes, for example when its future is dropped mid-await.
struct ConnectingGuard {
    signals: SessionSignals,
    armed: bool,
}

impl ConnectingGuard {
    fn new(signals: SessionSignals) -> Self {
        signals.set_status(ConnectionStatus::Connecting);
        Self {
            signals,
            armed: true,
        }
    }

    const fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ConnectingGuard {
    fn drop(&mut self) {
        if self.armed {
            self.signals.set_status(ConnectionStatus::Error);
        }
    }
}

async fn next_block(rx: &mut Option<mpsc::UnboundedReceiver<Vec<f32>>>) -> Option<Vec<f32>> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl LiveSession {
    async fn run(mut self) -> SessionEnd {
        let open_deadline = tokio::time::sleep(self.open_timeout);
        tokio::pin!(open_deadline);
        let mut opened = false;

        let end = loop {
            let step = tokio::select! {
                () = self.cancel.cancelled() => Step::Stop(SessionEnd::Cancelled),
                event = self.events.recv() => match event {
                    Some(event) => Step::Channel(event),
                    None => Step::Stop(SessionEnd::RemoteClosed("event stream ended".to_string())),
                },
                Some(id) = self.ended_rx.recv() => Step::PlaybackEnded(id),
                block = next_block(&mut self.capture_rx) => match block {
                    Some(block) => Step::Capture(block),
                    None => Step::CaptureEnded,
                },
                () = &mut open_deadline, if !opened => Step::Stop(SessionEnd::OpenTimeout),
            };

            match step {
                Step::Channel(event) => {
                    let Some(io) = self.resources.io() else {
                        break SessionEnd::ChannelError("session resources missing".to_string());
                    };
                    match self.protocol.handle_event(event, &io) {
                        Flow::Continue => {}
                        Flow::StartCapture => {
                            opened = true;
                            self.signals.set_status(ConnectionStatus::Connected);
                            if let Err(e) = self.start_capture() {
                                tracing::error!(session_id = %self.id, error = %e, "Failed to start microphone");
                                break SessionEnd::MicrophoneFailed(e.to_string());
                            }
                        }
                        Flow::Close(CloseReason::RemoteClosed(reason)) => {
                            break SessionEnd::RemoteClosed(reason);
                        }
                        Flow::Close(CloseReason::ChannelError(message)) => {
                            break SessionEnd::ChannelError(message);
                        }
                    }
                }
                Step::PlaybackEnded(id) => self.protocol.on_playback_ended(id),
                Step::Capture(block) => {
                    if let Some(channel) = self.resources.channel.as_deref() {
                        self.protocol.on_capture_block(&block, channel);
                    }
                }
                Step::CaptureEnded => {
                    tracing::warn!(session_id = %self.id, "Microphone stream ended, continuing without capture");
                    self.capture_rx = None;
                    self.protocol.on_capture_ended();
                }
                Step::Stop(end) => break end,
            }
        };

        self.teardown(&end);
        end
    }

    fn start_capture(&mut self) -> Result<(), VoiceError> {
        let microphone = self
            .resources
            .microphone
            .as_deref()
            .ok_or(VoiceError::NoInputDevice)?;
        let (tx, rx) = mpsc::unbounded_channel();
        microphone.start(tx)?;
        self.capture_rx = Some(rx);
        tracing::info!(
            session_id = %self.id,
            sample_rate = microphone.sample_rate(),
            "Capture started"
        );
        Ok(())
    }

    fn teardown(&mut self, end: &SessionEnd) {
        self.protocol.shutdown();
        self.capture_rx = None;
        let report = self.resources.release_all();
        self.signals.set_status(end.final_status());
        self.finished = true;
        tracing::info!(
            session_id = %self.id,
            end = ?end,
            released = report.released,
            failures = report.failures.len(),
            "Live session closed"
        );
    }
}

// ── Controller ─────────────────────────────────────────────────────

struct ActiveSession {
    id: String,
    cancel: CancellationToken,
    task: JoinHandle<SessionEnd>,
}

/// Owns at most one live session at a time.
pub struct SessionController {
    settings: KioskSettings,
    menu: Arc<Menu>,
    backend: Arc<dyn AudioBackend>,
    connector: Arc<dyn ChannelConnector>,
    signals: SessionSignals,
    transcript: SharedTranscript,
    active: Option<ActiveSession>,
}

impl SessionController {
    pub fn new(
        settings: KioskSettings,
        menu: Menu,
        backend: Arc<dyn AudioBackend>,
        connector: Arc<dyn ChannelConnector>,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        Self {
            settings,
            menu: Arc::new(menu),
            backend,
            connector,
            signals: SessionSignals::new(observer),
            transcript: SharedTranscript::new(),
            active: None,
        }
    }

    pub const fn settings(&self) -> &KioskSettings {
        &self.settings
    }

    pub fn menu(&self) -> &Menu {
        &self.menu
    }

    pub fn status(&self) -> ConnectionStatus {
        self.signals.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.signals.subscribe_status()
    }

    pub fn is_agent_talking(&self) -> bool {
        self.signals.is_talking()
    }

    pub fn subscribe_talking(&self) -> watch::Receiver<bool> {
        self.signals.subscribe_talking()
    }

    /// Snapshot of the conversation so far.
    pub fn transcript(&self) -> Transcript {
        self.transcript.snapshot()
    }

    pub fn shared_transcript(&self) -> SharedTranscript {
        self.transcript.clone()
    }

    /// Forget the conversation (between customers).
    pub fn clear_transcript(&self) {
        self.transcript.clear();
    }

    /// Whether a session task is still running.
    pub fn is_active(&self) -> bool {
        self.active.as_ref().is_some_and(|a| !a.task.is_finished())
    }

    pub fn session_id(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.id.as_str())
    }

    fn session_setup(&self) -> SessionSetup {
        SessionSetup {
            model: self.settings.effective_model().to_string(),
            voice_name: self.settings.effective_voice().to_string(),
            system_instruction: self
                .settings
                .system_instruction
                .clone()
                .unwrap_or_else(|| default_system_instruction(&self.menu)),
            tools: vec![update_order_declaration()],
        }
    }

    /// Acquire every resource and start the session task.
    ///
    /// On failure everything acquired so far is released, the status becomes
    /// `Error`, and the error is returned.
    pub async fn connect(&mut self) -> Result<(), VoiceError> {
        if self.is_active() {
            return Err(VoiceError::AlreadyActive);
        }
        if let Err(e) = validate_settings(&self.settings) {
            tracing::error!(error = %e, "Refusing to connect with invalid settings");
            self.signals.set_status(ConnectionStatus::Error);
            return Err(e.into());
        }
        if let Some(finished) = self.active.take() {
            let _ = finished.task.await;
        }

        let session_id = Uuid::new_v4().to_string();
        let mut connecting = ConnectingGuard::new(self.signals.clone());
        tracing::info!(
            session_id = %session_id,
            model = self.settings.effective_model(),
            "Connecting live session"
        );

        let mut resources = SessionResources::new(session_id.clone());
        let (events, capture) = match self.acquire(&mut resources).await {
            Ok(acquired) => acquired,
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Live session connect failed");
                resources.release_all();
                return Err(e);
            }
        };
        connecting.disarm();

        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let mut protocol = SessionProtocol::new(
            session_id.clone(),
            self.settings.effective_greeting(),
            Arc::clone(&self.menu),
            PlaybackScheduler::new(ended_tx),
            capture,
            self.transcript.clone(),
            self.signals.clone(),
        );
        protocol.begin_opening();

        let cancel = CancellationToken::new();
        let session = LiveSession {
            id: session_id.clone(),
            protocol,
            resources,
            events,
            ended_rx,
            capture_rx: None,
            cancel: cancel.clone(),
            signals: self.signals.clone(),
            open_timeout: self.settings.effective_open_timeout(),
            finished: false,
        };

        self.active = Some(ActiveSession {
            id: session_id,
            cancel,
            task: tokio::spawn(session.run()),
        });
        Ok(())
    }

    /// Acquire in order: output context, input context, microphone, channel.
    async fn acquire(
        &self,
        resources: &mut SessionResources,
    ) -> Result<(mpsc::Receiver<ChannelEvent>, CapturePipeline), VoiceError> {
        resources.output = Some(self.backend.open_output(PLAYBACK_SAMPLE_RATE)?);

        let input = self.backend.open_input(CAPTURE_SAMPLE_RATE)?;
        let microphone = input.open_microphone();
        resources.input = Some(input);
        let microphone = microphone?;

        let capture = CapturePipeline::new(
            microphone.sample_rate(),
            self.settings.effective_chunk_samples(),
        );
        resources.microphone = Some(microphone);
        let capture = capture?;

        let pair = self.connector.connect(&self.session_setup()).await?;
        resources.channel = Some(pair.channel);
        Ok((pair.events, capture))
    }

    /// Stop the session and release everything. Idempotent; valid when no
    /// session was ever started.
    pub async fn disconnect(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            match active.task.await {
                Ok(end) => tracing::info!(session_id = %active.id, ?end, "Live session ended"),
                Err(e) => tracing::error!(session_id = %active.id, error = %e, "Live session task failed"),
            }
        }
        self.signals.set_talking(false);
        self.signals.set_status(ConnectionStatus::Disconnected);
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
        }
    }
}
