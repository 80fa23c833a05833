//! Session protocol: turns channel events into playback, transcript, cart
//! and tool-response side effects.
//!
//! ```text
//! Idle ──begin_opening──▶ Opening ──Opened──▶ Open ──Closed/Error/shutdown──▶ Closed
//! ```
//!
//! Messages are only acted on while `Open`. Within one message an
//! interruption wins outright; otherwise audio is scheduled first, then
//! transcripts (agent before user), then tool calls.

use std::sync::Arc;

use kiosk_core::{ConnectionStatus, Menu, Role, SessionObserver, SharedTranscript};
use tokio::sync::watch;

use crate::audio_io::OutputDevice;
use crate::capture::CapturePipeline;
use crate::channel::{ChannelEvent, LiveChannel, OutboundMessage, ServerMessage};
use crate::codec::{self, PLAYBACK_SAMPLE_RATE};
use crate::playback::{PlaybackId, PlaybackScheduler};
use crate::tools::{self, ToolInvocation};

/// Protocol state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    Idle,
    Opening,
    Open,
    Closed,
}

/// One unit of inbound work, in dispatch order.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Interrupted,
    AudioDelta(String),
    OutputTranscript(String),
    InputTranscript(String),
    ToolCall(Vec<ToolInvocation>),
    TurnComplete,
}

/// Split a server message into events in the order they must be applied.
///
/// An interruption discards everything else carried by the same message.
pub fn inbound_events(message: ServerMessage) -> Vec<InboundEvent> {
    if message.interrupted {
        return vec![InboundEvent::Interrupted];
    }

    let mut events: Vec<InboundEvent> = message
        .audio
        .into_iter()
        .map(InboundEvent::AudioDelta)
        .collect();
    if let Some(text) = message.output_transcript {
        events.push(InboundEvent::OutputTranscript(text));
    }
    if let Some(text) = message.input_transcript {
        events.push(InboundEvent::InputTranscript(text));
    }
    if !message.tool_calls.is_empty() {
        events.push(InboundEvent::ToolCall(message.tool_calls));
    }
    if message.turn_complete {
        events.push(InboundEvent::TurnComplete);
    }
    events
}

/// Why the protocol asked the session to close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    RemoteClosed(String),
    ChannelError(String),
}

/// What the session loop should do after an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The channel just opened: start the microphone.
    StartCapture,
    Close(CloseReason),
}

/// Resources the protocol needs for one call, lent by the session.
pub struct SessionIo<'a> {
    pub channel: &'a dyn LiveChannel,
    pub output: &'a dyn OutputDevice,
}

/// Status and talking flags, published on watch channels and mirrored to the
/// observer. Change notifications fire only on actual changes.
#[derive(Clone)]
pub struct SessionSignals {
    status: Arc<watch::Sender<ConnectionStatus>>,
    talking: Arc<watch::Sender<bool>>,
    observer: Arc<dyn SessionObserver>,
}

impl SessionSignals {
    pub fn new(observer: Arc<dyn SessionObserver>) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (talking, _) = watch::channel(false);
        Self {
            status: Arc::new(status),
            talking: Arc::new(talking),
            observer,
        }
    }

    pub fn observer(&self) -> &Arc<dyn SessionObserver> {
        &self.observer
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            tracing::debug!(%status, "Connection status changed");
            self.observer.on_status_change(status);
        }
    }

    pub fn is_talking(&self) -> bool {
        *self.talking.borrow()
    }

    pub fn subscribe_talking(&self) -> watch::Receiver<bool> {
        self.talking.subscribe()
    }

    pub fn set_talking(&self, talking: bool) {
        let changed = self.talking.send_if_modified(|current| {
            if *current == talking {
                return false;
            }
            *current = talking;
            true
        });
        if changed {
            self.observer.on_talking_change(talking);
        }
    }
}

/// Per-session protocol handler. Owned by the session task.
pub struct SessionProtocol {
    session_id: String,
    state: ProtocolState,
    greeting: String,
    menu: Arc<Menu>,
    scheduler: PlaybackScheduler,
    capture: CapturePipeline,
    transcript: SharedTranscript,
    signals: SessionSignals,
}

impl SessionProtocol {
    pub fn new(
        session_id: impl Into<String>,
        greeting: impl Into<String>,
        menu: Arc<Menu>,
        scheduler: PlaybackScheduler,
        capture: CapturePipeline,
        transcript: SharedTranscript,
        signals: SessionSignals,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            state: ProtocolState::Idle,
            greeting: greeting.into(),
            menu,
            scheduler,
            capture,
            transcript,
            signals,
        }
    }

    pub const fn state(&self) -> ProtocolState {
        self.state
    }

    pub const fn scheduler(&self) -> &PlaybackScheduler {
        &self.scheduler
    }

    pub const fn is_open(&self) -> bool {
        matches!(self.state, ProtocolState::Open)
    }

    pub fn begin_opening(&mut self) {
        if self.state == ProtocolState::Idle {
            self.state = ProtocolState::Opening;
        }
    }

    /// Handle one channel event.
    pub fn handle_event(&mut self, event: ChannelEvent, io: &SessionIo<'_>) -> Flow {
        match event {
            ChannelEvent::Opened => self.on_opened(io),
            ChannelEvent::Message(message) => {
                if self.state == ProtocolState::Open {
                    self.dispatch(message, io);
                } else {
                    tracing::debug!(
                        session_id = %self.session_id,
                        state = ?self.state,
                        "Dropping message received outside open state"
                    );
                }
                Flow::Continue
            }
            ChannelEvent::Closed { reason } => {
                self.state = ProtocolState::Closed;
                tracing::info!(session_id = %self.session_id, %reason, "Live channel closed by remote");
                Flow::Close(CloseReason::RemoteClosed(reason))
            }
            ChannelEvent::Error { message } => {
                self.state = ProtocolState::Closed;
                tracing::error!(session_id = %self.session_id, error = %message, "Live channel error");
                Flow::Close(CloseReason::ChannelError(message))
            }
        }
    }

    fn on_opened(&mut self, io: &SessionIo<'_>) -> Flow {
        if self.state != ProtocolState::Opening {
            tracing::debug!(
                session_id = %self.session_id,
                state = ?self.state,
                "Ignoring duplicate open signal"
            );
            return Flow::Continue;
        }
        self.state = ProtocolState::Open;
        tracing::info!(session_id = %self.session_id, "Live channel open, sending greeting");

        if let Err(e) = io.channel.send(OutboundMessage::Text(self.greeting.clone())) {
            tracing::warn!(session_id = %self.session_id, error = %e, "Failed to send greeting");
        }
        Flow::StartCapture
    }

    /// Apply every event of one server message, in order.
    pub fn dispatch(&mut self, message: ServerMessage, io: &SessionIo<'_>) {
        for event in inbound_events(message) {
            match event {
                InboundEvent::Interrupted => self.interrupt(io.output),
                InboundEvent::AudioDelta(payload) => self.play_audio(&payload, io.output),
                InboundEvent::OutputTranscript(text) => self.record_transcript(&text, Role::Agent),
                InboundEvent::InputTranscript(text) => self.record_transcript(&text, Role::User),
                InboundEvent::ToolCall(invocations) => self.handle_tool_calls(&invocations, io),
                InboundEvent::TurnComplete => {
                    tracing::debug!(session_id = %self.session_id, "Agent turn complete");
                }
            }
        }
    }

    /// Cut off all agent audio immediately.
    pub fn interrupt(&mut self, output: &dyn OutputDevice) {
        let stopped = self.scheduler.interrupt(output.current_time());
        self.signals.set_talking(false);
        tracing::info!(session_id = %self.session_id, stopped, "Agent interrupted");
    }

    fn play_audio(&mut self, payload: &str, output: &dyn OutputDevice) {
        let buffer = match codec::decode_payload(payload, PLAYBACK_SAMPLE_RATE, 1) {
            Ok(buffer) => buffer,
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "Skipping malformed audio delta");
                return;
            }
        };
        match self.scheduler.schedule(output, &buffer) {
            Ok(Some(_)) => self.signals.set_talking(true),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "Failed to schedule agent audio");
            }
        }
    }

    fn record_transcript(&self, text: &str, role: Role) {
        if text.is_empty() {
            return;
        }
        self.transcript.append(text, role);
        self.signals
            .observer()
            .on_transcript_update(text, role.is_user());
    }

    fn handle_tool_calls(&self, invocations: &[ToolInvocation], io: &SessionIo<'_>) {
        for invocation in invocations {
            let outcome = tools::handle_invocation(invocation, &self.menu);
            if !outcome.lines.is_empty() {
                self.signals.observer().on_order_update(outcome.lines);
            }
            if let Err(e) = io
                .channel
                .send(OutboundMessage::ToolResponse(outcome.response))
            {
                tracing::warn!(
                    session_id = %self.session_id,
                    call_id = %invocation.id,
                    error = %e,
                    "Failed to send tool response"
                );
            }
        }
    }

    /// A scheduled buffer finished on its own.
    pub fn on_playback_ended(&mut self, id: PlaybackId) {
        if self.scheduler.on_ended(id) {
            self.signals.set_talking(false);
        }
    }

    /// Encode a microphone block and forward the resulting frames.
    pub fn on_capture_block(&mut self, block: &[f32], channel: &dyn LiveChannel) {
        if self.state != ProtocolState::Open {
            return;
        }
        let frames = match self.capture.process(block) {
            Ok(frames) => frames,
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "Dropping capture block");
                return;
            }
        };
        for frame in frames {
            if let Err(e) = channel.send(OutboundMessage::Audio(frame)) {
                tracing::warn!(session_id = %self.session_id, error = %e, "Dropping capture frame");
            }
        }
    }

    /// Microphone stream ended; forget any partial chunk.
    pub fn on_capture_ended(&mut self) {
        self.capture.reset();
    }

    /// Silence everything and enter the terminal state.
    pub fn shutdown(&mut self) {
        let stopped = self.scheduler.stop_all();
        self.capture.reset();
        self.state = ProtocolState::Closed;
        self.signals.set_talking(false);
        tracing::debug!(session_id = %self.session_id, stopped, "Session protocol closed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use kiosk_core::{NoopObserver, OrderLine};
    use mockall::predicate::always;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::audio_io::{EndedCallback, PlayingSource};
    use crate::channel::MockLiveChannel;
    use crate::codec::{CAPTURE_SAMPLE_RATE, DecodedBuffer};
    use crate::error::VoiceError;

    struct SilentSource;

    impl PlayingSource for SilentSource {
        fn stop(&self) {}
    }

    #[derive(Default)]
    struct ClockOutput {
        now_ms: Mutex<u64>,
    }

    impl OutputDevice for ClockOutput {
        fn sample_rate(&self) -> u32 {
            PLAYBACK_SAMPLE_RATE
        }
        fn current_time(&self) -> Duration {
            Duration::from_millis(*self.now_ms.lock().unwrap())
        }
        fn play_at(
            &self,
            _buffer: &DecodedBuffer,
            _start: Duration,
            _on_ended: EndedCallback,
        ) -> Result<Box<dyn PlayingSource>, VoiceError> {
            Ok(Box::new(SilentSource))
        }
        fn close(&self) -> Result<(), VoiceError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        orders: Mutex<Vec<OrderLine>>,
        transcripts: Mutex<Vec<(String, bool)>>,
        talking: Mutex<Vec<bool>>,
    }

    impl SessionObserver for RecordingObserver {
        fn on_order_update(&self, lines: Vec<OrderLine>) {
            self.orders.lock().unwrap().extend(lines);
        }
        fn on_transcript_update(&self, text: &str, is_user: bool) {
            self.transcripts
                .lock()
                .unwrap()
                .push((text.to_string(), is_user));
        }
        fn on_talking_change(&self, talking: bool) {
            self.talking.lock().unwrap().push(talking);
        }
    }

    fn protocol(observer: Arc<dyn SessionObserver>) -> (SessionProtocol, SharedTranscript) {
        let (ended_tx, _ended_rx) = mpsc::unbounded_channel();
        let transcript = SharedTranscript::new();
        let protocol = SessionProtocol::new(
            "test-session",
            "Say hello",
            Arc::new(Menu::house_menu()),
            PlaybackScheduler::new(ended_tx),
            CapturePipeline::new(CAPTURE_SAMPLE_RATE, 4).unwrap(),
            transcript.clone(),
            SessionSignals::new(observer),
        );
        (protocol, transcript)
    }

    fn audio_payload(samples: usize) -> String {
        codec::encode(&vec![0.1; samples], PLAYBACK_SAMPLE_RATE).to_base64()
    }

    #[test]
    fn test_inbound_events_order() {
        let events = inbound_events(ServerMessage {
            audio: vec!["a".into(), "b".into()],
            output_transcript: Some("out".into()),
            input_transcript: Some("in".into()),
            turn_complete: true,
            ..Default::default()
        });
        assert_eq!(
            events,
            vec![
                InboundEvent::AudioDelta("a".into()),
                InboundEvent::AudioDelta("b".into()),
                InboundEvent::OutputTranscript("out".into()),
                InboundEvent::InputTranscript("in".into()),
                InboundEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn test_interruption_discards_rest_of_message() {
        let events = inbound_events(ServerMessage {
            interrupted: true,
            audio: vec!["a".into()],
            output_transcript: Some("late".into()),
            ..Default::default()
        });
        assert_eq!(events, vec![InboundEvent::Interrupted]);
    }

    #[test]
    fn test_open_sends_greeting_once() {
        let (mut protocol, _) = protocol(Arc::new(NoopObserver));
        let output = ClockOutput::default();
        let mut channel = MockLiveChannel::new();
        channel
            .expect_send()
            .withf(|m| matches!(m, OutboundMessage::Text(t) if t == "Say hello"))
            .times(1)
            .returning(|_| Ok(()));
        let io = SessionIo {
            channel: &channel,
            output: &output,
        };

        protocol.begin_opening();
        assert_eq!(protocol.handle_event(ChannelEvent::Opened, &io), Flow::StartCapture);
        assert_eq!(protocol.handle_event(ChannelEvent::Opened, &io), Flow::Continue);
        assert!(protocol.is_open());
    }

    #[test]
    fn test_messages_dropped_before_open() {
        let observer = Arc::new(RecordingObserver::default());
        let (mut protocol, transcript) = protocol(observer.clone());
        let output = ClockOutput::default();
        let mut channel = MockLiveChannel::new();
        channel.expect_send().never();
        let io = SessionIo {
            channel: &channel,
            output: &output,
        };

        protocol.begin_opening();
        let flow = protocol.handle_event(
            ChannelEvent::Message(ServerMessage {
                output_transcript: Some("early".into()),
                ..Default::default()
            }),
            &io,
        );
        assert_eq!(flow, Flow::Continue);
        assert!(transcript.snapshot().is_empty());
        assert!(observer.transcripts.lock().unwrap().is_empty());
    }

    #[test]
    fn test_audio_and_transcripts_dispatch() {
        let observer = Arc::new(RecordingObserver::default());
        let (mut protocol, transcript) = protocol(observer.clone());
        let output = ClockOutput::default();
        let mut channel = MockLiveChannel::new();
        channel.expect_send().returning(|_| Ok(()));
        let io = SessionIo {
            channel: &channel,
            output: &output,
        };
        protocol.begin_opening();
        protocol.handle_event(ChannelEvent::Opened, &io);

        protocol.dispatch(
            ServerMessage {
                audio: vec![audio_payload(240)],
                output_transcript: Some("Vana".into()),
                ..Default::default()
            },
            &io,
        );
        protocol.dispatch(
            ServerMessage {
                output_transcript: Some("kkam".into()),
                input_transcript: Some("Hi".into()),
                ..Default::default()
            },
            &io,
        );

        assert_eq!(protocol.scheduler().active_count(), 1);
        assert_eq!(*observer.talking.lock().unwrap(), vec![true]);

        let snapshot = transcript.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.utterances()[0].text, "Vanakkam");
        assert_eq!(snapshot.utterances()[0].role, Role::Agent);
        assert_eq!(snapshot.utterances()[1].role, Role::User);
        assert_eq!(
            *observer.transcripts.lock().unwrap(),
            vec![
                ("Vana".to_string(), false),
                ("kkam".to_string(), false),
                ("Hi".to_string(), true)
            ]
        );
    }

    #[test]
    fn test_malformed_audio_is_skipped() {
        let (mut protocol, transcript) = protocol(Arc::new(NoopObserver));
        let output = ClockOutput::default();
        let mut channel = MockLiveChannel::new();
        channel.expect_send().returning(|_| Ok(()));
        let io = SessionIo {
            channel: &channel,
            output: &output,
        };
        protocol.begin_opening();
        protocol.handle_event(ChannelEvent::Opened, &io);

        protocol.dispatch(
            ServerMessage {
                audio: vec!["%%%".into()],
                output_transcript: Some("still here".into()),
                ..Default::default()
            },
            &io,
        );
        assert!(!protocol.scheduler().is_active());
        assert_eq!(transcript.snapshot().len(), 1);
    }

    #[test]
    fn test_interrupt_silences_and_resets_clock() {
        let observer = Arc::new(RecordingObserver::default());
        let (mut protocol, _) = protocol(observer.clone());
        let output = ClockOutput::default();
        let mut channel = MockLiveChannel::new();
        channel.expect_send().returning(|_| Ok(()));
        let io = SessionIo {
            channel: &channel,
            output: &output,
        };
        protocol.begin_opening();
        protocol.handle_event(ChannelEvent::Opened, &io);

        protocol.dispatch(
            ServerMessage {
                audio: vec![audio_payload(2400), audio_payload(2400)],
                ..Default::default()
            },
            &io,
        );
        assert_eq!(protocol.scheduler().active_count(), 2);

        *output.now_ms.lock().unwrap() = 30;
        protocol.dispatch(
            ServerMessage {
                interrupted: true,
                ..Default::default()
            },
            &io,
        );
        assert!(!protocol.scheduler().is_active());
        assert_eq!(
            protocol.scheduler().clock().next_start(),
            Duration::from_millis(30)
        );
        assert_eq!(*observer.talking.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn test_tool_call_updates_cart_and_responds() {
        let observer = Arc::new(RecordingObserver::default());
        let (mut protocol, _) = protocol(observer.clone());
        let output = ClockOutput::default();
        let mut channel = MockLiveChannel::new();
        channel
            .expect_send()
            .withf(|m| matches!(m, OutboundMessage::Text(_)))
            .times(1)
            .returning(|_| Ok(()));
        channel
            .expect_send()
            .withf(|m| {
                matches!(m, OutboundMessage::ToolResponse(r)
                    if r.id == "fc-1" && r.response == json!({"result": tools::UPDATE_ORDER_ACK}))
            })
            .times(1)
            .returning(|_| Ok(()));
        channel
            .expect_send()
            .withf(|m| matches!(m, OutboundMessage::ToolResponse(r) if r.id == "fc-2"))
            .times(1)
            .returning(|_| Ok(()));
        let io = SessionIo {
            channel: &channel,
            output: &output,
        };
        protocol.begin_opening();
        protocol.handle_event(ChannelEvent::Opened, &io);

        protocol.dispatch(
            ServerMessage {
                tool_calls: vec![
                    ToolInvocation {
                        id: "fc-1".into(),
                        name: tools::UPDATE_ORDER.into(),
                        args: json!({"items": [{"itemName": "coffee", "quantity": 2}]}),
                    },
                    ToolInvocation {
                        id: "fc-2".into(),
                        name: tools::UPDATE_ORDER.into(),
                        args: json!({"items": [{"quantity": 2}]}),
                    },
                ],
                ..Default::default()
            },
            &io,
        );

        let orders = observer.orders.lock().unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].name, "Filter Coffee");
        assert_eq!(orders[0].price, 50);
        assert_eq!(orders[0].quantity, 2);
    }

    #[test]
    fn test_capture_frames_forwarded_only_when_open() {
        let (mut protocol, _) = protocol(Arc::new(NoopObserver));
        let output = ClockOutput::default();
        let mut channel = MockLiveChannel::new();
        channel
            .expect_send()
            .with(always())
            .times(3)
            .returning(|_| Ok(()));

        protocol.on_capture_block(&[0.0; 8], &channel);

        let io = SessionIo {
            channel: &channel,
            output: &output,
        };
        protocol.begin_opening();
        protocol.handle_event(ChannelEvent::Opened, &io);
        // Greeting plus two 4-sample frames.
        protocol.on_capture_block(&[0.0; 9], &channel);
    }

    #[test]
    fn test_remote_close_and_error_are_terminal() {
        let (mut protocol, _) = protocol(Arc::new(NoopObserver));
        let output = ClockOutput::default();
        let channel = MockLiveChannel::new();
        let io = SessionIo {
            channel: &channel,
            output: &output,
        };
        protocol.begin_opening();
        let flow = protocol.handle_event(
            ChannelEvent::Error {
                message: "boom".into(),
            },
            &io,
        );
        assert_eq!(flow, Flow::Close(CloseReason::ChannelError("boom".into())));
        assert_eq!(protocol.state(), ProtocolState::Closed);
        assert_eq!(protocol.handle_event(ChannelEvent::Opened, &io), Flow::Continue);
    }

    #[test]
    fn test_signals_notify_only_on_change() {
        let observer = Arc::new(RecordingObserver::default());
        let signals = SessionSignals::new(observer.clone());
        let rx = signals.subscribe_status();

        signals.set_talking(false);
        signals.set_talking(true);
        signals.set_talking(true);
        signals.set_status(ConnectionStatus::Connecting);

        assert_eq!(*observer.talking.lock().unwrap(), vec![true]);
        assert_eq!(*rx.borrow(), ConnectionStatus::Connecting);
        assert!(signals.is_talking());
    }
}
