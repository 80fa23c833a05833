//! Shared fakes for session integration tests.
//!
//! Audio devices run on a manual clock and record what was scheduled; the
//! channel records every outbound message and hands the test the sender
//! side of the event stream. No hardware or network is touched.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kiosk_core::{ConnectionStatus, OrderLine, SessionObserver};
use kiosk_voice::audio_io::{
    AudioBackend, EndedCallback, InputContext, Microphone, OutputDevice, PlayingSource,
};
use kiosk_voice::channel::{
    ChannelConnector, ChannelEvent, ChannelPair, EVENT_QUEUE_CAPACITY, LiveChannel,
    OutboundMessage, SessionSetup,
};
use kiosk_voice::codec::{self, DecodedBuffer, PLAYBACK_SAMPLE_RATE};
use kiosk_voice::tools::ToolResponse;
use kiosk_voice::{AudioFrame, VoiceError};
use tokio::sync::mpsc;

// ── Audio ──────────────────────────────────────────────────────────

/// One buffer handed to the fake output.
pub struct ScheduledBuffer {
    pub start: Duration,
    pub duration: Duration,
    pub stopped: Arc<AtomicBool>,
    on_ended: Option<EndedCallback>,
}

/// Shared view of everything the fake audio devices did.
pub struct AudioRig {
    pub now: Mutex<Duration>,
    pub scheduled: Mutex<Vec<ScheduledBuffer>>,
    pub output_closes: AtomicUsize,
    pub input_closes: AtomicUsize,
    pub mic_stops: AtomicUsize,
    pub mic_rate: u32,
    pub fail_microphone: AtomicBool,
    pub fail_mic_start: AtomicBool,
    mic_sink: Mutex<Option<mpsc::UnboundedSender<Vec<f32>>>>,
}

impl AudioRig {
    pub fn new(mic_rate: u32) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(Duration::ZERO),
            scheduled: Mutex::new(Vec::new()),
            output_closes: AtomicUsize::new(0),
            input_closes: AtomicUsize::new(0),
            mic_stops: AtomicUsize::new(0),
            mic_rate,
            fail_microphone: AtomicBool::new(false),
            fail_mic_start: AtomicBool::new(false),
            mic_sink: Mutex::new(None),
        })
    }

    pub fn set_now(&self, now: Duration) {
        *self.now.lock().unwrap() = now;
    }

    pub fn scheduled_count(&self) -> usize {
        self.scheduled.lock().unwrap().len()
    }

    pub fn starts(&self) -> Vec<Duration> {
        self.scheduled.lock().unwrap().iter().map(|b| b.start).collect()
    }

    pub fn stopped_count(&self) -> usize {
        self.scheduled
            .lock()
            .unwrap()
            .iter()
            .filter(|b| b.stopped.load(Ordering::SeqCst))
            .count()
    }

    /// Let buffer `index` play out, firing its completion callback.
    pub fn finish(&self, index: usize) {
        let callback = {
            let mut scheduled = self.scheduled.lock().unwrap();
            let buffer = &mut scheduled[index];
            if buffer.stopped.load(Ordering::SeqCst) {
                None
            } else {
                buffer.on_ended.take()
            }
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.mic_sink.lock().unwrap().is_some()
    }

    /// Push one microphone block. Returns `false` if nothing is listening.
    pub fn push_block(&self, block: Vec<f32>) -> bool {
        self.mic_sink
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|sink| sink.send(block).is_ok())
    }

    /// Simulate the microphone disappearing.
    pub fn lose_microphone(&self) {
        self.mic_sink.lock().unwrap().take();
    }
}

pub struct FakeBackend {
    pub rig: Arc<AudioRig>,
}

impl AudioBackend for FakeBackend {
    fn open_output(&self, sample_rate: u32) -> Result<Box<dyn OutputDevice>, VoiceError> {
        assert_eq!(sample_rate, PLAYBACK_SAMPLE_RATE);
        Ok(Box::new(FakeOutput {
            rig: Arc::clone(&self.rig),
        }))
    }

    fn open_input(&self, sample_rate: u32) -> Result<Box<dyn InputContext>, VoiceError> {
        Ok(Box::new(FakeInput {
            rig: Arc::clone(&self.rig),
            sample_rate,
        }))
    }
}

struct FakeOutput {
    rig: Arc<AudioRig>,
}

struct FakeSource {
    stopped: Arc<AtomicBool>,
}

impl PlayingSource for FakeSource {
    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

impl OutputDevice for FakeOutput {
    fn sample_rate(&self) -> u32 {
        PLAYBACK_SAMPLE_RATE
    }

    fn current_time(&self) -> Duration {
        *self.rig.now.lock().unwrap()
    }

    fn play_at(
        &self,
        buffer: &DecodedBuffer,
        start: Duration,
        on_ended: EndedCallback,
    ) -> Result<Box<dyn PlayingSource>, VoiceError> {
        let stopped = Arc::new(AtomicBool::new(false));
        self.rig.scheduled.lock().unwrap().push(ScheduledBuffer {
            start,
            duration: buffer.duration(),
            stopped: Arc::clone(&stopped),
            on_ended: Some(on_ended),
        });
        Ok(Box::new(FakeSource { stopped }))
    }

    fn close(&self) -> Result<(), VoiceError> {
        self.rig.output_closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeInput {
    rig: Arc<AudioRig>,
    sample_rate: u32,
}

impl InputContext for FakeInput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn open_microphone(&self) -> Result<Box<dyn Microphone>, VoiceError> {
        if self.rig.fail_microphone.load(Ordering::SeqCst) {
            return Err(VoiceError::NoInputDevice);
        }
        Ok(Box::new(FakeMicrophone {
            rig: Arc::clone(&self.rig),
        }))
    }

    fn close(&self) -> Result<(), VoiceError> {
        self.rig.input_closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeMicrophone {
    rig: Arc<AudioRig>,
}

impl Microphone for FakeMicrophone {
    fn sample_rate(&self) -> u32 {
        self.rig.mic_rate
    }

    fn start(&self, sink: mpsc::UnboundedSender<Vec<f32>>) -> Result<(), VoiceError> {
        if self.rig.fail_mic_start.load(Ordering::SeqCst) {
            return Err(VoiceError::InputStreamError("permission denied".into()));
        }
        *self.rig.mic_sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn stop(&self) -> Result<(), VoiceError> {
        self.rig.mic_stops.fetch_add(1, Ordering::SeqCst);
        self.rig.mic_sink.lock().unwrap().take();
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.rig.is_capturing()
    }
}

// ── Channel ────────────────────────────────────────────────────────

/// Shared view of the fake channel.
#[derive(Default)]
pub struct ChannelRig {
    pub sent: Mutex<Vec<OutboundMessage>>,
    pub closes: AtomicUsize,
    pub setups: Mutex<Vec<SessionSetup>>,
    pub fail_connect: AtomicBool,
    /// Make `connect` wait forever, like a handshake that never answers.
    pub hang_connect: AtomicBool,
    events_tx: Mutex<Option<mpsc::Sender<ChannelEvent>>>,
}

impl ChannelRig {
    /// Deliver an event to the most recently connected session.
    pub async fn emit(&self, event: ChannelEvent) {
        let tx = self
            .events_tx
            .lock()
            .unwrap()
            .clone()
            .expect("no channel connected");
        tx.send(event).await.expect("session stopped listening");
    }

    pub fn texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| match m {
                OutboundMessage::Text(text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn audio_frames(&self) -> Vec<AudioFrame> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| match m {
                OutboundMessage::Audio(frame) => Some(frame.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn tool_responses(&self) -> Vec<ToolResponse> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| match m {
                OutboundMessage::ToolResponse(response) => Some(response.clone()),
                _ => None,
            })
            .collect()
    }
}

struct FakeChannel {
    rig: Arc<ChannelRig>,
}

impl LiveChannel for FakeChannel {
    fn send(&self, message: OutboundMessage) -> Result<(), VoiceError> {
        self.rig.sent.lock().unwrap().push(message);
        Ok(())
    }

    fn close(&self) -> Result<(), VoiceError> {
        self.rig.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeConnector {
    pub rig: Arc<ChannelRig>,
}

#[async_trait]
impl ChannelConnector for FakeConnector {
    async fn connect(&self, setup: &SessionSetup) -> Result<ChannelPair, VoiceError> {
        if self.rig.fail_connect.load(Ordering::SeqCst) {
            return Err(VoiceError::ChannelConnect("connection refused".into()));
        }
        if self.rig.hang_connect.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.rig.setups.lock().unwrap().push(setup.clone());
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        *self.rig.events_tx.lock().unwrap() = Some(tx);
        Ok(ChannelPair {
            channel: Box::new(FakeChannel {
                rig: Arc::clone(&self.rig),
            }),
            events: rx,
        })
    }
}

// ── Observer ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingObserver {
    pub orders: Mutex<Vec<Vec<OrderLine>>>,
    pub transcripts: Mutex<Vec<(String, bool)>>,
    pub statuses: Mutex<Vec<ConnectionStatus>>,
    pub talking: Mutex<Vec<bool>>,
    /// Panic inside the order callback, as a broken host would.
    pub panic_on_order: AtomicBool,
}

impl SessionObserver for RecordingObserver {
    fn on_order_update(&self, lines: Vec<OrderLine>) {
        if self.panic_on_order.load(Ordering::SeqCst) {
            panic!("order display crashed");
        }
        self.orders.lock().unwrap().push(lines);
    }

    fn on_transcript_update(&self, text: &str, is_user: bool) {
        self.transcripts
            .lock()
            .unwrap()
            .push((text.to_string(), is_user));
    }

    fn on_status_change(&self, status: ConnectionStatus) {
        self.statuses.lock().unwrap().push(status);
    }

    fn on_talking_change(&self, talking: bool) {
        self.talking.lock().unwrap().push(talking);
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Base64 PCM16 payload of `samples` samples of agent audio.
pub fn agent_audio(samples: usize) -> String {
    codec::encode(&vec![0.25; samples], PLAYBACK_SAMPLE_RATE).to_base64()
}

/// Poll `check` until it holds, yielding to the session task in between.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
