//! Local (cpal/rodio) adapters for the [`AudioBackend`] port.
//!
//! Playback keeps the rodio `OutputStream` alive on a dedicated
//! [`AudioThread`]. Buffers are appended to one long-lived queue `Sink` per
//! device, so consecutive chunks play back to back. When the queue is idle
//! and a buffer is scheduled in the future, silence is queued ahead of it.
//! Each chunk carries a stop flag polled by rodio and an end marker that
//! reports natural completion from the mixer; no thread is spawned per chunk.
//!
//! Capture builds the cpal input stream on its own [`AudioThread`]. The
//! stream callback converts to mono f32 and forwards blocks through whatever
//! sender [`Microphone::start`] installed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfig};
use rodio::buffer::SamplesBuffer;
use rodio::source::{EmptyCallback, Zero};
use rodio::{OutputStream, Sink, Source as _};
use tokio::sync::mpsc;

use crate::audio_io::{
    AudioBackend, EndedCallback, InputContext, Microphone, OutputDevice, PlayingSource,
};
use crate::audio_thread::AudioThread;
use crate::codec::DecodedBuffer;
use crate::error::VoiceError;

/// Backend bound to the system default input and output devices.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalAudioBackend;

impl LocalAudioBackend {
    pub const fn new() -> Self {
        Self
    }
}

impl AudioBackend for LocalAudioBackend {
    fn open_output(&self, sample_rate: u32) -> Result<Box<dyn OutputDevice>, VoiceError> {
        Ok(Box::new(LocalOutputDevice::open(sample_rate)?))
    }

    fn open_input(&self, sample_rate: u32) -> Result<Box<dyn InputContext>, VoiceError> {
        Ok(Box::new(LocalInputContext::open(sample_rate)?))
    }
}

// ── Output ─────────────────────────────────────────────────────────

/// How often a queued chunk checks its stop flag.
const STOP_POLL: Duration = Duration::from_millis(5);

/// Bookkeeping for one buffer in the playback queue.
struct QueuedChunk {
    stopped: AtomicBool,
    on_ended: Mutex<Option<EndedCallback>>,
}

impl QueuedChunk {
    fn new(on_ended: EndedCallback) -> Self {
        Self {
            stopped: AtomicBool::new(false),
            on_ended: Mutex::new(Some(on_ended)),
        }
    }

    fn take_callback(&self) -> Option<EndedCallback> {
        self.on_ended
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Called by the mixer once the chunk's samples are exhausted.
    fn finish(&self) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        if let Some(callback) = self.take_callback() {
            callback();
        }
    }

    /// Returns `true` if this call stopped the chunk.
    fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        drop(self.take_callback());
        true
    }

    /// Still waiting to play or playing.
    fn is_live(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
            && self
                .on_ended
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_some()
    }
}

/// Silence to queue ahead of a buffer starting at `start`.
fn lead_in(queue_idle: bool, start: Duration, now: Duration) -> Option<Duration> {
    if !queue_idle {
        return None;
    }
    let gap = start.saturating_sub(now);
    (!gap.is_zero()).then_some(gap)
}

/// The device's single queue sink and the chunks it holds.
struct PlaybackQueue {
    sink: Sink,
    chunks: Mutex<Vec<Arc<QueuedChunk>>>,
}

impl PlaybackQueue {
    /// Drop everything still queued once no chunk is live, so an interrupt
    /// does not leave lead-in silence ahead of the next reply.
    fn flush_if_idle(&self) {
        let mut chunks = self.chunks.lock().unwrap_or_else(PoisonError::into_inner);
        chunks.retain(|c| c.is_live());
        if chunks.is_empty() && !self.sink.empty() {
            self.sink.clear();
            self.sink.play();
        }
    }
}

struct LocalPlayingSource {
    queue: Arc<PlaybackQueue>,
    chunk: Arc<QueuedChunk>,
}

impl PlayingSource for LocalPlayingSource {
    fn stop(&self) {
        if self.chunk.stop() {
            self.queue.flush_if_idle();
        }
    }
}

/// rodio playback context.
pub struct LocalOutputDevice {
    thread: AudioThread<OutputStream>,
    queue: Arc<PlaybackQueue>,
    epoch: Instant,
    sample_rate: u32,
    closed: AtomicBool,
}

impl LocalOutputDevice {
    /// Open the default output device.
    pub fn open(sample_rate: u32) -> Result<Self, VoiceError> {
        let (thread, handle) = AudioThread::spawn("kiosk-playback", || {
            OutputStream::try_default().map_err(|e| VoiceError::OutputStreamError(e.to_string()))
        })?;
        let sink = match Sink::try_new(&handle) {
            Ok(sink) => sink,
            Err(e) => {
                thread.shutdown();
                return Err(VoiceError::OutputStreamError(e.to_string()));
            }
        };

        tracing::info!(sample_rate, "Audio playback initialized on default output device");

        Ok(Self {
            thread,
            queue: Arc::new(PlaybackQueue {
                sink,
                chunks: Mutex::new(Vec::new()),
            }),
            epoch: Instant::now(),
            sample_rate,
            closed: AtomicBool::new(false),
        })
    }
}

impl OutputDevice for LocalOutputDevice {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn play_at(
        &self,
        buffer: &DecodedBuffer,
        start: Duration,
        on_ended: EndedCallback,
    ) -> Result<Box<dyn PlayingSource>, VoiceError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(VoiceError::DeviceClosed);
        }

        let chunk = Arc::new(QueuedChunk::new(on_ended));
        let sink = &self.queue.sink;
        {
            let mut chunks = self.queue.chunks.lock().unwrap_or_else(PoisonError::into_inner);
            chunks.retain(|c| c.is_live());

            if let Some(gap) = lead_in(sink.empty(), start, self.current_time()) {
                sink.append(Zero::<f32>::new(buffer.channels, buffer.sample_rate).take_duration(gap));
            }

            let flag = Arc::clone(&chunk);
            let samples =
                SamplesBuffer::new(buffer.channels, buffer.sample_rate, buffer.samples.clone())
                    .stoppable()
                    .periodic_access(STOP_POLL, move |source| {
                        if flag.stopped.load(Ordering::SeqCst) {
                            source.stop();
                        }
                    });
            sink.append(samples);

            let marker = Arc::clone(&chunk);
            sink.append(EmptyCallback::<f32>::new(Box::new(move || marker.finish())));

            chunks.push(Arc::clone(&chunk));
        }

        Ok(Box::new(LocalPlayingSource {
            queue: Arc::clone(&self.queue),
            chunk,
        }))
    }

    fn close(&self) -> Result<(), VoiceError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let chunks = std::mem::take(
            &mut *self.queue.chunks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let silenced = chunks.iter().filter(|c| c.stop()).count();
        self.queue.sink.stop();
        self.thread.shutdown();
        tracing::debug!(silenced, "Audio playback closed");
        Ok(())
    }
}

impl Drop for LocalOutputDevice {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

// ── Input ──────────────────────────────────────────────────────────

/// cpal capture context bound to the default input device.
pub struct LocalInputContext {
    sample_rate: u32,
    closed: AtomicBool,
}

impl LocalInputContext {
    /// Check that an input device exists; the stream itself is built when
    /// the microphone is opened.
    pub fn open(sample_rate: u32) -> Result<Self, VoiceError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(VoiceError::NoInputDevice)?;

        tracing::info!(
            device = %device.name().unwrap_or_default(),
            sample_rate,
            "Audio capture context opened"
        );

        Ok(Self {
            sample_rate,
            closed: AtomicBool::new(false),
        })
    }
}

impl InputContext for LocalInputContext {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn open_microphone(&self) -> Result<Box<dyn Microphone>, VoiceError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(VoiceError::DeviceClosed);
        }
        Ok(Box::new(LocalMicrophone::open()?))
    }

    fn close(&self) -> Result<(), VoiceError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("Audio capture context closed");
        }
        Ok(())
    }
}

type SinkSlot = Arc<Mutex<Option<mpsc::UnboundedSender<Vec<f32>>>>>;

/// Lives on the capture thread.
struct CaptureState {
    stream: Stream,
}

/// Default microphone, captured through cpal.
pub struct LocalMicrophone {
    thread: AudioThread<CaptureState>,
    slot: SinkSlot,
    device_sample_rate: u32,
    capturing: AtomicBool,
}

impl LocalMicrophone {
    fn open() -> Result<Self, VoiceError> {
        let slot: SinkSlot = Arc::new(Mutex::new(None));
        let stream_slot = Arc::clone(&slot);

        let (thread, device_sample_rate) = AudioThread::spawn("kiosk-capture", move || {
            let host = cpal::default_host();
            let device = host
                .default_input_device()
                .ok_or(VoiceError::NoInputDevice)?;
            let config = device
                .default_input_config()
                .map_err(|e| VoiceError::InputStreamError(e.to_string()))?;

            let device_sample_rate = config.sample_rate().0;
            tracing::info!(
                device = %device.name().unwrap_or_default(),
                sample_rate = device_sample_rate,
                channels = config.channels(),
                "Microphone acquired"
            );

            let stream = build_input_stream(&device, &config, stream_slot)?;
            Ok((CaptureState { stream }, device_sample_rate))
        })?;

        Ok(Self {
            thread,
            slot,
            device_sample_rate,
            capturing: AtomicBool::new(false),
        })
    }
}

impl Microphone for LocalMicrophone {
    fn sample_rate(&self) -> u32 {
        self.device_sample_rate
    }

    fn start(&self, sink: mpsc::UnboundedSender<Vec<f32>>) -> Result<(), VoiceError> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
        self.thread
            .call(|state| state.stream.play())?
            .map_err(|e| VoiceError::InputStreamError(e.to_string()))?;
        self.capturing.store(true, Ordering::SeqCst);
        tracing::debug!("Microphone capture started");
        Ok(())
    }

    fn stop(&self) -> Result<(), VoiceError> {
        self.capturing.store(false, Ordering::SeqCst);
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if !self.thread.is_running() {
            return Ok(());
        }
        let paused = self.thread.call(|state| state.stream.pause());
        self.thread.shutdown();
        match paused {
            Ok(Ok(())) | Err(VoiceError::AudioThreadDied) => Ok(()),
            Ok(Err(e)) => Err(VoiceError::InputStreamError(e.to_string())),
            Err(e) => Err(e),
        }
    }

    fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }
}

/// Build a cpal input stream that forwards mono f32 blocks into `slot`.
fn build_input_stream(
    device: &Device,
    config: &SupportedStreamConfig,
    slot: SinkSlot,
) -> Result<Stream, VoiceError> {
    let channels = config.channels();
    let stream_config: StreamConfig = config.clone().into();
    let sample_format = config.sample_format();

    let err_slot = Arc::clone(&slot);
    let err_fn = move |err: cpal::StreamError| {
        tracing::error!(%err, "Audio input stream error");
        // Device loss ends the sample stream for the session.
        err_slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    };

    let stream = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                forward(&slot, to_mono(data, channels));
            },
            err_fn,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let float_data: Vec<f32> =
                    data.iter().map(|&s| f32::from(s) / 32768.0).collect();
                forward(&slot, to_mono(&float_data, channels));
            },
            err_fn,
            None,
        ),
        SampleFormat::I32 => device.build_input_stream(
            &stream_config,
            move |data: &[i32], _: &cpal::InputCallbackInfo| {
                #[allow(clippy::cast_precision_loss)]
                let float_data: Vec<f32> =
                    data.iter().map(|&s| s as f32 / 2_147_483_648.0).collect();
                forward(&slot, to_mono(&float_data, channels));
            },
            err_fn,
            None,
        ),
        _ => {
            return Err(VoiceError::InputStreamError(format!(
                "Unsupported sample format: {sample_format:?}"
            )));
        }
    };

    stream.map_err(|e| VoiceError::InputStreamError(e.to_string()))
}

fn forward(slot: &SinkSlot, block: Vec<f32>) {
    if block.is_empty() {
        return;
    }
    let guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(tx) = guard.as_ref() {
        let _ = tx.send(block);
    }
}

/// Average interleaved channels down to mono.
pub(crate) fn to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let channels = usize::from(channels);
    #[allow(clippy::cast_precision_loss)]
    let scale = channels as f32;
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / scale)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn counting_chunk(fired: &Arc<AtomicUsize>) -> QueuedChunk {
        let fired = Arc::clone(fired);
        QueuedChunk::new(Box::new(move || {
            fired.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn test_lead_in_only_when_queue_idle() {
        let now = Duration::from_millis(100);
        assert_eq!(
            lead_in(true, Duration::from_millis(250), now),
            Some(Duration::from_millis(150))
        );
        assert_eq!(lead_in(true, Duration::from_millis(100), now), None);
        assert_eq!(lead_in(true, Duration::from_millis(40), now), None);
        assert_eq!(lead_in(false, Duration::from_millis(250), now), None);
    }

    #[test]
    fn test_chunk_reports_end_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let chunk = counting_chunk(&fired);
        assert!(chunk.is_live());

        chunk.finish();
        chunk.finish();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!chunk.is_live());
        assert!(chunk.stop());
    }

    #[test]
    fn test_stopped_chunk_never_reports_end() {
        let fired = Arc::new(AtomicUsize::new(0));
        let chunk = counting_chunk(&fired);

        assert!(chunk.stop());
        assert!(!chunk.stop());
        chunk.finish();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!chunk.is_live());
    }

    #[test]
    fn test_to_mono_averages_frames() {
        let stereo = [0.2, 0.4, -1.0, 1.0, 0.5, 0.5];
        let mono = to_mono(&stereo, 2);
        assert_eq!(mono.len(), 3);
        assert!((mono[0] - 0.3).abs() < 1e-6);
        assert!(mono[1].abs() < 1e-6);
        assert!((mono[2] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_to_mono_passthrough() {
        assert_eq!(to_mono(&[0.1, 0.2], 1), vec![0.1, 0.2]);
    }

    #[test]
    fn test_forward_without_sink_drops_block() {
        let slot: SinkSlot = Arc::new(Mutex::new(None));
        forward(&slot, vec![0.1]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        *slot.lock().unwrap() = Some(tx);
        forward(&slot, vec![0.2, 0.3]);
        forward(&slot, Vec::new());
        assert_eq!(rx.try_recv().unwrap(), vec![0.2, 0.3]);
        assert!(rx.try_recv().is_err());
    }
}
