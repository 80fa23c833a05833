//! Audio device ports.
//!
//! The session engine never touches cpal or rodio directly. It asks an
//! [`AudioBackend`] for two device contexts (one at the capture rate, one at
//! the playback rate), opens a [`Microphone`] from the input context, and
//! schedules decoded buffers on the [`OutputDevice`]:
//!
//! | Implementor | Where used |
//! |---|---|
//! | [`LocalAudioBackend`](crate::audio_local::LocalAudioBackend) | Kiosk hardware: cpal capture + rodio playback |
//! | test fakes | Integration tests with a manual clock |
//!
//! Every trait is object-safe and takes `&self`; implementations use
//! interior mutability (atomics, channels, the audio thread) for state.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::codec::DecodedBuffer;
use crate::error::VoiceError;

/// Invoked exactly once when a scheduled buffer finishes on its own.
/// Never invoked for a buffer that was stopped.
pub type EndedCallback = Box<dyn FnOnce() + Send + 'static>;

// ── Backend ────────────────────────────────────────────────────────

/// Factory for device contexts.
pub trait AudioBackend: Send + Sync {
    /// Open the output (speaker) context that plays agent audio.
    fn open_output(&self, sample_rate: u32) -> Result<Box<dyn OutputDevice>, VoiceError>;

    /// Open the input context that microphones are opened from.
    fn open_input(&self, sample_rate: u32) -> Result<Box<dyn InputContext>, VoiceError>;
}

// ── Output ─────────────────────────────────────────────────────────

/// A playback context with its own monotonic clock.
pub trait OutputDevice: Send + Sync {
    fn sample_rate(&self) -> u32;

    /// Time elapsed on this context's clock since it was opened.
    fn current_time(&self) -> Duration;

    /// Schedule `buffer` to start at `start` on this context's clock.
    ///
    /// A start time in the past plays immediately.
    fn play_at(
        &self,
        buffer: &DecodedBuffer,
        start: Duration,
        on_ended: EndedCallback,
    ) -> Result<Box<dyn PlayingSource>, VoiceError>;

    /// Release the device. Scheduled sources are silenced. Idempotent.
    fn close(&self) -> Result<(), VoiceError>;
}

/// A scheduled or playing buffer that can be cut off.
pub trait PlayingSource: Send + Sync {
    /// Stop playback. A no-op if the source already finished.
    fn stop(&self);
}

// ── Input ──────────────────────────────────────────────────────────

/// Capture-side device context.
pub trait InputContext: Send + Sync {
    /// Rate the capture pipeline delivers frames at.
    fn sample_rate(&self) -> u32;

    /// Acquire the microphone.
    fn open_microphone(&self) -> Result<Box<dyn Microphone>, VoiceError>;

    /// Release the context. Idempotent.
    fn close(&self) -> Result<(), VoiceError>;
}

/// A live microphone delivering mono f32 blocks at its native rate.
pub trait Microphone: Send + Sync {
    /// Native rate of the blocks sent to the start sink.
    fn sample_rate(&self) -> u32;

    /// Start delivering blocks to `sink`. Dropping the sender side (by
    /// [`Microphone::stop`] or device loss) ends the stream.
    fn start(&self, sink: mpsc::UnboundedSender<Vec<f32>>) -> Result<(), VoiceError>;

    /// Stop capturing and release the device. Idempotent.
    fn stop(&self) -> Result<(), VoiceError>;

    fn is_capturing(&self) -> bool;
}
