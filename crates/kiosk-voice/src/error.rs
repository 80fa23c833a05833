//! Live session error types.

use kiosk_core::SettingsError;

/// Errors that can occur in the live audio session.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    /// PCM bytes that cannot be split into whole samples.
    #[error("Malformed audio frame: {0}")]
    MalformedFrame(String),

    /// Inbound audio payload that is not valid base64.
    #[error("Malformed audio payload: {0}")]
    MalformedPayload(String),

    /// No audio input device found.
    #[error("No audio input device found")]
    NoInputDevice,

    /// Failed to open or drive the audio input stream.
    #[error("Failed to open audio input stream: {0}")]
    InputStreamError(String),

    /// Failed to open or drive the audio output stream.
    #[error("Failed to open audio output stream: {0}")]
    OutputStreamError(String),

    /// Audio resampling error.
    #[error("Audio resampling failed: {0}")]
    ResampleError(String),

    /// The dedicated audio thread exited unexpectedly.
    #[error("Audio thread terminated unexpectedly")]
    AudioThreadDied,

    /// A device context was used after it was closed.
    #[error("Audio device already closed")]
    DeviceClosed,

    /// The live channel could not be opened.
    #[error("Failed to connect live channel: {0}")]
    ChannelConnect(String),

    /// The live channel is closed.
    #[error("Live channel closed")]
    ChannelClosed,

    /// The outbound queue is full; the message was dropped.
    #[error("Live channel outbound queue full")]
    QueueFull,

    /// No API key configured for the live channel.
    #[error("Missing API key - set GEMINI_API_KEY")]
    MissingApiKey,

    /// JSON encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid session settings.
    #[error("Invalid settings: {0}")]
    Settings(#[from] SettingsError),

    /// A session is already active.
    #[error("Live session is already active")]
    AlreadyActive,

    /// No session is active.
    #[error("Live session is not active")]
    NotActive,
}
