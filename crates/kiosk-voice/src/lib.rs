//! Live audio session engine for the voice ordering kiosk.
//!
//! One [`SessionController`] drives one conversation at a time: it captures
//! microphone audio, streams it as 16 kHz PCM16 frames over a live channel,
//! schedules the agent's 24 kHz replies gap-free on the speaker, cuts playback
//! when the customer barges in, and turns `updateOrder` tool calls into cart
//! lines reported through [`kiosk_core::SessionObserver`].
//!
//! ```text
//! mic ─► CapturePipeline ─► LiveChannel ─► agent
//!                                            │
//! speaker ◄─ PlaybackScheduler ◄─ SessionProtocol ◄─┘
//! ```
//!
//! Devices and transport sit behind ports ([`AudioBackend`],
//! [`ChannelConnector`]) so the whole session can run against fakes.

#![deny(unused_crate_dependencies)]

pub mod audio_io;
pub mod audio_local;
pub mod audio_thread;
pub mod capture;
pub mod channel;
pub mod codec;
pub mod error;
pub mod gemini_live;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod tools;

// Re-export key types for convenience
pub use audio_io::{
    AudioBackend, EndedCallback, InputContext, Microphone, OutputDevice, PlayingSource,
};
pub use audio_local::LocalAudioBackend;
pub use capture::CapturePipeline;
pub use channel::{
    ChannelConnector, ChannelEvent, ChannelPair, LiveChannel, OutboundMessage, ServerMessage,
    SessionSetup,
};
pub use codec::{AudioFrame, CAPTURE_SAMPLE_RATE, DecodedBuffer, PLAYBACK_SAMPLE_RATE};
pub use error::VoiceError;
pub use gemini_live::GeminiLiveConnector;
pub use playback::{PlaybackClock, PlaybackHandle, PlaybackId, PlaybackScheduler};
pub use protocol::{SessionProtocol, SessionSignals};
pub use session::{SessionController, SessionEnd, default_system_instruction};
pub use tools::{ToolInvocation, ToolResponse, UPDATE_ORDER};
