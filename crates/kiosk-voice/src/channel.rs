//! Live channel ports and the transport-neutral message model.
//!
//! A live channel is one bidirectional, per-direction ordered message stream
//! to the remote agent. The session engine only sees these types; the wire
//! encoding lives in the adapter ([`crate::gemini_live`] in production, fakes
//! in tests).

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::codec::AudioFrame;
use crate::error::VoiceError;
use crate::tools::{FunctionDeclaration, ToolInvocation, ToolResponse};

/// Capacity of the inbound event queue between adapter and session.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Everything a session sends to the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// One captured PCM16 frame.
    Audio(AudioFrame),
    /// A user text turn (the greeting directive).
    Text(String),
    /// Reply to a tool invocation.
    ToolResponse(ToolResponse),
}

/// One decoded message from the agent.
///
/// A single message may carry several kinds of content at once; the session
/// protocol decides the order they are applied in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerMessage {
    /// The user started speaking over the agent.
    pub interrupted: bool,
    /// Base64 PCM16 chunks of agent speech at 24 kHz.
    pub audio: Vec<String>,
    /// Transcript fragment of the agent's speech.
    pub output_transcript: Option<String>,
    /// Transcript fragment of the user's speech.
    pub input_transcript: Option<String>,
    pub tool_calls: Vec<ToolInvocation>,
    pub turn_complete: bool,
}

impl ServerMessage {
    pub fn is_empty(&self) -> bool {
        !self.interrupted
            && self.audio.is_empty()
            && self.output_transcript.is_none()
            && self.input_transcript.is_none()
            && self.tool_calls.is_empty()
            && !self.turn_complete
    }
}

/// Lifecycle and content events delivered by a channel adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The remote side is ready for input.
    Opened,
    Message(ServerMessage),
    /// The remote side closed the channel.
    Closed { reason: String },
    /// Transport or protocol failure. Terminal.
    Error { message: String },
}

/// Send side of an open channel.
///
/// `send` never blocks: messages are queued and written in order by the
/// adapter. A full or closed queue is reported as an error and the message is
/// dropped.
#[cfg_attr(test, mockall::automock)]
pub trait LiveChannel: Send + Sync {
    fn send(&self, message: OutboundMessage) -> Result<(), VoiceError>;

    /// Close the channel. Idempotent.
    fn close(&self) -> Result<(), VoiceError>;
}

/// What the agent should be configured with when the channel opens.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSetup {
    pub model: String,
    pub voice_name: String,
    pub system_instruction: String,
    pub tools: Vec<FunctionDeclaration>,
}

/// An open channel plus the stream of events it produces.
pub struct ChannelPair {
    pub channel: Box<dyn LiveChannel>,
    pub events: mpsc::Receiver<ChannelEvent>,
}

/// Opens live channels.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    /// Establish the transport and send the session setup.
    ///
    /// Returns once the transport exists; readiness is reported later as
    /// [`ChannelEvent::Opened`].
    async fn connect(&self, setup: &SessionSetup) -> Result<ChannelPair, VoiceError>;
}
