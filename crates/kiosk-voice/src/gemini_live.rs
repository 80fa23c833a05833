//! Gemini Live WebSocket adapter for the [`ChannelConnector`] port.
//!
//! Implements the bidirectional `BidiGenerateContent` protocol:
//!
//! 1. **Connect**: open the WebSocket to the Gemini Live endpoint
//! 2. **Setup**: send model, voice, system instruction, the `updateOrder`
//!    declaration and transcription switches
//! 3. **Stream**: captured audio goes out as `realtimeInput`; speech, transcripts
//!    and tool calls come back as `serverContent` / `toolCall`
//! 4. **Close**: send a close frame and stop reading
//!
//! Gemini Live may deliver JSON control messages in Binary frames as well as
//! Text frames; both are parsed the same way.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::stream::SplitStream;
use futures_util::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::channel::{
    ChannelConnector, ChannelEvent, ChannelPair, EVENT_QUEUE_CAPACITY, LiveChannel,
    OutboundMessage, ServerMessage, SessionSetup,
};
use crate::codec::CAPTURE_MIME_TYPE;
use crate::error::VoiceError;
use crate::tools::{FunctionDeclaration, ToolInvocation, ToolResponse};

// ── Constants ──────────────────────────────────────────────────────

/// Gemini Live WebSocket endpoint.
pub const GEMINI_LIVE_WS_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Outbound queue depth. Sends beyond this are dropped.
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Log the first audio frame and every Nth after it.
const LOG_EVERY_AUDIO_FRAMES: u64 = 50;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ── Setup message ──────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct SetupMessage {
    pub setup: SetupPayload,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupPayload {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
    pub input_audio_transcription: EmptyConfig,
    pub output_audio_transcription: EmptyConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    pub function_declarations: Vec<FunctionDeclaration>,
}

/// Serialises as `{}`; presence of the key switches the feature on.
#[derive(Debug, Default, Serialize)]
pub struct EmptyConfig {}

/// Build the first message of a session.
pub fn build_setup_message(setup: &SessionSetup) -> SetupMessage {
    let system_instruction = (!setup.system_instruction.trim().is_empty()).then(|| Content {
        role: None,
        parts: vec![TextPart {
            text: setup.system_instruction.clone(),
        }],
    });
    let tools = if setup.tools.is_empty() {
        Vec::new()
    } else {
        vec![ToolSpec {
            function_declarations: setup.tools.clone(),
        }]
    };

    SetupMessage {
        setup: SetupPayload {
            model: format!("models/{}", setup.model),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: setup.voice_name.clone(),
                        },
                    },
                },
            },
            system_instruction,
            tools,
            input_audio_transcription: EmptyConfig::default(),
            output_audio_transcription: EmptyConfig::default(),
        },
    }
}

// ── Client messages ────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInputMessage {
    realtime_input: RealtimeInput,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    media_chunks: Vec<MediaChunk>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaChunk {
    mime_type: &'static str,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientContentMessage {
    client_content: ClientContent,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientContent {
    turns: Vec<Content>,
    turn_complete: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolResponseMessage<'a> {
    tool_response: FunctionResponses<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FunctionResponses<'a> {
    function_responses: [&'a ToolResponse; 1],
}

/// Encode one outbound message as Gemini Live JSON.
///
/// Wire formats:
/// - audio: `{"realtimeInput":{"mediaChunks":[{"mimeType":"audio/pcm;rate=16000","data":"<base64>"}]}}`
/// - text: `{"clientContent":{"turns":[{"role":"user","parts":[{"text":"..."}]}],"turnComplete":true}}`
/// - tool response: `{"toolResponse":{"functionResponses":[{"id":"..","name":"..","response":{..}}]}}`
pub fn encode_outbound(message: &OutboundMessage) -> Result<String, VoiceError> {
    let json = match message {
        OutboundMessage::Audio(frame) => serde_json::to_string(&RealtimeInputMessage {
            realtime_input: RealtimeInput {
                media_chunks: vec![MediaChunk {
                    mime_type: CAPTURE_MIME_TYPE,
                    data: frame.to_base64(),
                }],
            },
        })?,
        OutboundMessage::Text(text) => serde_json::to_string(&ClientContentMessage {
            client_content: ClientContent {
                turns: vec![Content {
                    role: Some("user".to_string()),
                    parts: vec![TextPart { text: text.clone() }],
                }],
                turn_complete: true,
            },
        })?,
        OutboundMessage::ToolResponse(response) => serde_json::to_string(&ToolResponseMessage {
            tool_response: FunctionResponses {
                function_responses: [response],
            },
        })?,
    };
    Ok(json)
}

// ── Server messages ────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireServerMessage {
    setup_complete: Option<Value>,
    server_content: Option<WireServerContent>,
    tool_call: Option<WireToolCall>,
    input_transcription: Option<WireTranscription>,
    output_transcription: Option<WireTranscription>,
    error: Option<WireError>,
    go_away: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireServerContent {
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
    model_turn: Option<WireModelTurn>,
    input_transcription: Option<WireTranscription>,
    output_transcription: Option<WireTranscription>,
}

#[derive(Debug, Default, Deserialize)]
struct WireModelTurn {
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePart {
    inline_data: Option<WireBlob>,
}

#[derive(Debug, Deserialize)]
struct WireBlob {
    data: String,
}

#[derive(Debug, Deserialize)]
struct WireTranscription {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireToolCall {
    #[serde(default)]
    function_calls: Vec<WireFunctionCall>,
}

#[derive(Debug, Deserialize)]
struct WireFunctionCall {
    #[serde(default)]
    id: String,
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Deserialize)]
struct WireError {
    message: Option<String>,
}

fn non_empty(transcription: Option<WireTranscription>) -> Option<String> {
    transcription.map(|t| t.text).filter(|t| !t.is_empty())
}

/// Parse one JSON frame from Gemini Live into channel events.
///
/// Unparseable frames yield no events; they are logged and skipped.
pub fn parse_server_message(json_text: &str) -> Vec<ChannelEvent> {
    let wire: WireServerMessage = match serde_json::from_str(json_text) {
        Ok(wire) => wire,
        Err(e) => {
            tracing::warn!(error = %e, "Skipping unparseable Gemini Live frame");
            return Vec::new();
        }
    };

    let mut events = Vec::new();

    if wire.setup_complete.is_some() {
        events.push(ChannelEvent::Opened);
    }

    let mut message = ServerMessage::default();
    if let Some(content) = wire.server_content {
        message.interrupted = content.interrupted;
        message.turn_complete = content.turn_complete;
        if let Some(turn) = content.model_turn {
            message.audio = turn
                .parts
                .into_iter()
                .filter_map(|part| part.inline_data)
                .map(|blob| blob.data)
                .filter(|data| !data.is_empty())
                .collect();
        }
        message.output_transcript = non_empty(content.output_transcription);
        message.input_transcript = non_empty(content.input_transcription);
    }
    // Transcriptions are also accepted at the top level.
    if message.output_transcript.is_none() {
        message.output_transcript = non_empty(wire.output_transcription);
    }
    if message.input_transcript.is_none() {
        message.input_transcript = non_empty(wire.input_transcription);
    }
    if let Some(tool_call) = wire.tool_call {
        message.tool_calls = tool_call
            .function_calls
            .into_iter()
            .map(|call| ToolInvocation {
                id: call.id,
                name: call.name,
                args: call.args,
            })
            .collect();
    }
    if !message.is_empty() {
        events.push(ChannelEvent::Message(message));
    }

    if wire.go_away.is_some() {
        tracing::warn!("Gemini Live server announced disconnect (goAway)");
    }

    if let Some(err) = wire.error {
        events.push(ChannelEvent::Error {
            message: err
                .message
                .unwrap_or_else(|| "Unknown server error".to_string()),
        });
    }

    events
}

// ── Connector ──────────────────────────────────────────────────────

/// Opens Gemini Live sessions.
#[derive(Clone)]
pub struct GeminiLiveConnector {
    api_key: String,
    endpoint: String,
}

impl std::fmt::Debug for GeminiLiveConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiLiveConnector")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl GeminiLiveConnector {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            endpoint: GEMINI_LIVE_WS_URL.to_string(),
        }
    }

    /// Build a connector from `GEMINI_API_KEY` (or `API_KEY`).
    pub fn from_env() -> Result<Self, VoiceError> {
        kiosk_core::api_key_from_env()
            .map(Self::new)
            .ok_or(VoiceError::MissingApiKey)
    }

    /// Point at a different endpoint (proxies, local test servers).
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl ChannelConnector for GeminiLiveConnector {
    async fn connect(&self, setup: &SessionSetup) -> Result<ChannelPair, VoiceError> {
        let url = format!("{}?key={}", self.endpoint, self.api_key);

        tracing::info!(
            endpoint = %self.endpoint,
            model = %setup.model,
            voice = %setup.voice_name,
            "Connecting to Gemini Live"
        );

        let (mut ws_stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| VoiceError::ChannelConnect(e.to_string()))?;

        let setup_json = serde_json::to_string(&build_setup_message(setup))?;
        tracing::debug!(bytes = setup_json.len(), "Sending Gemini Live setup");
        ws_stream
            .send(WsMessage::text(setup_json))
            .await
            .map_err(|e| VoiceError::ChannelConnect(format!("failed to send setup: {e}")))?;

        let (ws_sender, ws_receiver) = ws_stream.split();
        let (out_tx, out_rx) = mpsc::channel::<OutboundMessage>(OUTBOUND_QUEUE_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel::<ChannelEvent>(EVENT_QUEUE_CAPACITY);
        let shutdown = CancellationToken::new();

        tokio::spawn(outbound_loop(out_rx, ws_sender, shutdown.clone()));
        let inbound = tokio::spawn(inbound_loop(ws_receiver, event_tx));

        Ok(ChannelPair {
            channel: Box::new(GeminiLiveChannel {
                out_tx,
                shutdown,
                closed: AtomicBool::new(false),
                inbound: Mutex::new(Some(inbound.abort_handle())),
            }),
            events: event_rx,
        })
    }
}

// ── Channel ────────────────────────────────────────────────────────

/// Send side of an open Gemini Live session.
///
/// Closing cancels `shutdown`, which stops the writer before it touches
/// anything still queued.
pub struct GeminiLiveChannel {
    out_tx: mpsc::Sender<OutboundMessage>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    inbound: Mutex<Option<AbortHandle>>,
}

impl LiveChannel for GeminiLiveChannel {
    fn send(&self, message: OutboundMessage) -> Result<(), VoiceError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(VoiceError::ChannelClosed);
        }
        self.out_tx
            .try_send(message)
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => VoiceError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => VoiceError::ChannelClosed,
            })
    }

    fn close(&self) -> Result<(), VoiceError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(inbound) = self
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            inbound.abort();
        }
        self.shutdown.cancel();
        Ok(())
    }
}

// ── Internal loops ─────────────────────────────────────────────────

/// Serialise queued messages and write them to the socket in order.
///
/// Cancellation wins over queued messages: once `shutdown` fires, a close
/// frame is written and the backlog is dropped.
async fn outbound_loop<S>(
    mut rx: mpsc::Receiver<OutboundMessage>,
    mut ws_sender: S,
    shutdown: CancellationToken,
) where
    S: Sink<WsMessage> + Unpin,
{
    let mut audio_frames: u64 = 0;
    let mut audio_bytes: u64 = 0;

    loop {
        let message = tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                let _ = ws_sender.send(WsMessage::Close(None)).await;
                tracing::debug!("Outbound loop cancelled");
                break;
            }
            next = rx.recv() => match next {
                Some(message) => message,
                None => break,
            },
        };

        if let OutboundMessage::Audio(frame) = &message {
            audio_frames += 1;
            audio_bytes += frame.as_bytes().len() as u64;
            if audio_frames == 1 || audio_frames % LOG_EVERY_AUDIO_FRAMES == 0 {
                tracing::debug!(
                    frames = audio_frames,
                    total_bytes = audio_bytes,
                    "Sending audio to Gemini Live"
                );
            }
        }

        let json = match encode_outbound(&message) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize outbound message");
                continue;
            }
        };
        if ws_sender.send(WsMessage::text(json)).await.is_err() {
            tracing::warn!("WebSocket send failed, closing outbound loop");
            break;
        }
    }

    tracing::debug!(audio_frames, "Outbound loop terminated");
}

/// Parse a Binary frame carrying a JSON control message.
///
/// Returns `None` for frames that are not JSON objects (leading whitespace
/// allowed) or not valid UTF-8.
fn parse_binary_frame(data: &[u8]) -> Option<Vec<ChannelEvent>> {
    if data.trim_ascii_start().first() != Some(&b'{') {
        tracing::debug!(bytes = data.len(), "Ignoring non-JSON binary frame");
        return None;
    }
    match std::str::from_utf8(data) {
        Ok(text) => Some(parse_server_message(text)),
        Err(e) => {
            tracing::warn!(error = %e, "Skipping binary frame with invalid UTF-8");
            None
        }
    }
}

/// Read frames, parse them and forward events to the session.
async fn inbound_loop(mut ws_receiver: SplitStream<WsStream>, event_tx: mpsc::Sender<ChannelEvent>) {
    let mut frames: u64 = 0;

    let terminal = loop {
        let Some(result) = ws_receiver.next().await else {
            break ChannelEvent::Closed {
                reason: "stream ended".to_string(),
            };
        };
        let events = match result {
            Ok(WsMessage::Text(text)) => parse_server_message(text.as_str()),
            Ok(WsMessage::Binary(data)) => match parse_binary_frame(&data) {
                Some(events) => events,
                None => continue,
            },
            Ok(WsMessage::Close(frame)) => {
                let reason = frame.map_or_else(
                    || "closed without reason".to_string(),
                    |f| format!("{} {}", f.code, f.reason.as_str()),
                );
                break ChannelEvent::Closed { reason };
            }
            Ok(_) => continue,
            Err(e) => {
                break ChannelEvent::Error {
                    message: e.to_string(),
                };
            }
        };

        frames += 1;
        for event in events {
            if event_tx.send(event).await.is_err() {
                tracing::debug!("Event receiver dropped, closing inbound loop");
                return;
            }
        }
    };

    tracing::debug!(frames, event = ?terminal, "Inbound loop terminated");
    let _ = event_tx.send(terminal).await;
}
