//! Gemini Live API backend
//!
//! Speaks the BidiGenerateContent websocket protocol: a `setup` message, then
//! `realtimeInput` audio and `toolResponse` messages outbound, and
//! `serverContent` / `toolCall` / `toolCallCancellation` / `goAway` inbound.
//! The socket is split into a writer task and a reader task; the engine only
//! sees the [`ClientEvent`] and [`ServerEvent`] channels.

use crate::error::{EngineError, Result};
use crate::session::{ClientEvent, ConversationBackend, ServerEvent, SessionSetup, StreamHandle};
use crate::tools::schema::{ToolCall, ToolDeclaration};
use async_trait::async_trait;
use base64::engine::general_purpose;
use base64::Engine;
use futures_util::{SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

const INBOUND_CHANNEL_DEPTH: usize = 256;

/// Connection settings for the Live API
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub endpoint: String,
    pub api_key: String,
    /// How long `open` waits for `setupComplete`.
    pub setup_timeout: Duration,
}

impl GeminiConfig {
    pub fn from_api_key(api_key: impl Into<String>) -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: api_key.into(),
            setup_timeout: Duration::from_secs(10),
        }
    }

    /// Reads `GEMINI_API_KEY`; `None` if it is unset or empty.
    pub fn from_env() -> Option<Self> {
        match std::env::var("GEMINI_API_KEY") {
            Ok(key) if !key.trim().is_empty() => Some(Self::from_api_key(key.trim())),
            _ => None,
        }
    }

    fn url(&self) -> String {
        format!("{}?key={}", self.endpoint, self.api_key)
    }
}

/// Apply `GEMINI_MODEL`, `LIVE_VOICE` and `LIVE_LANGUAGE` overrides.
pub fn setup_from_env(mut setup: SessionSetup) -> SessionSetup {
    let read = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
    if let Some(model) = read("GEMINI_MODEL") {
        setup.model = model;
    }
    if let Some(voice) = read("LIVE_VOICE") {
        setup.voice = voice;
    }
    if let Some(language) = read("LIVE_LANGUAGE") {
        setup.language = language;
    }
    setup
}

// ---- outbound wire types ----

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
    ToolResponse(ToolResponse),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup {
    model: String,
    generation_config: GenerationConfig,
    system_instruction: Content,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    input_audio_transcription: Option<Empty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_audio_transcription: Option<Empty>,
}

#[derive(Debug, Serialize)]
struct Empty {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<String>,
    speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    voice_config: VoiceConfig,
    language_code: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig {
    voice_name: String,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
struct TextPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolSet {
    function_declarations: Vec<ToolDeclaration>,
}

#[derive(Debug, Serialize)]
struct RealtimeInput {
    audio: Blob,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Blob {
    data: String,
    mime_type: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolResponse {
    function_responses: Vec<FunctionResponse>,
}

#[derive(Debug, Serialize)]
struct FunctionResponse {
    id: String,
    name: String,
    response: FunctionResult,
}

#[derive(Debug, Serialize)]
struct FunctionResult {
    result: String,
}

impl From<&SessionSetup> for Setup {
    fn from(setup: &SessionSetup) -> Self {
        let model = if setup.model.starts_with("models/") {
            setup.model.clone()
        } else {
            format!("models/{}", setup.model)
        };
        let transcription = setup.transcription.then_some(Empty {});
        Self {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: setup.voice.clone(),
                        },
                    },
                    language_code: setup.language.clone(),
                },
            },
            system_instruction: Content {
                parts: vec![TextPart {
                    text: setup.system_instruction.clone(),
                }],
            },
            tools: if setup.tools.is_empty() {
                Vec::new()
            } else {
                vec![ToolSet {
                    function_declarations: setup.tools.clone(),
                }]
            },
            input_audio_transcription: transcription.as_ref().map(|_| Empty {}),
            output_audio_transcription: transcription,
        }
    }
}

/// JSON text of the `setup` message.
pub fn encode_setup(setup: &SessionSetup) -> Result<String> {
    Ok(serde_json::to_string(&ClientMessage::Setup(setup.into()))?)
}

/// JSON text of an outbound audio frame or tool result.
pub fn encode_client_event(event: &ClientEvent) -> Result<String> {
    let message = match event {
        ClientEvent::Audio(frame) => ClientMessage::RealtimeInput(RealtimeInput {
            audio: Blob {
                data: frame.data.clone(),
                mime_type: frame.mime_type.clone(),
            },
        }),
        ClientEvent::ToolResult(result) => ClientMessage::ToolResponse(ToolResponse {
            function_responses: vec![FunctionResponse {
                id: result.id.clone(),
                name: result.name.clone(),
                response: FunctionResult {
                    result: result.result.clone(),
                },
            }],
        }),
    };
    Ok(serde_json::to_string(&message)?)
}

// ---- inbound wire types ----

/// Server -> client message. Every field is optional; unknown ones such as
/// `usageMetadata` are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    tool_call: Option<ToolCallMessage>,
    tool_call_cancellation: Option<ToolCallCancellation>,
    go_away: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<ModelPart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelPart {
    text: Option<String>,
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    data: Option<String>,
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Transcription {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallMessage {
    #[serde(default)]
    function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    id: Option<String>,
    name: Option<String>,
    #[serde(default)]
    args: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallCancellation {
    #[serde(default)]
    ids: Vec<String>,
}

/// One decoded server message.
#[derive(Debug, Default, PartialEq)]
pub struct Decoded {
    pub setup_complete: bool,
    pub events: Vec<ServerEvent>,
}

/// Decode one server message into engine events, in the order they apply:
/// interruption, transcripts, model output, then turn completion.
pub fn parse_server_message(text: &str) -> Result<Decoded> {
    let message: ServerMessage = serde_json::from_str(text)
        .map_err(|e| EngineError::MalformedEvent(format!("unparseable server message: {}", e)))?;
    let mut decoded = Decoded {
        setup_complete: message.setup_complete.is_some(),
        events: Vec::new(),
    };
    let events = &mut decoded.events;

    if let Some(content) = message.server_content {
        if content.interrupted {
            events.push(ServerEvent::Interrupted);
        }
        if let Some(text) = content.input_transcription.and_then(|t| t.text) {
            if !text.is_empty() {
                events.push(ServerEvent::InputTranscript(text));
            }
        }
        if let Some(text) = content.output_transcription.and_then(|t| t.text) {
            if !text.is_empty() {
                events.push(ServerEvent::OutputTranscript(text));
            }
        }
        for part in content.model_turn.map(|turn| turn.parts).unwrap_or_default() {
            if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                events.push(ServerEvent::OutputText(text));
            }
            if let Some(inline) = part.inline_data {
                if let Some(audio) = decode_inline_audio(inline) {
                    events.push(ServerEvent::AudioDelta(audio));
                }
            }
        }
        if content.turn_complete {
            events.push(ServerEvent::TurnComplete);
        }
    }

    if let Some(tool_call) = message.tool_call {
        let calls: Vec<ToolCall> = tool_call
            .function_calls
            .into_iter()
            .filter_map(|call| match (call.id, call.name) {
                (Some(id), Some(name)) => Some(ToolCall {
                    id,
                    name,
                    args: call.args.unwrap_or_default(),
                }),
                (id, name) => {
                    warn!("Skipping function call without id or name (id={:?}, name={:?})", id, name);
                    None
                }
            })
            .collect();
        if !calls.is_empty() {
            events.push(ServerEvent::ToolCalls(calls));
        }
    }

    if let Some(cancellation) = message.tool_call_cancellation {
        events.push(ServerEvent::ToolCallCancellation(cancellation.ids));
    }

    if message.go_away.is_some() {
        events.push(ServerEvent::GoAway);
    }

    Ok(decoded)
}

fn decode_inline_audio(inline: InlineData) -> Option<Vec<u8>> {
    if let Some(mime) = &inline.mime_type {
        if !mime.starts_with("audio/") {
            debug!("Ignoring inline data of type {}", mime);
            return None;
        }
    }
    let Some(data) = inline.data else {
        warn!("Received inline data without data field");
        return None;
    };
    match general_purpose::STANDARD.decode(data) {
        Ok(bytes) if !bytes.is_empty() => Some(bytes),
        Ok(_) => None,
        Err(e) => {
            error!("Failed to decode base64 audio data: {:?}", e);
            None
        }
    }
}

fn close_reason(frame: Option<CloseFrame>) -> Option<String> {
    frame
        .map(|f| format!("{} {}", u16::from(f.code), f.reason.as_str()))
        .map(|s| s.trim().to_string())
}

/// Text payload of a data message. Binary frames carry JSON too.
fn message_text(message: &Message) -> Option<&str> {
    match message {
        Message::Text(text) => Some(text.as_str()),
        Message::Binary(bytes) => std::str::from_utf8(bytes).ok(),
        _ => None,
    }
}

async fn wait_for_setup_complete<S>(stream: &mut S) -> Result<()>
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    while let Some(message) = stream.next().await {
        let message = message?;
        if let Message::Close(frame) = message {
            let reason = close_reason(frame).unwrap_or_default();
            return Err(EngineError::Channel(format!("closed during setup: {}", reason)));
        }
        let Some(text) = message_text(&message) else {
            continue;
        };
        match parse_server_message(text) {
            Ok(decoded) if decoded.setup_complete => return Ok(()),
            Ok(_) => debug!("Ignoring message received before setupComplete"),
            Err(e) => warn!("{}", e),
        }
    }
    Err(EngineError::Channel("connection ended during setup".to_string()))
}

/// [`ConversationBackend`] for the Gemini Live API
pub struct GeminiBackend {
    config: GeminiConfig,
}

impl GeminiBackend {
    pub fn new(config: GeminiConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ConversationBackend for GeminiBackend {
    async fn open(&self, setup: &SessionSetup) -> Result<StreamHandle> {
        info!("Connecting to Gemini Live at {}", self.config.endpoint);
        let (ws_stream, resp) = connect_async(self.config.url()).await?;
        debug!("WebSocket connection response: {:?}", resp.status());

        let (mut sink, mut stream) = ws_stream.split();

        info!("Sending setup for model {} (voice {}, {})", setup.model, setup.voice, setup.language);
        sink.send(Message::Text(encode_setup(setup)?.into())).await?;

        tokio::time::timeout(self.config.setup_timeout, wait_for_setup_complete(&mut stream))
            .await
            .map_err(|_| {
                error!("Timeout waiting for setup complete message");
                EngineError::Timeout("waiting for setupComplete".to_string())
            })??;
        info!("Gemini session setup complete");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (in_tx, in_rx) = mpsc::channel::<ServerEvent>(INBOUND_CHANNEL_DEPTH);

        // Writer: runs until the engine drops its sender, then closes the socket.
        tokio::spawn(async move {
            while let Some(event) = out_rx.recv().await {
                let json = match encode_client_event(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Failed to encode outbound message: {}", e);
                        continue;
                    }
                };
                if let ClientEvent::ToolResult(result) = &event {
                    debug!("Sending tool response for {} ({})", result.name, result.id);
                }
                if let Err(e) = sink.send(Message::Text(json.into())).await {
                    warn!("Failed to send message: {:?}", e);
                    break;
                }
            }
            let _ = sink.close().await;
            debug!("Outbound task terminated");
        });

        // Reader: forwards decoded events until the socket or the engine goes away.
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = in_tx.closed() => break,
                    message = stream.next() => message,
                };
                let message = match message {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        error!("WebSocket error: {:?}", e);
                        let _ = in_tx.send(ServerEvent::Error(e.to_string())).await;
                        break;
                    }
                    None => {
                        let _ = in_tx.send(ServerEvent::Closed(None)).await;
                        break;
                    }
                };
                if let Message::Close(frame) = message {
                    let reason = close_reason(frame);
                    info!("WebSocket closed: {:?}", reason);
                    let _ = in_tx.send(ServerEvent::Closed(reason)).await;
                    break;
                }
                let Some(text) = message_text(&message) else {
                    continue;
                };
                let decoded = match parse_server_message(text) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        warn!("{}", e);
                        continue;
                    }
                };
                for event in decoded.events {
                    if in_tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
            debug!("Inbound task terminated");
        });

        Ok(StreamHandle {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
