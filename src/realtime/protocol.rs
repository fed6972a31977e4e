//! OpenAI Realtime API protocol types
//!
//! This module defines the JSON event envelope exchanged with the
//! Realtime API over WebSocket, and the codec between frames and typed events.
//!
//! # Protocol Overview
//!
//! 1. Connect to `wss://api.openai.com/v1/realtime?model=...` with the
//!    beta and ephemeral-key subprotocols
//! 2. Receive `session.created`
//! 3. Send `session.update` with the conversation's [`SessionConfig`]
//! 4. Stream microphone audio via `input_audio_buffer.append`
//! 5. `input_audio_buffer.commit` + `response.create` when the user stops talking
//! 6. Receive `response.audio.delta` (AI speech) and transcript events

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::transcript::Speaker;
use crate::audio::codec::{base64_to_bytes, bytes_to_base64};

/// OpenAI Realtime API endpoint (model is appended as a query parameter)
pub const REALTIME_API_URL: &str = "wss://api.openai.com/v1/realtime";

/// Realtime model used when settings don't override it
pub const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview-2024-10-01";

/// Subprotocol selecting the v1 beta event protocol
pub const BETA_SUBPROTOCOL: &str = "openai-beta.realtime=v1";

/// Subprotocol prefix carrying the ephemeral key
pub const API_KEY_SUBPROTOCOL_PREFIX: &str = "openai-insecure-api-key.";

// ============================================================================
// Session configuration
// ============================================================================

/// Wire audio sample format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    /// 16-bit signed little-endian PCM, 24kHz mono
    #[default]
    Pcm16,
    G711Ulaw,
    G711Alaw,
}

/// Server-side voice activity detection policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "server_vad")]
pub struct TurnDetection {
    /// Activation threshold (0.0 to 1.0)
    pub threshold: f32,
    /// Audio kept before detected speech (ms)
    pub prefix_padding_ms: u32,
    /// Silence that ends a turn (ms)
    pub silence_duration_ms: u32,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
        }
    }
}

/// Transcription model configuration for user speech
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    pub model: String,
}

/// Per-conversation session parameters
///
/// Built once per conversation and handed to `connect` by value; the
/// connection keeps it behind an `Arc` and never changes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Natural-language system instructions
    pub instructions: String,
    /// Voice identifier for synthesized speech
    pub voice: String,
    pub input_audio_format: AudioFormat,
    pub output_audio_format: AudioFormat,
    /// `None` disables server VAD (manual turns)
    pub turn_detection: Option<TurnDetection>,
    /// `None` disables transcription of user speech
    pub input_audio_transcription: Option<TranscriptionConfig>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            instructions: String::new(),
            voice: "alloy".to_string(),
            input_audio_format: AudioFormat::Pcm16,
            output_audio_format: AudioFormat::Pcm16,
            turn_detection: Some(TurnDetection::default()),
            input_audio_transcription: Some(TranscriptionConfig {
                model: "whisper-1".to_string(),
            }),
        }
    }
}

impl SessionConfig {
    /// Default configuration with the given instructions
    pub fn new(instructions: impl Into<String>) -> Self {
        Self {
            instructions: instructions.into(),
            ..Default::default()
        }
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = voice.into();
        self
    }

    pub fn with_turn_detection(mut self, turn_detection: Option<TurnDetection>) -> Self {
        self.turn_detection = turn_detection;
        self
    }

    pub fn with_transcription_model(mut self, model: Option<&str>) -> Self {
        self.input_audio_transcription = model.map(|m| TranscriptionConfig {
            model: m.to_string(),
        });
        self
    }
}

// ============================================================================
// Typed events
// ============================================================================

/// Events sent from the client to the Realtime API
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    /// Push the session configuration (always the first frame)
    SessionUpdate(Arc<SessionConfig>),
    /// Raw PCM16 bytes, base64-encoded on the wire
    AudioAppend(Vec<u8>),
    /// Flush buffered input audio into a user turn
    AudioCommit,
    /// Ask the model to respond
    ResponseCreate,
    /// Add a user text message to the conversation
    ConversationItemCreate(String),
}

impl OutboundEvent {
    /// Wire `type` tag of this event
    pub fn tag(&self) -> &'static str {
        match self {
            OutboundEvent::SessionUpdate(_) => "session.update",
            OutboundEvent::AudioAppend(_) => "input_audio_buffer.append",
            OutboundEvent::AudioCommit => "input_audio_buffer.commit",
            OutboundEvent::ResponseCreate => "response.create",
            OutboundEvent::ConversationItemCreate(_) => "conversation.item.create",
        }
    }
}

/// Error information from the API
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ApiErrorInfo {
    /// Error category, e.g. `invalid_request_error`
    #[serde(rename = "type", default)]
    pub error_type: String,

    #[serde(default)]
    pub code: Option<String>,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub param: Option<String>,
}

impl ApiErrorInfo {
    /// The ephemeral key was rejected by the server
    pub fn is_invalid_api_key(&self) -> bool {
        self.code.as_deref() == Some("invalid_api_key")
    }
}

/// Events received from the Realtime API
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Error(ApiErrorInfo),
    SessionCreated,
    SessionUpdated,
    /// Decoded PCM16 bytes of synthesized speech
    AudioDelta(Vec<u8>),
    /// Streaming fragment of a transcript
    TranscriptDelta { speaker: Speaker, text: String },
    /// Completed transcript of a user utterance or AI response
    TranscriptDone { speaker: Speaker, text: String },
    /// Text of a message item the model added (if it carried text)
    ContentItemAdded(Option<String>),
    ResponseDone,
    /// Any tag this client doesn't know
    Unhandled(String),
}

/// Frame-level codec failures
///
/// These are per-frame: the connection logs them and drops the frame.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Frame is not valid JSON: {0}")]
    Malformed(String),

    #[error("Frame has no string `type` field")]
    MissingType,

    #[error("Invalid `{tag}` payload: {reason}")]
    InvalidPayload { tag: String, reason: String },

    #[error("Failed to encode `{tag}`: {reason}")]
    Encode { tag: &'static str, reason: String },
}

// ============================================================================
// Wire representation
// ============================================================================

/// `session.update` body: the config plus fixed modalities
#[derive(Serialize)]
struct SessionPayload<'a> {
    modalities: [&'static str; 2],
    #[serde(flatten)]
    config: &'a SessionConfig,
}

#[derive(Serialize)]
struct ConversationItem<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    role: &'static str,
    content: [InputContent<'a>; 1],
}

#[derive(Serialize)]
struct InputContent<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    text: &'a str,
}

/// Messages sent from client to OpenAI Realtime API
#[derive(Serialize)]
#[serde(tag = "type")]
enum ClientMessage<'a> {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionPayload<'a> },

    #[serde(rename = "input_audio_buffer.append")]
    AudioAppend {
        /// Base64-encoded PCM16 audio data
        audio: String,
    },

    #[serde(rename = "input_audio_buffer.commit")]
    AudioCommit,

    #[serde(rename = "response.create")]
    ResponseCreate,

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem<'a> },
}

#[derive(Debug, Deserialize)]
struct OutputItem {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    content: Vec<OutputContent>,
}

#[derive(Debug, Deserialize)]
struct OutputContent {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// Messages received from OpenAI Realtime API
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ServerMessage {
    #[serde(rename = "error")]
    Error { error: ApiErrorInfo },

    #[serde(rename = "session.created")]
    SessionCreated,

    #[serde(rename = "session.updated")]
    SessionUpdated,

    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },

    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta { delta: String },

    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone { transcript: String },

    #[serde(rename = "response.text.delta")]
    TextDelta { delta: String },

    #[serde(rename = "response.text.done")]
    TextDone { text: String },

    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    InputTranscriptDelta { delta: String },

    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptCompleted { transcript: String },

    #[serde(rename = "response.output_item.added")]
    OutputItemAdded { item: OutputItem },

    #[serde(rename = "response.done")]
    ResponseDone,

    /// Catch-all for message types we don't handle
    #[serde(other)]
    Unknown,
}

/// Serialize an outbound event into one text frame
pub fn encode(event: &OutboundEvent) -> Result<String, ProtocolError> {
    let message = match event {
        OutboundEvent::SessionUpdate(config) => ClientMessage::SessionUpdate {
            session: SessionPayload {
                modalities: ["text", "audio"],
                config,
            },
        },
        OutboundEvent::AudioAppend(bytes) => ClientMessage::AudioAppend {
            audio: bytes_to_base64(bytes),
        },
        OutboundEvent::AudioCommit => ClientMessage::AudioCommit,
        OutboundEvent::ResponseCreate => ClientMessage::ResponseCreate,
        OutboundEvent::ConversationItemCreate(text) => ClientMessage::ConversationItemCreate {
            item: ConversationItem {
                kind: "message",
                role: "user",
                content: [InputContent {
                    kind: "input_text",
                    text,
                }],
            },
        },
    };

    serde_json::to_string(&message).map_err(|e| ProtocolError::Encode {
        tag: event.tag(),
        reason: e.to_string(),
    })
}

/// Parse one inbound text frame
///
/// Unknown tags decode to [`InboundEvent::Unhandled`]; only frames that are
/// unparseable, untagged, or carry a broken payload for a known tag fail.
pub fn decode(frame: &str) -> Result<InboundEvent, ProtocolError> {
    let value: Value =
        serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let tag = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_string();

    let invalid = |reason: String| ProtocolError::InvalidPayload {
        tag: tag.clone(),
        reason,
    };

    let message = ServerMessage::deserialize(&value).map_err(|e| invalid(e.to_string()))?;

    let event = match message {
        ServerMessage::Error { error } => InboundEvent::Error(error),
        ServerMessage::SessionCreated => InboundEvent::SessionCreated,
        ServerMessage::SessionUpdated => InboundEvent::SessionUpdated,
        ServerMessage::AudioDelta { delta } => {
            InboundEvent::AudioDelta(base64_to_bytes(&delta).map_err(|e| invalid(e.to_string()))?)
        }
        ServerMessage::AudioTranscriptDelta { delta } | ServerMessage::TextDelta { delta } => {
            InboundEvent::TranscriptDelta {
                speaker: Speaker::Ai,
                text: delta,
            }
        }
        ServerMessage::InputTranscriptDelta { delta } => InboundEvent::TranscriptDelta {
            speaker: Speaker::User,
            text: delta,
        },
        ServerMessage::InputTranscriptCompleted { transcript } => InboundEvent::TranscriptDone {
            speaker: Speaker::User,
            text: transcript,
        },
        ServerMessage::TextDone { text } => InboundEvent::TranscriptDone {
            speaker: Speaker::Ai,
            text,
        },
        ServerMessage::AudioTranscriptDone { transcript } => InboundEvent::TranscriptDone {
            speaker: Speaker::Ai,
            text: transcript,
        },
        ServerMessage::OutputItemAdded { item } => {
            InboundEvent::ContentItemAdded(first_message_text(item))
        }
        ServerMessage::ResponseDone => InboundEvent::ResponseDone,
        ServerMessage::Unknown => InboundEvent::Unhandled(tag),
    };

    Ok(event)
}

fn first_message_text(item: OutputItem) -> Option<String> {
    if item.kind != "message" {
        return None;
    }
    item.content
        .into_iter()
        .find(|c| c.kind == "text")
        .and_then(|c| c.text)
        .filter(|t| !t.is_empty())
}
