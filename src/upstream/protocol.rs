//! Realtime API events, decoded at the socket boundary.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::Result;
use crate::tool_gateway::{ToolCallResult, ToolDefinition};

/// Event types that carry nothing the relay acts on.
pub const IGNORED_EVENTS: &[&str] = &[
    "response.function_call_arguments.delta",
    "rate_limits.updated",
    "response.audio_transcript.delta",
    "response.created",
    "response.content_part.added",
    "response.content_part.done",
    "conversation.item.created",
    "response.audio.done",
    "session.created",
    "session.updated",
    "response.done",
    "response.output_item.done",
];

/// Inbound event from the upstream service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// base64 PCM16 at the upstream rate
    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,

    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        call_id: String,
        name: String,
        arguments: String,
    },

    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone { transcript: String },

    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted { transcript: String },

    #[serde(rename = "error")]
    Error { error: Value },

    /// Any other `type`, kept verbatim.
    #[serde(skip)]
    Other { kind: String, raw: Value },
}

impl ServerEvent {
    /// Decode one text frame. Only non-JSON input is an error; unknown or
    /// unexpected shapes come back as [`ServerEvent::Other`].
    pub fn decode(text: &str) -> Result<Self> {
        let raw: Value = serde_json::from_str(text)?;
        match Self::deserialize(&raw) {
            Ok(event) => Ok(event),
            Err(_) => {
                let kind = raw
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(ServerEvent::Other { kind, raw })
            }
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            ServerEvent::AudioDelta { .. } => "response.audio.delta",
            ServerEvent::SpeechStarted => "input_audio_buffer.speech_started",
            ServerEvent::FunctionCallArgumentsDone { .. } => "response.function_call_arguments.done",
            ServerEvent::AudioTranscriptDone { .. } => "response.audio_transcript.done",
            ServerEvent::InputTranscriptionCompleted { .. } => {
                "conversation.item.input_audio_transcription.completed"
            }
            ServerEvent::Error { .. } => "error",
            ServerEvent::Other { kind, .. } => kind.as_str(),
        }
    }

    pub fn is_ignored(&self) -> bool {
        matches!(self, ServerEvent::Other { kind, .. } if IGNORED_EVENTS.contains(&kind.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptionConfig {
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionConfig {
    pub instructions: String,
    pub input_audio_transcription: TranscriptionConfig,
    pub tools: Vec<ToolDefinition>,
    pub input_audio_format: &'static str,
    pub output_audio_format: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    InputAudio { audio: String },
    InputText { text: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationItem {
    FunctionCallOutput {
        id: String,
        call_id: String,
        output: String,
    },
    Message {
        role: &'static str,
        content: Vec<ContentPart>,
    },
}

/// Outbound event to the upstream service.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },

    #[serde(rename = "response.create")]
    ResponseCreate { response: Value },

    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },
}

impl ClientEvent {
    pub fn session_update(
        instructions: impl Into<String>,
        transcription_model: impl Into<String>,
        tools: Vec<ToolDefinition>,
    ) -> Self {
        ClientEvent::SessionUpdate {
            session: SessionConfig {
                instructions: instructions.into(),
                input_audio_transcription: TranscriptionConfig {
                    model: transcription_model.into(),
                },
                tools,
                input_audio_format: "pcm16",
                output_audio_format: "pcm16",
            },
        }
    }

    /// `function_call_output` item for a finished tool call.
    pub fn tool_output(result: &ToolCallResult) -> Self {
        ClientEvent::ConversationItemCreate {
            item: ConversationItem::FunctionCallOutput {
                id: result.call_id.clone(),
                call_id: result.call_id.clone(),
                output: result.output_text(),
            },
        }
    }

    /// User message carrying one base64 PCM16 clip.
    pub fn user_audio(audio_base64: String) -> Self {
        ClientEvent::ConversationItemCreate {
            item: ConversationItem::Message {
                role: "user",
                content: vec![ContentPart::InputAudio {
                    audio: audio_base64,
                }],
            },
        }
    }

    pub fn response_create() -> Self {
        ClientEvent::ResponseCreate { response: json!({}) }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
