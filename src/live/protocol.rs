//! JSON messages exchanged with the speech service
//!
//! The relay forwards these opaquely; only the live client builds and parses
//! them.

use serde::{Deserialize, Serialize};

use crate::config::ClientConfig;
use crate::voice::AudioFrame;
use crate::voice::pcm::{PCM_MIME_PREFIX, parse_pcm_rate};
use crate::{Error, Result};

/// Fallback text when the service reports an error without a message
const UNKNOWN_SERVICE_ERROR: &str = "server error";

/// Outgoing message to the service
#[derive(Debug, Serialize)]
pub enum ClientMessage {
    #[serde(rename = "setup")]
    Setup(Setup),
    #[serde(rename = "realtimeInput")]
    RealtimeInput(RealtimeInput),
    #[serde(rename = "client_content")]
    ClientContent(ClientContent),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
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
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Serialize)]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

/// A turn or instruction made of parts
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<MediaChunk>,
}

impl Part {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            inline_data: None,
        }
    }
}

impl ClientMessage {
    /// Handshake message sent once the link opens
    #[must_use]
    pub fn setup(config: &ClientConfig) -> Self {
        Self::Setup(Setup {
            model: config.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice_name.clone(),
                        },
                    },
                },
            },
            system_instruction: Content {
                role: None,
                parts: vec![Part::text(config.system_instruction.as_str())],
            },
        })
    }

    /// One captured audio frame
    #[must_use]
    pub fn audio(frame: &AudioFrame) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: vec![MediaChunk {
                mime_type: frame.mime_type(),
                data: frame.to_base64(),
            }],
        })
    }

    /// A complete user text turn
    #[must_use]
    pub fn user_text(text: &str) -> Self {
        Self::ClientContent(ClientContent {
            turns: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part::text(text)],
            }],
            turn_complete: true,
        })
    }

    /// Serialize to a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Incoming message from the service
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
}

/// What a server message means to the client
#[derive(Debug, PartialEq)]
pub enum ServerEvent {
    SetupComplete,
    Audio(AudioFrame),
    TurnComplete,
    /// The user spoke over the model; queued speech is stale
    Interrupted,
    Error(String),
}

/// Parse one inbound text frame into events
///
/// Audio parts without a rate tag are taken to be at `default_rate`. A part
/// whose payload fails to decode is skipped; the rest of the message is kept.
///
/// # Errors
///
/// Returns `Protocol` if the frame is not a JSON object
pub fn parse_server_message(text: &str, default_rate: u32) -> Result<Vec<ServerEvent>> {
    let message: ServerMessage = serde_json::from_str(text)
        .map_err(|e| Error::Protocol(format!("invalid server message: {e}")))?;

    let mut events = Vec::new();

    if message.setup_complete.as_ref().is_some_and(|v| !v.is_null()) {
        events.push(ServerEvent::SetupComplete);
    }

    if let Some(content) = message.server_content {
        if content.interrupted {
            events.push(ServerEvent::Interrupted);
        }

        let parts = content.model_turn.map(|t| t.parts).unwrap_or_default();
        for part in parts {
            let Some(data) = part.inline_data else {
                continue;
            };
            if !data.mime_type.starts_with(PCM_MIME_PREFIX) {
                continue;
            }
            let rate = parse_pcm_rate(&data.mime_type).unwrap_or(default_rate);
            match AudioFrame::from_base64(&data.data, rate) {
                Ok(frame) => events.push(ServerEvent::Audio(frame)),
                Err(e) => tracing::warn!(error = %e, "skipping undecodable audio part"),
            }
        }

        if content.turn_complete {
            events.push(ServerEvent::TurnComplete);
        }
    }

    if let Some(error) = message.error.filter(|e| !e.is_null()) {
        events.push(ServerEvent::Error(error_message(&error)));
    }

    Ok(events)
}

fn error_message(error: &serde_json::Value) -> String {
    error
        .get("message")
        .and_then(serde_json::Value::as_str)
        .or_else(|| error.as_str())
        .filter(|m| !m.is_empty())
        .unwrap_or(UNKNOWN_SERVICE_ERROR)
        .to_string()
}
