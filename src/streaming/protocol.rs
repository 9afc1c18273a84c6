//! Gemini Live API protocol types
//!
//! JSON messages exchanged over the `BidiGenerateContent` WebSocket.
//!
//! # Protocol Overview
//!
//! 1. Connect to `wss://generativelanguage.googleapis.com/ws/...BidiGenerateContent?key=...`
//! 2. Send `{"setup": {...}}` with model, voice and system instruction
//! 3. Receive `{"setupComplete": {}}`
//! 4. Stream microphone audio via `{"realtimeInput": {"mediaChunks": [...]}}`
//! 5. Receive `serverContent` messages carrying reply audio and interruption flags

use serde::{Deserialize, Serialize};

use crate::audio::EncodedBlob;

/// Outbound message contract: one encoded microphone frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundFrame {
    pub media: EncodedBlob,
}

// ============================================================================
// Client Messages (sent TO the Live API)
// ============================================================================

/// Messages sent from client to the Live API
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    /// First message on the socket; configures the session
    Setup(SetupConfig),

    /// Streamed microphone audio
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupConfig {
    /// Fully qualified model name (`models/...`)
    pub model: String,

    pub generation_config: GenerationConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<EncodedBlob>,
}

/// A turn's content, used both for the system instruction and model replies
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<EncodedBlob>,
}

impl ClientMessage {
    /// Build the setup message for an audio-only session.
    ///
    /// `model` may be given with or without the `models/` prefix. Blank
    /// instructions are omitted.
    pub fn setup(model: &str, voice_name: &str, instructions: Option<&str>) -> Self {
        let model = if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{}", model)
        };

        let system_instruction = instructions
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(|text| Content {
                parts: vec![Part {
                    text: Some(text.to_string()),
                    inline_data: None,
                }],
            });

        Self::Setup(SetupConfig {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: Some(SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: voice_name.to_string(),
                        },
                    },
                }),
            },
            system_instruction,
        })
    }
}

impl From<OutboundFrame> for ClientMessage {
    fn from(frame: OutboundFrame) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: vec![frame.media],
        })
    }
}

// ============================================================================
// Server Messages (received FROM the Live API)
// ============================================================================

/// Messages received from the Live API
///
/// The server sends one top-level key per message. Unknown keys are ignored
/// so new message kinds never fail deserialization.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,

    #[serde(default)]
    pub server_content: Option<ServerContent>,

    #[serde(default)]
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,

    /// Model output was cut off by user speech
    #[serde(default)]
    pub interrupted: bool,

    #[serde(default)]
    pub turn_complete: bool,
}

/// Server is about to disconnect
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Reply audio carried in the first part of the model turn, if any
    pub fn inline_audio(&self) -> Option<&EncodedBlob> {
        self.server_content
            .as_ref()?
            .model_turn
            .as_ref()?
            .parts
            .first()?
            .inline_data
            .as_ref()
    }

    pub fn is_interrupted(&self) -> bool {
        self.server_content
            .as_ref()
            .map(|c| c.interrupted)
            .unwrap_or(false)
    }

    pub fn is_turn_complete(&self) -> bool {
        self.server_content
            .as_ref()
            .map(|c| c.turn_complete)
            .unwrap_or(false)
    }
}
