//! # Relay Message Types
//!
//! The relay speaks two vocabularies:
//!
//! - **Client → server** ([`ClientMessage`]): a closed set of variants parsed
//!   and validated at the socket boundary. Anything that does not fit is
//!   dropped silently (no error frame), because binary audio and the odd
//!   malformed control frame share the same socket and precise diagnostics
//!   are not worth a round trip.
//! - **Server → client** ([`RelayNotice`]): `{type: "status" | "error", message, ...}`
//!   frames for lifecycle events. Upstream events are forwarded verbatim and
//!   do not go through this type.
//!
//! ## Client frame shapes:
//! - binary: raw PCM16, tagged upstream with the configured input MIME type
//!   (`audio/pcm;rate=16000` by default)
//! - `{"media": {"data": "<base64>", "mimeType": "audio/pcm;rate=16000"}}`
//! - `{"text": "..."}`: a user instruction turn
//! - `{"generationConfig": {...}}`, `{"clientContent": {...}}`, ...:
//!   forwarded upstream verbatim when every top-level key is a Live API
//!   client field

use base64::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Default MIME tag for raw binary frames forwarded as realtime input.
pub const REALTIME_AUDIO_MIME: &str = "audio/pcm;rate=16000";

/// Top-level keys a passthrough object may carry.
pub const PASSTHROUGH_KEYS: &[&str] = &[
    "setup",
    "clientContent",
    "realtimeInput",
    "toolResponse",
    "generationConfig",
    "systemInstruction",
    "tools",
];

/// A validated message received from the browser.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Raw PCM16 bytes from a binary frame
    Audio(Vec<u8>),
    /// Pre-encoded realtime media from a `{media: {...}}` frame
    Media(MediaChunk),
    /// Free-form user instruction
    Instruction(String),
    /// Live API client object forwarded as-is
    Passthrough(Map<String, Value>),
}

/// One chunk of realtime media, already base64 encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaChunk {
    pub data: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
}

#[derive(Deserialize)]
struct MediaEnvelope {
    media: MediaChunk,
}

impl ClientMessage {
    /// Binary frames are always audio. Their contents are not inspected.
    pub fn from_binary(data: &[u8]) -> Self {
        ClientMessage::Audio(data.to_vec())
    }

    /// Parse a text frame. Returns `None` for anything outside the vocabulary.
    pub fn from_text(text: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(text).ok()?;
        let Value::Object(map) = value else {
            return None;
        };

        if map.contains_key("media") {
            let envelope: MediaEnvelope = serde_json::from_value(Value::Object(map)).ok()?;
            return Some(ClientMessage::Media(envelope.media));
        }

        if map.len() == 1 {
            if let Some(Value::String(text)) = map.get("text") {
                return Some(ClientMessage::Instruction(text.clone()));
            }
        }

        if !map.is_empty() && map.keys().all(|k| PASSTHROUGH_KEYS.contains(&k.as_str())) {
            return Some(ClientMessage::Passthrough(map));
        }

        None
    }
}

/// What the relay hands to the upstream session.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamRequest {
    /// Realtime audio input
    RealtimeInput(MediaChunk),
    /// Generic send path
    Send(Value),
}

impl UpstreamRequest {
    /// Map a client message onto the upstream API. Raw binary audio is
    /// tagged with `audio_mime`; media frames keep their own tag.
    pub fn from_client(message: ClientMessage, audio_mime: &str) -> Self {
        match message {
            ClientMessage::Audio(bytes) => UpstreamRequest::RealtimeInput(MediaChunk {
                data: BASE64_STANDARD.encode(bytes),
                mime_type: audio_mime.to_string(),
            }),
            ClientMessage::Media(chunk) => UpstreamRequest::RealtimeInput(chunk),
            ClientMessage::Instruction(text) => UpstreamRequest::Send(json!({
                "clientContent": {
                    "turns": [{ "role": "user", "parts": [{ "text": text }] }],
                    "turnComplete": true
                }
            })),
            ClientMessage::Passthrough(map) => UpstreamRequest::Send(Value::Object(map)),
        }
    }
}

/// Lifecycle frames sent to the browser.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayNotice {
    Status {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl RelayNotice {
    pub fn status(message: impl Into<String>) -> Self {
        RelayNotice::Status {
            message: message.into(),
            code: None,
            reason: None,
        }
    }

    pub fn closed(code: Option<u16>, reason: impl Into<String>) -> Self {
        RelayNotice::Status {
            message: "Gemini session closed".to_string(),
            code,
            reason: Some(reason.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        RelayNotice::Error {
            message: message.into(),
            detail: None,
        }
    }

    pub fn error_with_detail(message: impl Into<String>, detail: impl Into<String>) -> Self {
        RelayNotice::Error {
            message: message.into(),
            detail: Some(detail.into()),
        }
    }

    /// Serialize for a text frame. The enum only holds strings and integers,
    /// so serialization cannot fail.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}
