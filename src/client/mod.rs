//! # Voice Client
//!
//! The caller's side of a voice call: owns the relay connection, the capture
//! processor's frame receiver and playback of returned audio, and exposes a
//! small call / mute / volume contract to whatever UI drives it.
//!
//! ## Call states:
//! ```text
//! Disconnected --connect--> Connecting --socket open--> Connected
//! Connected --start_call--> InCall --stop_call--> Connected
//! any --socket closed--> Disconnected
//! ```
//!
//! ## Seams:
//! - [`RelayLink`]: where outbound frames go (see [`transport`] for the
//!   WebSocket implementation)
//! - [`AudioSink`]: where decoded model audio is played
//!
//! The client never blocks: capture frames are pulled with [`VoiceClient::pump_capture`]
//! and server frames are pushed in with [`VoiceClient::handle_server_text`].

pub mod transport;

use crate::audio::capture::{frame_channel, CaptureFormat, FrameReceiver, MicProcessor};
use crate::audio::pcm::{decode_le, pcm16_to_float, rms_level};
use crate::config::AppConfig;
use base64::prelude::*;
use serde_json::{json, Value};
use std::fmt;
use tracing::{debug, info, warn};

/// Connection and call state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Disconnected,
    Connecting,
    Connected,
    InCall,
}

/// Errors from the client seams.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientError {
    /// The relay link is gone
    LinkClosed,
    /// Could not reach the relay
    Connect(String),
    /// The sink refused a clip
    Playback(String),
    /// Inline audio payload was not valid
    InvalidAudio(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::LinkClosed => write!(f, "Relay link is closed"),
            ClientError::Connect(msg) => write!(f, "Failed to connect to relay: {}", msg),
            ClientError::Playback(msg) => write!(f, "Playback failed: {}", msg),
            ClientError::InvalidAudio(msg) => write!(f, "Invalid audio payload: {}", msg),
        }
    }
}

impl std::error::Error for ClientError {}

pub type ClientResult<T> = Result<T, ClientError>;

/// Outbound half of the relay connection.
pub trait RelayLink {
    fn send_binary(&self, data: Vec<u8>) -> ClientResult<()>;
    fn send_text(&self, text: String) -> ClientResult<()>;
    fn close(&self);
}

/// Playback of model audio.
pub trait AudioSink {
    /// Start playing a clip. The owner reports the end of playback through
    /// [`VoiceClient::on_playback_ended`].
    fn play(&mut self, clip: AudioClip, volume: f32) -> ClientResult<()>;
}

/// A decoded inline-audio payload.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl AudioClip {
    /// Whether the payload is raw PCM16 rather than a container format.
    pub fn is_pcm(&self) -> bool {
        self.mime_type.starts_with("audio/pcm")
    }

    /// Sample rate from a `audio/pcm;rate=NNNN` MIME type.
    pub fn sample_rate(&self) -> Option<u32> {
        self.mime_type
            .split(';')
            .filter_map(|part| part.trim().strip_prefix("rate="))
            .find_map(|rate| rate.parse().ok())
    }

    /// Float samples for a PCM clip.
    pub fn pcm_samples(&self) -> ClientResult<Vec<f32>> {
        if !self.is_pcm() {
            return Err(ClientError::InvalidAudio(format!(
                "{} is not raw PCM",
                self.mime_type
            )));
        }
        let samples = decode_le(&self.data).map_err(ClientError::InvalidAudio)?;
        Ok(samples.into_iter().map(pcm16_to_float).collect())
    }
}

/// What a server frame meant to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Status frames, unparseable frames, frames without content
    Ignored,
    /// Relay or upstream error, for the error banner
    Error(String),
    /// A clip was handed to the sink
    Playing { mime_type: String, bytes: usize },
    /// Model text
    Transcript(String),
}

/// Voice call state machine.
pub struct VoiceClient<L: RelayLink, S: AudioSink> {
    state: CallState,
    link: Option<L>,
    sink: S,
    frames: Option<FrameReceiver>,
    greeting: String,
    format: CaptureFormat,
    muted: bool,
    volume: f32,
    speaking: bool,
    mic_level: f32,
    last_error: Option<String>,
}

impl<L: RelayLink, S: AudioSink> VoiceClient<L, S> {
    pub fn new(sink: S, greeting: impl Into<String>) -> Self {
        Self {
            state: CallState::Disconnected,
            link: None,
            sink,
            frames: None,
            greeting: greeting.into(),
            format: CaptureFormat::default(),
            muted: false,
            volume: 1.0,
            speaking: false,
            mic_level: 0.0,
            last_error: None,
        }
    }

    /// Client using the configured greeting and capture format.
    pub fn from_config(sink: S, config: &AppConfig) -> Self {
        let mut client = Self::new(sink, config.relay.greeting.clone());
        client.format = CaptureFormat::from(&config.audio);
        client
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    pub fn mic_level(&self) -> f32 {
        self.mic_level
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Begin connecting over `link`. Ignored unless disconnected.
    pub fn connect(&mut self, link: L) {
        if self.state != CallState::Disconnected {
            debug!("connect ignored in state {:?}", self.state);
            return;
        }
        self.link = Some(link);
        self.last_error = None;
        self.state = CallState::Connecting;
    }

    pub fn on_socket_open(&mut self) {
        if self.state == CallState::Connecting {
            info!("Relay connection open");
            self.state = CallState::Connected;
        }
    }

    /// The relay socket closed, from either side.
    pub fn on_socket_closed(&mut self) {
        self.stop_call();
        self.link = None;
        self.state = CallState::Disconnected;
        info!("Relay connection closed");
    }

    /// Start capturing.
    ///
    /// Returns the processor to install on the audio thread, or `None` when
    /// not connected or already in a call. The greeting goes out once, after
    /// the capture channel is wired.
    pub fn start_call(&mut self, native_sample_rate: u32) -> ClientResult<Option<MicProcessor>> {
        if self.state != CallState::Connected {
            return Ok(None);
        }
        let link = self.link.as_ref().ok_or(ClientError::LinkClosed)?;

        let (port, frames) = frame_channel();
        let processor = MicProcessor::with_format(native_sample_rate, self.format, port);

        link.send_text(json!({ "text": self.greeting }).to_string())?;

        self.frames = Some(frames);
        self.state = CallState::InCall;
        info!(native_sample_rate, step = processor.step(), "Call started");
        Ok(Some(processor))
    }

    /// Drain captured frames and send them. Returns how many were sent.
    ///
    /// The mic level follows the newest frame even while muted.
    pub fn pump_capture(&mut self) -> usize {
        let (Some(frames), Some(link)) = (self.frames.as_mut(), self.link.as_ref()) else {
            return 0;
        };

        let mut sent = 0;
        while let Ok(frame) = frames.try_recv() {
            self.mic_level = rms_level(frame.samples());
            if self.muted {
                continue;
            }
            match link.send_binary(frame.to_le_bytes()) {
                Ok(()) => sent += 1,
                Err(err) => debug!("Dropped capture frame: {}", err),
            }
        }
        sent
    }

    /// End the call. Safe to call at any time.
    pub fn stop_call(&mut self) {
        // Dropping the receiver turns later processor sends into no-ops
        self.frames = None;
        self.speaking = false;
        self.mic_level = 0.0;
        if self.state == CallState::InCall {
            self.state = CallState::Connected;
            info!("Call stopped");
        }
    }

    /// Close the relay connection.
    pub fn disconnect(&mut self) {
        if let Some(link) = &self.link {
            link.close();
        }
        self.on_socket_closed();
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    /// Set playback volume, clamped to [0, 1].
    pub fn set_volume(&mut self, volume: f32) {
        self.volume = if volume.is_nan() { 0.0 } else { volume.clamp(0.0, 1.0) };
    }

    /// Interpret one text frame from the relay.
    pub fn handle_server_text(&mut self, text: &str) -> ClientEvent {
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            return ClientEvent::Ignored;
        };

        match value.get("type").and_then(Value::as_str) {
            Some("status") => return ClientEvent::Ignored,
            Some("error") => {
                let message = value
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown error")
                    .to_string();
                warn!("Relay error: {}", message);
                self.last_error = Some(message.clone());
                return ClientEvent::Error(message);
            }
            _ => {}
        }

        let parts = content_parts(&value);

        if let Some(inline) = parts.iter().find_map(|part| part.get("inlineData")) {
            return match decode_inline(inline) {
                Ok(clip) => self.play(clip),
                Err(err) => {
                    debug!("Skipping inline data: {}", err);
                    ClientEvent::Ignored
                }
            };
        }

        let transcript: String = parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect();
        if transcript.is_empty() {
            ClientEvent::Ignored
        } else {
            ClientEvent::Transcript(transcript)
        }
    }

    fn play(&mut self, clip: AudioClip) -> ClientEvent {
        let mime_type = clip.mime_type.clone();
        let bytes = clip.data.len();
        match self.sink.play(clip, self.volume) {
            Ok(()) => {
                self.speaking = true;
                ClientEvent::Playing { mime_type, bytes }
            }
            Err(err) => {
                debug!("Playback refused: {}", err);
                ClientEvent::Ignored
            }
        }
    }

    /// The sink finished a clip. Returns whether the speaking indicator
    /// changed.
    pub fn on_playback_ended(&mut self) -> bool {
        std::mem::replace(&mut self.speaking, false)
    }
}

/// Content parts from either response shape:
/// `candidates[0].content.parts[0]` or `serverContent.modelTurn.parts[*]`.
fn content_parts(value: &Value) -> Vec<&Value> {
    if let Some(part) = value.pointer("/candidates/0/content/parts/0") {
        return vec![part];
    }
    value
        .pointer("/serverContent/modelTurn/parts")
        .and_then(Value::as_array)
        .map(|parts| parts.iter().collect())
        .unwrap_or_default()
}

fn decode_inline(inline: &Value) -> ClientResult<AudioClip> {
    let data = inline
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| ClientError::InvalidAudio("missing data".to_string()))?;
    let mime_type = inline
        .get("mimeType")
        .and_then(Value::as_str)
        .unwrap_or("audio/pcm;rate=24000")
        .to_string();

    if !mime_type.starts_with("audio/") {
        return Err(ClientError::InvalidAudio(format!("not audio: {}", mime_type)));
    }

    let data = BASE64_STANDARD
        .decode(data)
        .map_err(|e| ClientError::InvalidAudio(e.to_string()))?;
    Ok(AudioClip { mime_type, data })
}
