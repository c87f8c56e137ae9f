//! # Gemini Live Provider
//!
//! [`LiveProvider`] implementation for Google's Gemini Live API.
//!
//! ## API Reference:
//! - Endpoint: `wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent?key=<KEY>`
//! - Protocol: WebSocket carrying JSON (the server sends its JSON in binary frames)
//! - First client frame: `{"setup": {...}}`
//! - Audio in: `{"realtimeInput": {"mediaChunks": [{"mimeType": "audio/pcm;rate=16000", "data": "<base64>"}]}}`
//!
//! ## Task layout:
//! Each session owns one spawned task holding both halves of the socket.
//! Outgoing frames reach it through an unbounded command channel; incoming
//! frames are parsed and pushed onto the session's event channel. The task
//! ends when either side closes, and always emits a final `Close` event.

use crate::config::GeminiConfig;
use crate::error::{RelayError, RelayResult};
use crate::relay::messages::MediaChunk;
use crate::relay::provider::{LiveConnection, LiveProvider, LiveSession, SessionSetup, UpstreamEvent};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Gemini Live provider. Holds only the credential and endpoint; per-session
/// choices (model, voice, instruction) arrive with each `connect`.
pub struct GeminiLiveProvider {
    api_key: String,
    endpoint: String,
}

impl GeminiLiveProvider {
    /// Build the provider from configuration.
    ///
    /// ## Errors:
    /// [`RelayError::MissingCredential`] when no non-empty API key is set.
    pub fn from_config(config: &GeminiConfig) -> RelayResult<Self> {
        let api_key = config
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or(RelayError::MissingCredential)?;

        Ok(Self {
            api_key: api_key.to_string(),
            endpoint: config.endpoint.clone(),
        })
    }

    fn build_url(&self) -> String {
        format!("{}?key={}", self.endpoint, self.api_key)
    }
}

/// Build the `setup` frame sent right after the handshake.
pub fn setup_message(setup: &SessionSetup) -> Value {
    let model = if setup.model.starts_with("models/") {
        setup.model.clone()
    } else {
        format!("models/{}", setup.model)
    };

    let mut generation_config = json!({ "responseModalities": ["AUDIO"] });
    if let Some(voice) = &setup.voice {
        generation_config["speechConfig"] = json!({
            "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": voice } }
        });
    }

    let mut body = json!({
        "model": model,
        "generationConfig": generation_config,
    });
    if let Some(instruction) = &setup.system_instruction {
        body["systemInstruction"] = json!({ "parts": [{ "text": instruction }] });
    }

    json!({ "setup": body })
}

/// Wrap one media chunk in a `realtimeInput` frame.
pub fn realtime_input_message(chunk: &MediaChunk) -> Value {
    json!({ "realtimeInput": { "mediaChunks": [chunk] } })
}

/// Parse a server frame payload into an event.
fn parse_server_payload(payload: &[u8]) -> UpstreamEvent {
    match serde_json::from_slice::<Value>(payload) {
        Ok(value) => UpstreamEvent::Message(value),
        Err(e) => UpstreamEvent::Error(format!("Unparseable upstream frame: {}", e)),
    }
}

#[async_trait]
impl LiveProvider for GeminiLiveProvider {
    fn name(&self) -> &'static str {
        "gemini-live"
    }

    async fn connect(&self, setup: &SessionSetup) -> RelayResult<LiveConnection> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(self.build_url())
            .await
            .map_err(|e| RelayError::SessionCreate(e.to_string()))?;

        let (mut ws_sink, mut ws_stream) = ws_stream.split();

        let setup_json = setup_message(setup).to_string();
        ws_sink
            .send(Message::Text(setup_json))
            .await
            .map_err(|e| RelayError::SessionCreate(e.to_string()))?;

        info!(model = %setup.model, "Gemini Live session opened");

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, mut command_rx) = mpsc::unbounded_channel::<SessionCommand>();

        // Receiver may already be gone if the client left during the handshake
        let _ = event_tx.send(UpstreamEvent::Open);

        tokio::spawn(async move {
            let close_event = loop {
                tokio::select! {
                    command = command_rx.recv() => {
                        match command {
                            Some(SessionCommand::Frame(text)) => {
                                if let Err(e) = ws_sink.send(Message::Text(text)).await {
                                    error!("Failed to send to Gemini: {}", e);
                                    let _ = event_tx.send(UpstreamEvent::Error(e.to_string()));
                                    break UpstreamEvent::Close { code: None, reason: e.to_string() };
                                }
                            }
                            Some(SessionCommand::Close) | None => {
                                if let Err(e) = ws_sink.send(Message::Close(None)).await {
                                    debug!("Gemini close frame not delivered: {}", e);
                                }
                                break UpstreamEvent::Close {
                                    code: Some(1000),
                                    reason: "closed by relay".to_string(),
                                };
                            }
                        }
                    }

                    frame = ws_stream.next() => {
                        match frame {
                            Some(Ok(Message::Text(text))) => {
                                let _ = event_tx.send(parse_server_payload(text.as_bytes()));
                            }
                            Some(Ok(Message::Binary(data))) => {
                                let _ = event_tx.send(parse_server_payload(&data));
                            }
                            Some(Ok(Message::Ping(data))) => {
                                if let Err(e) = ws_sink.send(Message::Pong(data)).await {
                                    debug!("Failed to answer Gemini ping: {}", e);
                                }
                            }
                            Some(Ok(Message::Close(frame))) => {
                                let (code, reason) = frame
                                    .map(|f| (Some(u16::from(f.code)), f.reason.to_string()))
                                    .unwrap_or((None, String::new()));
                                info!(?code, reason = %reason, "Gemini closed the session");
                                break UpstreamEvent::Close { code, reason };
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!("Gemini WebSocket error: {}", e);
                                let _ = event_tx.send(UpstreamEvent::Error(e.to_string()));
                                break UpstreamEvent::Close { code: None, reason: e.to_string() };
                            }
                            None => {
                                break UpstreamEvent::Close {
                                    code: None,
                                    reason: "stream ended".to_string(),
                                };
                            }
                        }
                    }
                }
            };

            let _ = event_tx.send(close_event);
        });

        Ok(LiveConnection {
            session: Arc::new(GeminiLiveSession {
                commands: command_tx,
                closed: AtomicBool::new(false),
            }),
            events: event_rx,
        })
    }
}

enum SessionCommand {
    Frame(String),
    Close,
}

/// Handle to one Gemini Live session. Sends never wait on the network: they
/// queue onto the session task's command channel.
pub struct GeminiLiveSession {
    commands: mpsc::UnboundedSender<SessionCommand>,
    closed: AtomicBool,
}

impl GeminiLiveSession {
    fn push(&self, message: Value) -> RelayResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RelayError::Closed);
        }
        self.commands
            .send(SessionCommand::Frame(message.to_string()))
            .map_err(|_| RelayError::Send("Gemini session task has exited".to_string()))
    }
}

#[async_trait]
impl LiveSession for GeminiLiveSession {
    async fn send_realtime_input(&self, chunk: MediaChunk) -> RelayResult<()> {
        self.push(realtime_input_message(&chunk))
    }

    async fn send(&self, message: Value) -> RelayResult<()> {
        self.push(message)
    }

    async fn close(&self) -> RelayResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // The task may have ended on its own already
        let _ = self.commands.send(SessionCommand::Close);
        Ok(())
    }
}
