//! # Voice Relay WebSocket Handler
//!
//! Bridges one browser WebSocket to one upstream Gemini Live session.
//! Clients connect to the relay path (default `/ws/gemini-voice`) and stream
//! microphone audio; the relay forwards it upstream and writes every upstream
//! event back to the client.
//!
//! ## Connection lifecycle:
//! 1. **Open**: no upstream session yet. If no credential is configured the
//!    client gets one `{type: "error", message: "Missing GEMINI_API_KEY"}`
//!    frame and the socket stays open.
//! 2. **First message**: starts exactly one upstream session. Messages that
//!    arrive during the handshake are queued in arrival order.
//! 3. **Active**: client messages are forwarded, upstream events relayed.
//! 4. **Close**: whichever side closes first takes the other down with it.
//!
//! ## Structure:
//! [`RelayCore`] holds the state machine and knows nothing about sockets.
//! [`VoiceRelaySocket`] is the actix actor that owns a `RelayCore` and does
//! the I/O. Actor messages are handled one at a time, so the core never sees
//! concurrent calls and session creation is single-flight without locks.

use crate::config::AppConfig;
use crate::error::{AppError, RelayError};
use crate::relay::messages::{ClientMessage, RelayNotice, UpstreamRequest, REALTIME_AUDIO_MIME};
use crate::relay::provider::{dispatch, LiveProvider, LiveSession, SessionSetup, UpstreamEvent};
use crate::relay::recent::SessionSummary;
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

/// Upstream session state for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// No upstream session; the next client message creates one
    Idle,
    /// Session creation in flight
    SessionPending,
    /// Upstream session open
    Active,
    /// Connection torn down; everything is ignored
    Closed,
}

/// What the actor should do with a client message.
pub enum Step {
    /// Drop it
    Ignore,
    /// Message queued; start the upstream session
    StartSession,
    /// Message queued behind a session still being created
    Queued,
    /// Send it to the open session
    Forward(Arc<dyn LiveSession>, UpstreamRequest),
}

/// Outcome of a finished session creation.
pub enum SessionOpened {
    /// Session is live; send the backlog in order
    Active {
        session: Arc<dyn LiveSession>,
        backlog: Vec<UpstreamRequest>,
    },
    /// The connection closed during the handshake; close this session
    Discarded(Arc<dyn LiveSession>),
}

/// A text frame for the client, plus whether the client socket should close
/// after it.
#[derive(Debug, Clone, PartialEq)]
pub struct Relayed {
    pub text: String,
    pub close_client: bool,
}

/// Transport-free relay state machine.
pub struct RelayCore {
    id: String,
    state: RelayState,
    provider_available: bool,
    audio_mime: String,
    session: Option<Arc<dyn LiveSession>>,
    pending: VecDeque<UpstreamRequest>,
    upstream_opened: bool,
    frames_forwarded: u64,
    events_relayed: u64,
    opened_at: DateTime<Utc>,
    close_reason: Option<String>,
}

impl RelayCore {
    pub fn new(id: impl Into<String>, provider_available: bool) -> Self {
        Self {
            id: id.into(),
            state: RelayState::Idle,
            provider_available,
            audio_mime: REALTIME_AUDIO_MIME.to_string(),
            session: None,
            pending: VecDeque::new(),
            upstream_opened: false,
            frames_forwarded: 0,
            events_relayed: 0,
            opened_at: Utc::now(),
            close_reason: None,
        }
    }

    /// MIME tag for binary audio frames forwarded upstream.
    pub fn with_audio_mime(mut self, mime_type: impl Into<String>) -> Self {
        self.audio_mime = mime_type.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Notice to send right after the socket opens.
    pub fn on_open(&self) -> Option<RelayNotice> {
        if self.provider_available {
            None
        } else {
            Some(RelayNotice::error(RelayError::MissingCredential.to_string()))
        }
    }

    pub fn on_client_message(&mut self, message: ClientMessage) -> Step {
        if !self.provider_available {
            return Step::Ignore;
        }

        let request = UpstreamRequest::from_client(message, &self.audio_mime);
        match self.state {
            RelayState::Closed => Step::Ignore,
            RelayState::Idle => {
                self.pending.push_back(request);
                self.state = RelayState::SessionPending;
                Step::StartSession
            }
            RelayState::SessionPending => {
                self.pending.push_back(request);
                Step::Queued
            }
            RelayState::Active => match &self.session {
                Some(session) => {
                    self.frames_forwarded += 1;
                    Step::Forward(session.clone(), request)
                }
                None => Step::Ignore,
            },
        }
    }

    /// Session creation succeeded.
    pub fn session_opened(&mut self, session: Arc<dyn LiveSession>) -> SessionOpened {
        if self.state != RelayState::SessionPending {
            return SessionOpened::Discarded(session);
        }

        self.state = RelayState::Active;
        self.upstream_opened = true;
        self.session = Some(session.clone());

        let backlog: Vec<_> = self.pending.drain(..).collect();
        self.frames_forwarded += backlog.len() as u64;
        SessionOpened::Active { session, backlog }
    }

    /// Session creation failed. Drops the queued messages and returns how
    /// many there were; the next client message retries.
    pub fn session_failed(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        if self.state == RelayState::SessionPending {
            self.state = RelayState::Idle;
        }
        dropped
    }

    /// Turn an upstream event into a client frame.
    pub fn relay_event(&mut self, event: UpstreamEvent) -> Relayed {
        self.events_relayed += 1;
        match event {
            UpstreamEvent::Open => Relayed {
                text: RelayNotice::status("Gemini session opened").to_json(),
                close_client: false,
            },
            UpstreamEvent::Message(value) => Relayed {
                text: value.to_string(),
                close_client: false,
            },
            UpstreamEvent::Error(message) => Relayed {
                text: RelayNotice::error(message).to_json(),
                close_client: false,
            },
            UpstreamEvent::Close { code, reason } => {
                // The upstream side is already gone, nothing left to close
                self.session = None;
                self.pending.clear();
                self.state = RelayState::Closed;
                if self.close_reason.is_none() {
                    self.close_reason = Some(format!("upstream closed: {}", reason));
                }
                Relayed {
                    text: RelayNotice::closed(code, reason).to_json(),
                    close_client: true,
                }
            }
        }
    }

    /// Tear the connection down. Returns the upstream session to close, at
    /// most once over the lifetime of the core.
    pub fn shutdown(&mut self, reason: &str) -> Option<Arc<dyn LiveSession>> {
        if self.state == RelayState::Closed {
            return None;
        }
        self.state = RelayState::Closed;
        self.pending.clear();
        if self.close_reason.is_none() {
            self.close_reason = Some(reason.to_string());
        }
        self.session.take()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            opened_at: self.opened_at,
            closed_at: Utc::now(),
            upstream_opened: self.upstream_opened,
            frames_forwarded: self.frames_forwarded,
            events_relayed: self.events_relayed,
            close_reason: self.close_reason.clone(),
        }
    }
}

/// WebSocket actor for one relay connection.
pub struct VoiceRelaySocket {
    core: RelayCore,
    app_state: AppState,
    provider: Option<Arc<dyn LiveProvider>>,
    setup: SessionSetup,
    last_heartbeat: Instant,
    heartbeat_interval: Duration,
    client_timeout: Duration,
}

impl VoiceRelaySocket {
    pub fn new(app_state: AppState, config: &AppConfig) -> Self {
        let provider = app_state.provider.clone();
        Self {
            core: RelayCore::new(uuid::Uuid::new_v4().to_string(), provider.is_some())
                .with_audio_mime(config.audio.input_mime_type.clone()),
            provider,
            setup: SessionSetup::from_config(&config.gemini),
            last_heartbeat: Instant::now(),
            heartbeat_interval: Duration::from_secs(config.relay.heartbeat_interval_secs),
            client_timeout: Duration::from_secs(config.relay.client_timeout_secs),
            app_state,
        }
    }

    fn route(&mut self, message: ClientMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match self.core.on_client_message(message) {
            Step::Ignore => {}
            Step::StartSession => self.open_session(ctx),
            Step::Queued => {
                debug!(
                    connection_id = %self.core.id(),
                    queued = self.core.pending_len(),
                    "Queued message while session opens"
                );
            }
            Step::Forward(session, request) => self.forward(session, vec![request], ctx),
        }
    }

    fn open_session(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(provider) = self.provider.clone() else {
            return;
        };
        let setup = self.setup.clone();
        info!(
            connection_id = %self.core.id(),
            provider = provider.name(),
            model = %setup.model,
            "Opening upstream session"
        );

        let connect = async move { provider.connect(&setup).await };

        ctx.spawn(connect.into_actor(self).map(|result, act, ctx| match result {
            Ok(connection) => {
                act.app_state.record_upstream_opened();
                match act.core.session_opened(connection.session) {
                    SessionOpened::Active { session, backlog } => {
                        ctx.add_stream(UnboundedReceiverStream::new(connection.events));
                        if !backlog.is_empty() {
                            act.forward(session, backlog, ctx);
                        }
                    }
                    SessionOpened::Discarded(session) => {
                        debug!(connection_id = %act.core.id(), "Connection closed during handshake");
                        close_upstream(act.core.id().to_string(), session);
                    }
                }
            }
            Err(err) => {
                act.app_state.record_upstream_failed();
                let dropped = act.core.session_failed();
                warn!(
                    connection_id = %act.core.id(),
                    dropped,
                    "Failed to open upstream session: {}", err
                );
                let notice = RelayNotice::error_with_detail("Failed to open Gemini session", err.detail());
                ctx.text(notice.to_json());
            }
        }));
    }

    /// Hand requests to the upstream session in order. Failures are logged
    /// and dropped.
    fn forward(
        &mut self,
        session: Arc<dyn LiveSession>,
        requests: Vec<UpstreamRequest>,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        self.app_state.add_frames_forwarded(requests.len() as u64);
        let connection_id = self.core.id().to_string();

        let send = async move {
            for request in requests {
                if let Err(err) = dispatch(&*session, request).await {
                    debug!(connection_id = %connection_id, "Forward failed: {}", err);
                }
            }
        };
        ctx.spawn(send.into_actor(self));
    }

    fn heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let timeout = self.client_timeout;
        ctx.run_interval(self.heartbeat_interval, move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > timeout {
                warn!(connection_id = %act.core.id(), "Relay heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }
}

fn close_upstream(connection_id: String, session: Arc<dyn LiveSession>) {
    actix::spawn(async move {
        if let Err(err) = session.close().await {
            debug!(connection_id = %connection_id, "Upstream close failed: {}", err);
        }
    });
}

impl Actor for VoiceRelaySocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(connection_id = %self.core.id(), "Relay connection opened");
        self.heartbeat(ctx);

        if let Some(notice) = self.core.on_open() {
            warn!(connection_id = %self.core.id(), "No Gemini credential configured");
            ctx.text(notice.to_json());
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(session) = self.core.shutdown("client disconnected") {
            close_upstream(self.core.id().to_string(), session);
        }

        let summary = self.core.summary();
        info!(
            connection_id = %summary.id,
            frames_forwarded = summary.frames_forwarded,
            events_relayed = summary.events_relayed,
            "Relay connection closed"
        );
        self.app_state.recent_sessions.record(summary);
        self.app_state.decrement_active_sessions();
    }
}

/// Client frames.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceRelaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                match ClientMessage::from_text(&text) {
                    Some(message) => self.route(message, ctx),
                    None => debug!(connection_id = %self.core.id(), "Dropped unrecognized text frame"),
                }
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.route(ClientMessage::from_binary(&data), ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(connection_id = %self.core.id(), "Client closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(connection_id = %self.core.id(), "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(connection_id = %self.core.id(), "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Upstream events.
impl StreamHandler<UpstreamEvent> for VoiceRelaySocket {
    fn handle(&mut self, event: UpstreamEvent, ctx: &mut Self::Context) {
        let relayed = self.core.relay_event(event);
        self.app_state.add_events_relayed(1);
        ctx.text(relayed.text);

        if relayed.close_client {
            ctx.close(Some(ws::CloseReason {
                code: ws::CloseCode::Normal,
                description: Some("Gemini session closed".to_string()),
            }));
            ctx.stop();
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        debug!(connection_id = %self.core.id(), "Upstream event stream ended");
        ctx.stop();
    }
}

/// WebSocket endpoint handler.
///
/// Answers 503 when the relay is switched off or every connection slot is
/// taken; otherwise upgrades and hands the socket to a [`VoiceRelaySocket`].
pub async fn gemini_voice(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let config = app_state.get_config();

    if !config.relay.enabled {
        return Err(AppError::ServiceUnavailable("Voice relay is disabled".to_string()).into());
    }

    if !app_state.try_acquire_session(config.relay.max_connections) {
        warn!("Relay at capacity ({} connections)", config.relay.max_connections);
        return Err(AppError::ServiceUnavailable("Voice relay is at capacity".to_string()).into());
    }

    debug!("Relay upgrade from {:?}", req.connection_info().peer_addr());

    let socket = VoiceRelaySocket::new(app_state.get_ref().clone(), &config);
    let response = ws::start(socket, &req, stream);
    if response.is_err() {
        // Handshake rejected before the actor started
        app_state.decrement_active_sessions();
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::messages::MediaChunk;
    use crate::relay::provider::testing::{Recorded, RecordingProvider, RecordingSession};
    use serde_json::{json, Value};

    async fn open_session(provider: &RecordingProvider) -> Arc<RecordingSession> {
        let setup = SessionSetup::from_config(&AppConfig::default().gemini);
        provider.connect(&setup).await.unwrap();
        provider.session(provider.connect_count() - 1).unwrap()
    }

    fn audio(bytes: &[u8]) -> ClientMessage {
        ClientMessage::from_binary(bytes)
    }

    #[test]
    fn test_missing_credential_notice_and_drops() {
        let mut core = RelayCore::new("c1", false);
        let notice = core.on_open().unwrap();
        assert_eq!(notice.to_json(), r#"{"type":"error","message":"Missing GEMINI_API_KEY"}"#);

        assert!(matches!(core.on_client_message(audio(&[1, 2])), Step::Ignore));
        assert_eq!(core.state(), RelayState::Idle);
    }

    #[test]
    fn test_no_notice_with_credential() {
        assert!(RelayCore::new("c1", true).on_open().is_none());
    }

    #[tokio::test]
    async fn test_binary_audio_tagged_with_configured_mime() {
        let provider = RecordingProvider::new();
        let mut core = RelayCore::new("c1", true).with_audio_mime("audio/pcm;rate=24000");
        assert!(matches!(core.on_client_message(audio(&[1, 0])), Step::StartSession));

        let session = open_session(&provider).await;
        let SessionOpened::Active { backlog, .. } = core.session_opened(session) else {
            panic!("session should become active");
        };
        let UpstreamRequest::RealtimeInput(chunk) = &backlog[0] else {
            panic!("binary audio must be realtime input");
        };
        assert_eq!(chunk.mime_type, "audio/pcm;rate=24000");
    }

    #[tokio::test]
    async fn test_single_flight_and_ordered_backlog() {
        let provider = RecordingProvider::new();
        let mut core = RelayCore::new("c1", true);

        assert!(matches!(core.on_client_message(audio(&[1, 0])), Step::StartSession));
        assert!(matches!(core.on_client_message(audio(&[2, 0])), Step::Queued));
        let text = ClientMessage::from_text(r#"{"text":"hi"}"#).unwrap();
        assert!(matches!(core.on_client_message(text), Step::Queued));
        assert_eq!(core.state(), RelayState::SessionPending);

        let session = open_session(&provider).await;
        let SessionOpened::Active { session: live, backlog } = core.session_opened(session.clone()) else {
            panic!("session should become active");
        };
        assert_eq!(backlog.len(), 3);
        assert!(matches!(backlog[0], UpstreamRequest::RealtimeInput(_)));
        assert!(matches!(backlog[2], UpstreamRequest::Send(_)));

        for request in backlog {
            dispatch(&*live, request).await.unwrap();
        }
        let recorded = session.recorded();
        assert_eq!(recorded.len(), 3);
        assert_eq!(
            recorded[0],
            Recorded::Realtime(MediaChunk {
                data: "AQA=".to_string(),
                mime_type: "audio/pcm;rate=16000".to_string(),
            })
        );

        assert!(matches!(core.on_client_message(audio(&[3, 0])), Step::Forward(_, _)));
        assert_eq!(provider.connect_count(), 1);
        assert_eq!(core.summary().frames_forwarded, 4);
    }

    #[test]
    fn test_failure_returns_to_idle_and_retries() {
        let mut core = RelayCore::new("c1", true);
        assert!(matches!(core.on_client_message(audio(&[1, 0])), Step::StartSession));
        core.on_client_message(audio(&[2, 0]));

        assert_eq!(core.session_failed(), 2);
        assert_eq!(core.state(), RelayState::Idle);
        assert_eq!(core.pending_len(), 0);

        assert!(matches!(core.on_client_message(audio(&[3, 0])), Step::StartSession));
    }

    #[tokio::test]
    async fn test_session_discarded_after_close() {
        let provider = RecordingProvider::new();
        let mut core = RelayCore::new("c1", true);
        core.on_client_message(audio(&[1, 0]));
        assert!(core.shutdown("client disconnected").is_none());

        let session = open_session(&provider).await;
        assert!(matches!(core.session_opened(session), SessionOpened::Discarded(_)));
        assert_eq!(core.state(), RelayState::Closed);
    }

    #[tokio::test]
    async fn test_shutdown_closes_once() {
        let provider = RecordingProvider::new();
        let mut core = RelayCore::new("c1", true);
        core.on_client_message(audio(&[1, 0]));
        let session = open_session(&provider).await;
        core.session_opened(session.clone());

        let to_close = core.shutdown("client disconnected").unwrap();
        to_close.close().await.unwrap();
        assert!(core.shutdown("again").is_none());
        assert_eq!(session.close_count(), 1);

        assert!(matches!(core.on_client_message(audio(&[1, 0])), Step::Ignore));
        assert_eq!(core.summary().close_reason.as_deref(), Some("client disconnected"));
    }

    #[test]
    fn test_malformed_json_never_reaches_core() {
        assert!(ClientMessage::from_text("{oops").is_none());
    }

    #[test]
    fn test_event_relaying() {
        let mut core = RelayCore::new("c1", true);

        let opened = core.relay_event(UpstreamEvent::Open);
        let value: Value = serde_json::from_str(&opened.text).unwrap();
        assert_eq!(value, json!({"type": "status", "message": "Gemini session opened"}));
        assert!(!opened.close_client);

        let message = json!({"serverContent": {"turnComplete": true}});
        let relayed = core.relay_event(UpstreamEvent::Message(message.clone()));
        assert_eq!(serde_json::from_str::<Value>(&relayed.text).unwrap(), message);

        let err = core.relay_event(UpstreamEvent::Error("boom".to_string()));
        assert_eq!(err.text, r#"{"type":"error","message":"boom"}"#);

        let closed = core.relay_event(UpstreamEvent::Close {
            code: Some(1011),
            reason: "internal".to_string(),
        });
        assert!(closed.close_client);
        let value: Value = serde_json::from_str(&closed.text).unwrap();
        assert_eq!(value["message"], "Gemini session closed");
        assert_eq!(value["code"], 1011);
        assert_eq!(core.state(), RelayState::Closed);
        assert!(core.shutdown("client disconnected").is_none());
        assert_eq!(core.summary().events_relayed, 4);
    }

    #[tokio::test]
    async fn test_passthrough_forwarded_verbatim() {
        let provider = RecordingProvider::new();
        let mut core = RelayCore::new("c1", true);
        core.on_client_message(audio(&[1, 0]));
        let session = open_session(&provider).await;
        core.session_opened(session.clone());

        let msg = ClientMessage::from_text(r#"{"generationConfig":{}}"#).unwrap();
        let Step::Forward(live, request) = core.on_client_message(msg) else {
            panic!("active session should forward");
        };
        dispatch(&*live, request).await.unwrap();
        assert_eq!(
            session.recorded().last(),
            Some(&Recorded::Send(json!({"generationConfig": {}})))
        );
    }
}
