//! # Upstream Provider Abstraction
//!
//! The relay talks to its streaming model through two traits:
//!
//! - [`LiveProvider`]: opens sessions. One instance is built at startup and
//!   shared by every connection.
//! - [`LiveSession`]: one open upstream stream. Owned by exactly one relay
//!   connection; never pooled or shared across connections.
//!
//! Upstream events do not come back through callbacks. Each session hands the
//! relay an unbounded receiver of [`UpstreamEvent`]s, which the relay attaches
//! to its actor as a stream.

use crate::config::GeminiConfig;
use crate::error::RelayResult;
use crate::relay::messages::{MediaChunk, UpstreamRequest};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Per-session setup derived from the current configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSetup {
    pub model: String,
    pub voice: Option<String>,
    pub system_instruction: Option<String>,
}

impl SessionSetup {
    pub fn from_config(config: &GeminiConfig) -> Self {
        Self {
            model: config.model.clone(),
            voice: config.voice.clone(),
            system_instruction: config.system_instruction.clone(),
        }
    }
}

/// Something the upstream session reported.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// The session finished its handshake
    Open,
    /// A server message, forwarded to the client verbatim
    Message(Value),
    /// Transport or protocol failure
    Error(String),
    /// The upstream side closed; always the last event
    Close { code: Option<u16>, reason: String },
}

pub type UpstreamEvents = mpsc::UnboundedReceiver<UpstreamEvent>;

/// A freshly opened session plus its event stream.
pub struct LiveConnection {
    pub session: Arc<dyn LiveSession>,
    pub events: UpstreamEvents,
}

/// Factory for upstream sessions.
#[async_trait]
pub trait LiveProvider: Send + Sync {
    /// Short name for logs and health output.
    fn name(&self) -> &'static str;

    /// Open a new session. Suspends for the network handshake.
    async fn connect(&self, setup: &SessionSetup) -> RelayResult<LiveConnection>;
}

/// One open upstream session.
#[async_trait]
pub trait LiveSession: Send + Sync {
    /// Realtime media input (microphone audio).
    async fn send_realtime_input(&self, chunk: MediaChunk) -> RelayResult<()>;

    /// Generic send for control and content messages.
    async fn send(&self, message: Value) -> RelayResult<()>;

    /// Close the session. Calling it more than once is a no-op.
    async fn close(&self) -> RelayResult<()>;
}

/// Route a request to the matching session method.
pub async fn dispatch(session: &dyn LiveSession, request: UpstreamRequest) -> RelayResult<()> {
    match request {
        UpstreamRequest::RealtimeInput(chunk) => session.send_realtime_input(chunk).await,
        UpstreamRequest::Send(message) => session.send(message).await,
    }
}

/// In-memory provider for unit tests.
///
/// Records every session it opens and every request those sessions receive.
/// Generic sends are echoed back as `{"echo": <message>}` events so tests can
/// observe the downstream path.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::error::RelayError;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Recorded {
        Realtime(MediaChunk),
        Send(Value),
    }

    #[derive(Default)]
    pub struct RecordingProvider {
        pub connects: AtomicUsize,
        pub fail_next: AtomicBool,
        pub sessions: Mutex<Vec<Arc<RecordingSession>>>,
    }

    impl RecordingProvider {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn connect_count(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        pub fn session(&self, index: usize) -> Option<Arc<RecordingSession>> {
            self.sessions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(index)
                .cloned()
        }
    }

    #[async_trait]
    impl LiveProvider for RecordingProvider {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn connect(&self, _setup: &SessionSetup) -> RelayResult<LiveConnection> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(RelayError::SessionCreate("upstream refused".to_string()));
            }

            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(UpstreamEvent::Open);
            let session = Arc::new(RecordingSession {
                events: tx,
                requests: Mutex::new(Vec::new()),
                closes: AtomicUsize::new(0),
            });
            self.sessions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(session.clone());

            Ok(LiveConnection {
                session,
                events: rx,
            })
        }
    }

    pub struct RecordingSession {
        pub events: mpsc::UnboundedSender<UpstreamEvent>,
        pub requests: Mutex<Vec<Recorded>>,
        pub closes: AtomicUsize,
    }

    impl RecordingSession {
        pub fn recorded(&self) -> Vec<Recorded> {
            self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }

        pub fn close_count(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LiveSession for RecordingSession {
        async fn send_realtime_input(&self, chunk: MediaChunk) -> RelayResult<()> {
            self.requests
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(Recorded::Realtime(chunk));
            Ok(())
        }

        async fn send(&self, message: Value) -> RelayResult<()> {
            self.requests
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(Recorded::Send(message.clone()));
            let _ = self.events.send(UpstreamEvent::Message(json!({ "echo": message })));
            Ok(())
        }

        async fn close(&self) -> RelayResult<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
