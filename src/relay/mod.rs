//! # Gemini Voice Relay
//!
//! WebSocket bridge between browser voice clients and a streaming speech
//! model. One client connection owns at most one upstream session.
//!
//! ## Components:
//! - **messages**: client and server frame vocabularies
//! - **provider**: the `LiveProvider` / `LiveSession` seam
//! - **gemini**: Gemini Live implementation of that seam
//! - **connection**: per-connection state machine and WebSocket actor
//! - **recent**: bounded record of finished connections

pub mod connection;
pub mod gemini;
pub mod messages;
pub mod provider;
pub mod recent;

pub use connection::{gemini_voice, RelayCore, RelayState, VoiceRelaySocket};
pub use gemini::GeminiLiveProvider;
pub use messages::{ClientMessage, RelayNotice};
pub use provider::{LiveProvider, LiveSession, SessionSetup, UpstreamEvent};
pub use recent::{RecentSessions, SessionSummary};
