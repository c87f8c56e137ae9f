//! # Quest Voice
//!
//! Realtime voice relay between browser clients and Gemini Live, plus the
//! capture and client-side pieces that feed it.
//!
//! ## Modules:
//! - **audio**: microphone capture processor and PCM16 helpers
//! - **relay**: the WebSocket relay and its upstream provider
//! - **client**: voice call state machine and its WebSocket transport
//! - **config**, **state**, **error**: ambient server plumbing
//! - **health**, **handlers**, **middleware**, **routes**: the HTTP surface

pub mod audio;
pub mod client;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod relay;
pub mod routes;
pub mod state;
