//! # Error Handling
//!
//! Two error families live here:
//!
//! - [`AppError`]: failures of the HTTP surface. Implements actix's
//!   `ResponseError` so handlers can return [`AppResult<HttpResponse>`](AppResult)
//!   and have the error rendered as a consistent JSON body.
//! - [`RelayError`]: failures inside the voice relay (credential missing,
//!   upstream session creation, forwarding). These never become HTTP
//!   responses; the relay turns the few that are user-visible into
//!   `{type: "error"}` frames and logs the rest.
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "validation_error",
//!     "message": "Relay path must start with '/'",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors returned by HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),

    /// A feature is switched off or at capacity (e.g. the voice relay)
    ServiceUnavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;

        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::Internal(msg) => ("internal_error", msg),
            AppError::BadRequest(msg) => ("bad_request", msg),
            AppError::ConfigError(msg) => ("config_error", msg),
            AppError::ValidationError(msg) => ("validation_error", msg),
            AppError::ServiceUnavailable(msg) => ("service_unavailable", msg),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// `anyhow` errors surface as internal errors, except validation failures
/// raised by [`crate::config::AppConfig::validate`], which callers map explicitly.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;

/// Errors raised inside the voice relay.
///
/// ## Categories:
/// - **MissingCredential**: no Gemini key configured; reported once per connection
/// - **SessionCreate**: the upstream provider was unreachable or rejected the setup
/// - **Send**: a frame could not be handed to the upstream session
/// - **Closed**: the upstream session was already torn down
#[derive(Debug, Clone, PartialEq)]
pub enum RelayError {
    MissingCredential,
    SessionCreate(String),
    Send(String),
    Closed,
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::MissingCredential => {
                write!(f, "Missing {}", crate::config::API_KEY_ENV)
            }
            RelayError::SessionCreate(msg) => write!(f, "Failed to open Gemini session: {}", msg),
            RelayError::Send(msg) => write!(f, "Failed to forward message: {}", msg),
            RelayError::Closed => write!(f, "Upstream session is closed"),
        }
    }
}

impl RelayError {
    /// The underlying cause, without the category prefix `Display` adds.
    pub fn detail(&self) -> String {
        match self {
            RelayError::SessionCreate(msg) | RelayError::Send(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

impl std::error::Error for RelayError {}

/// Shorthand for relay results.
pub type RelayResult<T> = Result<T, RelayError>;
