//! # Error Handling
//!
//! Two families of errors live here:
//!
//! - **`AppError`**: failures of plain HTTP handlers, converted to JSON
//!   responses through actix's `ResponseError` trait.
//! - **Session errors** (`SessionError`, `TransportError`, `PipelineError`):
//!   everything that can end a streaming session. None of these ever reach an
//!   HTTP caller; the session coordinator handles all of them locally and the
//!   client only ever sees "the session ended".
//!
//! ## Session error taxonomy:
//! - A clean close and a [`TransportError`] are not errors of the session
//!   itself: they arrive as `Inbound::Disconnected` / `Inbound::Failed` from
//!   the frame source and end ingress. Both drain the session; only the
//!   second is logged at warning level.
//! - [`SessionError::Pipeline`]: the engine rejected or failed on the audio
//!   it was given.
//! - [`SessionError::Cancelled`]: raised on purpose by the coordinator while
//!   tearing a session down. Always discarded where it is triggered.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors returned by HTTP handlers.
///
/// Handshake failures are reported by `actix-web-actors` itself; the only
/// refusal the gateway decides on is admission.
#[derive(Debug)]
pub enum AppError {
    /// The server is at capacity and refuses new sessions
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

/// All errors render as:
/// ```json
/// {
///   "error": {
///     "type": "unavailable",
///     "message": "Maximum concurrent sessions (16) reached",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        match self {
            AppError::Unavailable(_) => actix_web::http::StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::Unavailable(msg) => ("unavailable", msg),
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

/// Failure of the connection itself (anything other than a clean close).
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    /// The outbound side is gone; nothing more can be written.
    Closed,
    /// The peer violated the WebSocket protocol.
    Protocol(String),
    /// The peer stopped answering pings.
    HeartbeatTimeout,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Closed => write!(f, "connection closed"),
            TransportError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            TransportError::HeartbeatTimeout => write!(f, "client heartbeat timed out"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Why the engine refused a piece of audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    /// Recognizable container, but a format the engine cannot process.
    UnsupportedAudio,
    /// The bytes are not valid audio.
    MalformedAudio,
    /// The model failed while transcribing.
    Inference,
}

/// The engine rejected or failed on provided audio.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineError {
    pub kind: PipelineErrorKind,
    pub message: String,
}

impl PipelineError {
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self { kind: PipelineErrorKind::UnsupportedAudio, message: message.into() }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self { kind: PipelineErrorKind::MalformedAudio, message: message.into() }
    }

    pub fn inference(message: impl Into<String>) -> Self {
        Self { kind: PipelineErrorKind::Inference, message: message.into() }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            PipelineErrorKind::UnsupportedAudio => "unsupported audio",
            PipelineErrorKind::MalformedAudio => "malformed audio",
            PipelineErrorKind::Inference => "inference failed",
        };
        write!(f, "{}: {}", kind, self.message)
    }
}

impl std::error::Error for PipelineError {}

/// Failure of a processor operation.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    Pipeline(PipelineError),
    Cancelled,
}

impl SessionError {
    /// Cancellation is requested by the coordinator itself and is never a fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SessionError::Cancelled)
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Pipeline(err) => write!(f, "pipeline fault: {}", err),
            SessionError::Cancelled => write!(f, "session cancelled"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Pipeline(err) => Some(err),
            SessionError::Cancelled => None,
        }
    }
}

impl From<PipelineError> for SessionError {
    fn from(err: PipelineError) -> Self {
        SessionError::Pipeline(err)
    }
}
