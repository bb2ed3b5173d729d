//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - **VoiceError**: everything the audio pipeline can fail with (devices,
//!   codec, transport, session lifecycle). Built with `thiserror` so each
//!   variant carries its own message and callers can match on the kind.
//! - **AppError**: what the HTTP layer returns. It knows how to turn itself
//!   into a JSON error response, and every `VoiceError` converts into it.
//!
//! ## Error kinds the pipeline distinguishes:
//! - **DeviceUnavailable**: microphone/speaker missing or permission denied
//! - **MalformedAudioData**: downlink payload with a bad byte length (dropped, not fatal)
//! - **BackpressureExceeded**: capture frames piling up (warning, not fatal)
//! - **SessionStartFailed**: `start()` could not acquire the mic or open the connection

use actix_web::{HttpResponse, ResponseError};  // Web framework error handling
use serde_json::json;                          // For creating JSON error responses
use std::fmt;                                  // For implementing Display trait
use thiserror::Error;

/// Errors produced by the voice pipeline.
///
/// ## Rust Concepts:
/// - **#[derive(Error)]**: `thiserror` generates `Display` and `std::error::Error`
/// - **#[error("...")]**: The message template, fields are interpolated by name
/// - **#[source]**: Marks the wrapped cause so error chains can be walked
#[derive(Debug, Error)]
pub enum VoiceError {
    /// Microphone or speaker could not be acquired
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Byte length is not a whole number of 16-bit sample frames
    #[error("malformed audio data: {len} bytes is not a multiple of {frame_bytes}")]
    MalformedAudioData { len: usize, frame_bytes: usize },

    /// Capture frames are queuing faster than they are forwarded
    #[error("capture backlog of {backlog} frames exceeds the limit of {limit}")]
    BackpressureExceeded { backlog: usize, limit: usize },

    /// `start()` failed; the cause is kept for the caller
    #[error("voice session failed to start: {0}")]
    SessionStartFailed(#[source] Box<VoiceError>),

    /// A session is already running (or still shutting down)
    #[error("a voice session is already active")]
    SessionActive,

    /// The operation was abandoned because the session was stopped
    #[error("session was stopped before the operation completed")]
    Cancelled,

    /// The live connection is gone
    #[error("live connection closed")]
    ConnectionClosed,

    /// Network-level failure talking to the remote service
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote service sent something we could not understand
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Packet payload was not valid base64
    #[error("invalid audio payload: {0}")]
    InvalidPayload(String),

    /// Downlink audio at a rate the output device is not running at
    #[error("unsupported sample rate {got} Hz (output runs at {expected} Hz)")]
    UnsupportedSampleRate { got: u32, expected: u32 },
}

impl VoiceError {
    /// Wrap any error as the cause of a failed `start()`.
    pub fn start_failed(cause: VoiceError) -> Self {
        match cause {
            // Already wrapped, don't nest twice
            VoiceError::SessionStartFailed(_) => cause,
            other => VoiceError::SessionStartFailed(Box::new(other)),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for VoiceError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        VoiceError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for VoiceError {
    fn from(err: serde_json::Error) -> Self {
        VoiceError::Protocol(err.to_string())
    }
}

impl From<base64::DecodeError> for VoiceError {
    fn from(err: base64::DecodeError) -> Self {
        VoiceError::InvalidPayload(err.to_string())
    }
}

#[cfg(feature = "native-audio")]
impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

#[cfg(feature = "native-audio")]
impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

#[cfg(feature = "native-audio")]
impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

#[cfg(feature = "native-audio")]
impl From<cpal::SupportedStreamConfigsError> for VoiceError {
    fn from(err: cpal::SupportedStreamConfigsError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

/// Type alias for pipeline results.
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Custom error types for the HTTP layer.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **Conflict**: Request clashes with current state, e.g. session already running (409 errors)
/// - **ServiceUnavailable**: Device or remote service could not be reached (503 errors)
/// - **ValidationError**: Data validation failed (400 errors)
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(AppError::BadRequest("Invalid JSON".to_string()));
/// ```
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// The request conflicts with the current session state
    Conflict(String),

    /// A device or the remote service is not reachable right now
    ServiceUnavailable(String),

    /// User input failed validation rules
    ValidationError(String),
}

/// Implementation of the Display trait for AppError.
///
/// ## Purpose:
/// This trait defines how errors are formatted as human-readable strings.
/// It's used when you print an error or convert it to a string.
impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

/// Implementation of the ResponseError trait for AppError.
///
/// ## HTTP Status Code Mapping:
/// - Internal → 500 (Internal Server Error)
/// - BadRequest/ValidationError → 400 (Bad Request)
/// - Conflict → 409 (Conflict)
/// - ServiceUnavailable → 503 (Service Unavailable)
///
/// ## JSON Response Format:
/// All errors return JSON with a consistent structure:
/// ```json
/// {
///   "error": {
///     "type": "conflict",
///     "message": "a voice session is already active",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        self.parts().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.parts();

        // Build the HTTP response with JSON body
        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,           // Machine-readable error type
                "message": message,           // Human-readable error message
                "timestamp": chrono::Utc::now().to_rfc3339()  // When the error occurred
            }
        }))
    }
}

impl AppError {
    /// Map each error type to HTTP status code, error type, and message
    fn parts(&self) -> (actix_web::http::StatusCode, &'static str, String) {
        use actix_web::http::StatusCode;

        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.clone()),
            AppError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg.clone()),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg.clone()),
        }
    }
}

/// Automatic conversion from JSON parsing errors to AppError.
///
/// ## Why BadRequest:
/// JSON parsing errors are almost always due to the client sending malformed data,
/// so they should result in a 400 (Bad Request) response, not a 500 (Internal Server Error).
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

/// Pipeline errors surfaced through an HTTP handler.
///
/// ## Mapping:
/// - SessionActive → 409 (the UI should stop first)
/// - SessionStartFailed/DeviceUnavailable/Transport → 503 (try again later)
/// - Codec errors → 400 (the caller handed us bad audio)
impl From<VoiceError> for AppError {
    fn from(err: VoiceError) -> Self {
        match err {
            VoiceError::SessionActive => AppError::Conflict(err.to_string()),
            VoiceError::SessionStartFailed(_)
            | VoiceError::DeviceUnavailable(_)
            | VoiceError::Transport(_)
            | VoiceError::ConnectionClosed => AppError::ServiceUnavailable(err.to_string()),
            VoiceError::MalformedAudioData { .. }
            | VoiceError::InvalidPayload(_)
            | VoiceError::UnsupportedSampleRate { .. } => AppError::BadRequest(err.to_string()),
            _ => AppError::Internal(err.to_string()),
        }
    }
}
