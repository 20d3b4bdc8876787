//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - **LiveError**: failures of the live voice session and its collaborators
//!   (microphone, duplex transport, playback device, audio payloads).
//! - **AppError**: what HTTP handlers return; converted to JSON error responses.
//!
//! ## Propagation Policy:
//! - **Per-frame failures** (`Send`, `Decode`, stopping a finished playback unit) are
//!   logged and swallowed by the component that hits them. A dropped frame never
//!   terminates a session.
//! - **Session-level failures** (`DeviceUnavailable`, `Transport`, `Authorization`)
//!   move the session into its `Error` state and are exposed to observers.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Failures raised by the live voice core.
///
/// ## Taxonomy:
/// - **DeviceUnavailable**: microphone or speaker could not be acquired (fatal to `start`)
/// - **Transport**: generic network/protocol failure (fatal to the session, no auto-retry)
/// - **Authorization**: the credentials lack entitlement; the caller should reselect
///   credentials instead of retrying
/// - **Decode**: one malformed audio payload (dropped, session continues)
/// - **Send**: one outbound frame could not be submitted (dropped, session continues)
/// - **Playback**: the output device refused to schedule or stop a buffer
/// - **InvalidTransition**: an operation was requested in a state that forbids it
#[derive(Debug, Clone, PartialEq)]
pub enum LiveError {
    DeviceUnavailable(String),
    Transport(String),
    Authorization(String),
    Decode(String),
    Send(String),
    Playback(String),
    InvalidTransition {
        action: &'static str,
        state: &'static str,
    },
}

/// Marker the remote service uses when the selected credentials cannot reach the model.
const ENTITY_NOT_FOUND: &str = "requested entity was not found";

impl LiveError {
    /// Classify a transport-reported cause.
    ///
    /// "Requested entity was not found" means an entitlement problem with the
    /// selected API key, so it is surfaced as `Authorization` rather than a
    /// generic transport failure.
    pub fn from_transport_cause(cause: impl Into<String>) -> Self {
        let cause = cause.into();
        if cause.to_lowercase().contains(ENTITY_NOT_FOUND) {
            LiveError::Authorization(cause)
        } else {
            LiveError::Transport(cause)
        }
    }

    /// Stable machine-readable name of the error category.
    pub fn kind(&self) -> &'static str {
        match self {
            LiveError::DeviceUnavailable(_) => "device_unavailable",
            LiveError::Transport(_) => "transport_error",
            LiveError::Authorization(_) => "authorization_error",
            LiveError::Decode(_) => "decode_error",
            LiveError::Send(_) => "send_error",
            LiveError::Playback(_) => "playback_error",
            LiveError::InvalidTransition { .. } => "invalid_transition",
        }
    }

    /// The bare cause, without the category prefix used by `Display`.
    pub fn cause(&self) -> String {
        match self {
            LiveError::DeviceUnavailable(msg)
            | LiveError::Transport(msg)
            | LiveError::Authorization(msg)
            | LiveError::Decode(msg)
            | LiveError::Send(msg)
            | LiveError::Playback(msg) => msg.clone(),
            LiveError::InvalidTransition { action, state } => {
                format!("cannot {} while {}", action, state)
            }
        }
    }
}

impl fmt::Display for LiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LiveError::DeviceUnavailable(msg) => write!(f, "Audio device unavailable: {}", msg),
            LiveError::Transport(msg) => write!(f, "Transport error: {}", msg),
            LiveError::Authorization(msg) => write!(f, "Authorization error: {}", msg),
            LiveError::Decode(msg) => write!(f, "Decode error: {}", msg),
            LiveError::Send(msg) => write!(f, "Send error: {}", msg),
            LiveError::Playback(msg) => write!(f, "Playback error: {}", msg),
            LiveError::InvalidTransition { action, state } => {
                write!(f, "Invalid transition: cannot {} while {}", action, state)
            }
        }
    }
}

impl std::error::Error for LiveError {}

/// Errors returned by HTTP handlers.
///
/// ## HTTP Status Code Mapping:
/// - Internal → 500
/// - BadRequest/ValidationError → 400
/// - NotFound → 404
/// - Conflict → 409 (session operation not allowed in the current state)
/// - Session → 401 for authorization failures, 503 otherwise
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// User input failed validation rules
    ValidationError(String),

    /// The live session cannot perform the requested operation right now
    Conflict(String),

    /// The live session failed while performing the request
    Session(LiveError),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppError::Session(err) => write!(f, "Session error: {}", err),
        }
    }
}

/// JSON error body:
/// ```json
/// {
///   "error": {
///     "type": "authorization_error",
///     "message": "Requested entity was not found.",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;

        match self {
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Session(LiveError::Authorization(_)) => StatusCode::UNAUTHORIZED,
            AppError::Session(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::Internal(msg) => ("internal_error", msg.clone()),
            AppError::BadRequest(msg) => ("bad_request", msg.clone()),
            AppError::NotFound(msg) => ("not_found", msg.clone()),
            AppError::ValidationError(msg) => ("validation_error", msg.clone()),
            AppError::Conflict(msg) => ("conflict", msg.clone()),
            AppError::Session(err) => (err.kind(), err.cause()),
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

/// Session errors map onto HTTP semantics: a refused transition is a conflict,
/// everything else is reported with its own category.
impl From<LiveError> for AppError {
    fn from(err: LiveError) -> Self {
        match err {
            LiveError::InvalidTransition { .. } => AppError::Conflict(err.cause()),
            other => AppError::Session(other),
        }
    }
}

/// JSON parsing errors are the client's fault.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_not_found_is_authorization() {
        let err = LiveError::from_transport_cause("Requested entity was not found.");
        assert_eq!(err.kind(), "authorization_error");

        let err = LiveError::from_transport_cause("connection reset by peer");
        assert_eq!(err.kind(), "transport_error");
    }

    #[test]
    fn test_http_status_mapping() {
        use actix_web::http::StatusCode;

        let conflict: AppError = LiveError::InvalidTransition { action: "start", state: "active" }.into();
        assert_eq!(conflict.status_code(), StatusCode::CONFLICT);

        let auth: AppError = LiveError::Authorization("no key".into()).into();
        assert_eq!(auth.status_code(), StatusCode::UNAUTHORIZED);

        let device: AppError = LiveError::DeviceUnavailable("no mic".into()).into();
        assert_eq!(device.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
