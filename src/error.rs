//! # Error Handling
//!
//! Error types for the relay and how they surface.
//!
//! ## Error Families:
//! - **AppError**: HTTP-facing; converted into a JSON error response
//! - **ConnectionRejected**: a websocket upgrade refused before any session exists
//! - **RelayError**: raised inside a running session; most are recovered locally
//!
//! ## Propagation:
//! Only connection rejections and upstream connect failures end a session.
//! Malformed frames, send failures and bad audio are logged and the session
//! carries on. No error crosses from one session into another.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// HTTP-facing errors.
///
/// ## Error Categories:
/// - **Internal**: server-side problems (500)
/// - **BadRequest**: client sent something unusable (400)
/// - **NotFound**: no route or resource (404)
/// - **ConfigError**: configuration problems (500)
/// - **ServiceUnavailable**: temporarily out of capacity (503)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    ConfigError(String),
    ServiceUnavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    /// Machine-readable type tag used in the JSON body.
    fn error_type(&self) -> &'static str {
        match self {
            AppError::Internal(_) => "internal_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::ConfigError(_) => "config_error",
            AppError::ServiceUnavailable(_) => "service_unavailable",
        }
    }

    fn message(&self) -> &str {
        match self {
            AppError::Internal(msg)
            | AppError::BadRequest(msg)
            | AppError::NotFound(msg)
            | AppError::ConfigError(msg)
            | AppError::ServiceUnavailable(msg) => msg,
        }
    }
}

/// Every error renders as:
/// ```json
/// {
///   "error": {
///     "type": "service_unavailable",
///     "message": "session limit of 32 reached",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.error_type(),
                "message": self.message(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

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

/// Why the gateway refused an inbound connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionRejected {
    /// Request path does not match the relay path
    InvalidPath(String),
    /// Not a valid websocket upgrade
    NotWebsocket(String),
    /// Live session limit reached
    AtCapacity(usize),
}

impl fmt::Display for ConnectionRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionRejected::InvalidPath(path) => write!(f, "Invalid pathname: \"{}\"", path),
            ConnectionRejected::NotWebsocket(reason) => write!(f, "Not a websocket upgrade: {}", reason),
            ConnectionRejected::AtCapacity(limit) => write!(f, "Session limit of {} reached", limit),
        }
    }
}

impl std::error::Error for ConnectionRejected {}

impl From<ConnectionRejected> for AppError {
    fn from(err: ConnectionRejected) -> Self {
        match err {
            ConnectionRejected::InvalidPath(_) => AppError::NotFound(err.to_string()),
            ConnectionRejected::NotWebsocket(_) => AppError::BadRequest(err.to_string()),
            ConnectionRejected::AtCapacity(_) => AppError::ServiceUnavailable(err.to_string()),
        }
    }
}

/// Errors raised inside a running relay session.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayError {
    /// Frame is not a JSON object carrying a string `type`
    MalformedFrame(String),
    /// Upstream handshake failed
    UpstreamConnect(String),
    /// Upstream handshake did not finish in time
    ConnectTimeout(u64),
    /// Upstream writer is gone
    UpstreamSend(String),
    /// Too many client messages queued while connecting
    PendingOverflow(usize),
    /// Audio payload could not be decoded
    InvalidAudio(String),
}

impl RelayError {
    /// Whether this error ends the session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::UpstreamConnect(_) | RelayError::ConnectTimeout(_) | RelayError::PendingOverflow(_)
        )
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::MalformedFrame(msg) => write!(f, "Malformed frame: {}", msg),
            RelayError::UpstreamConnect(msg) => write!(f, "Upstream connect failed: {}", msg),
            RelayError::ConnectTimeout(ms) => write!(f, "Upstream connect timed out after {}ms", ms),
            RelayError::UpstreamSend(msg) => write!(f, "Upstream send failed: {}", msg),
            RelayError::PendingOverflow(limit) => {
                write!(f, "More than {} messages queued while connecting", limit)
            }
            RelayError::InvalidAudio(msg) => write!(f, "Invalid audio: {}", msg),
        }
    }
}

impl std::error::Error for RelayError {}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[test]
    fn test_rejections_map_to_status_codes() {
        let not_found: AppError = ConnectionRejected::InvalidPath("/x".into()).into();
        let bad: AppError = ConnectionRejected::NotWebsocket("missing upgrade".into()).into();
        let busy: AppError = ConnectionRejected::AtCapacity(2).into();

        assert_eq!(not_found.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(bad.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(busy.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_only_connect_errors_are_fatal() {
        assert!(RelayError::UpstreamConnect("refused".into()).is_fatal());
        assert!(RelayError::ConnectTimeout(10_000).is_fatal());
        assert!(RelayError::PendingOverflow(4).is_fatal());
        assert!(!RelayError::MalformedFrame("not json".into()).is_fatal());
        assert!(!RelayError::UpstreamSend("closed".into()).is_fatal());
        assert!(!RelayError::InvalidAudio("bad base64".into()).is_fatal());
    }

    #[actix_web::test]
    async fn test_error_body_shape() {
        let response = AppError::ServiceUnavailable("full".into()).error_response();
        let body = to_bytes(response.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(value["error"]["type"], "service_unavailable");
        assert_eq!(value["error"]["message"], "full");
        assert!(value["error"]["timestamp"].is_string());
    }
}
