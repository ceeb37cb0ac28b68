//! Error types and HTTP response conversion

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias using the runtime error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the servient runtime
///
/// Large error variants are boxed to reduce stack size
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// No form, no client, or a scheme variant whose behavior is
    /// intentionally not implemented
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Inbound authenticator rejected the request credentials
    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    /// Soft or hard timeout elapsed
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Malformed wire response (non-2xx, unsuccessful CoAP code,
    /// JSON parse failure)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A user-registered interaction handler failed
    #[error("Handler error: {0}")]
    Handler(String),

    /// Servient topology modified while running
    #[error("Servient state error: {0}")]
    State(String),

    /// Unknown Thing or interaction
    #[error("Not found: {0}")]
    NotFound(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True if the error was directly caused by the remote peer or the
    /// wire rather than by this servient.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Protocol(_) | Error::Timeout(_) | Error::Io(_))
    }
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,

    /// Optional error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// HTTP status code
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
            status: status.as_u16(),
        }
    }

    /// Create error response with a code
    pub fn with_code(
        status: StatusCode,
        code: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            error: error.into(),
            code: Some(code.into()),
            status: status.as_u16(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_response) = match self {
            Error::Config(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::with_code(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "CONFIG_ERROR",
                    e.to_string(),
                ),
            ),

            Error::NotSupported(msg) => (
                StatusCode::NOT_IMPLEMENTED,
                ErrorResponse::with_code(StatusCode::NOT_IMPLEMENTED, "NOT_SUPPORTED", msg),
            ),

            Error::Unauthorized(msg) => (
                StatusCode::UNAUTHORIZED,
                ErrorResponse::with_code(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg),
            ),

            Error::Timeout(msg) => (
                StatusCode::GATEWAY_TIMEOUT,
                ErrorResponse::with_code(StatusCode::GATEWAY_TIMEOUT, "TIMEOUT", msg),
            ),

            Error::Protocol(msg) => {
                tracing::error!("Protocol error: {}", msg);
                (
                    StatusCode::BAD_GATEWAY,
                    ErrorResponse::with_code(StatusCode::BAD_GATEWAY, "PROTOCOL_ERROR", msg),
                )
            }

            Error::Handler(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::with_code(StatusCode::INTERNAL_SERVER_ERROR, "HANDLER_ERROR", msg),
            ),

            Error::State(msg) => (
                StatusCode::CONFLICT,
                ErrorResponse::with_code(StatusCode::CONFLICT, "STATE_ERROR", msg),
            ),

            Error::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                ErrorResponse::with_code(StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ),

            Error::Io(e) => {
                tracing::error!("I/O error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "IO_ERROR",
                        "I/O operation failed",
                    ),
                )
            }
        };

        (status, Json(error_response)).into_response()
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

// Manual From implementations for boxed and remapped errors
impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Protocol(format!("JSON error: {}", err))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout(err.to_string())
        } else {
            Error::Protocol(err.to_string())
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::Protocol(format!("Invalid URL: {}", err))
    }
}

impl From<rumqttc::ClientError> for Error {
    fn from(err: rumqttc::ClientError) -> Self {
        Error::Protocol(format!("MQTT error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response() {
        let err = ErrorResponse::new(StatusCode::NOT_FOUND, "Thing not found");
        assert_eq!(err.status, 404);
        assert_eq!(err.error, "Thing not found");
        assert!(err.code.is_none());
    }

    #[test]
    fn test_error_response_with_code() {
        let err = ErrorResponse::with_code(
            StatusCode::UNAUTHORIZED,
            "UNAUTHORIZED",
            "Bad credentials",
        );
        assert_eq!(err.status, 401);
        assert_eq!(err.error, "Bad credentials");
        assert_eq!(err.code, Some("UNAUTHORIZED".to_string()));
    }

    #[test]
    fn test_transport_classification() {
        assert!(Error::Protocol("bad response".into()).is_transport());
        assert!(Error::Timeout("5s elapsed".into()).is_transport());
        assert!(!Error::Handler("boom".into()).is_transport());
        assert!(!Error::State("running".into()).is_transport());
    }

    #[test]
    fn test_json_error_maps_to_protocol() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{nope").unwrap_err();
        let err: Error = parse_err.into();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
