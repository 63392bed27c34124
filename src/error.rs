//! Error types and JSON error responses

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

/// Errors returned by the process supervisor
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// No process is tracked under this name
    #[error("no process named '{0}'")]
    NotFound(String),

    /// The process could not be launched at all
    #[error("failed to launch '{name}': {reason}")]
    LaunchFailure { name: String, reason: String },

    /// The process never accepted connections on its port
    #[error("'{name}' did not listen on port {port} within {}s", timeout.as_secs())]
    ReadinessTimeout {
        name: String,
        port: u16,
        timeout: Duration,
    },

    /// The process exited before it became ready
    #[error("'{name}' exited before becoming ready: {reason}")]
    Exited { name: String, reason: String },

    /// Every port in the configured range is taken
    #[error("no free port in range {start}..{end}")]
    PortExhaustion { start: u16, end: u16 },
}

/// Errors from resolving a user-supplied app or service name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    #[error("no app or service named '{0}'")]
    NotFound(String),

    /// A bare service name exists in more than one app
    #[error("'{name}' is ambiguous, use one of: {}", candidates.join(", "))]
    Ambiguous {
        name: String,
        candidates: Vec<String>,
    },
}

/// Error codes for proxy and control API errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// A required query parameter is missing
    MissingParameter,
    /// No app, alias or service matches the name
    UnknownApp,
    /// A bare service name matches services of several apps
    AmbiguousName,
    /// The named process is not tracked
    NotRunning,
    /// The app type cannot be started or stopped
    NotManaged,
    /// The process could not be launched
    LaunchFailed,
    /// Request timed out waiting for the backend
    RequestTimeout,
    /// Failed to connect to the backend
    ConnectionFailed,
    /// Unknown control API route
    NotFound,
    /// Internal proxy error
    InternalError,
}

impl ErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ErrorCode::MissingParameter => StatusCode::BAD_REQUEST,
            ErrorCode::UnknownApp => StatusCode::NOT_FOUND,
            ErrorCode::AmbiguousName => StatusCode::CONFLICT,
            ErrorCode::NotRunning => StatusCode::NOT_FOUND,
            ErrorCode::NotManaged => StatusCode::BAD_REQUEST,
            ErrorCode::LaunchFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Devhost-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ErrorCode::MissingParameter => "MISSING_PARAMETER",
            ErrorCode::UnknownApp => "UNKNOWN_APP",
            ErrorCode::AmbiguousName => "AMBIGUOUS_NAME",
            ErrorCode::NotRunning => "NOT_RUNNING",
            ErrorCode::NotManaged => "NOT_MANAGED",
            ErrorCode::LaunchFailed => "LAUNCH_FAILED",
            ErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl From<&SupervisorError> for ErrorCode {
    fn from(err: &SupervisorError) -> Self {
        match err {
            SupervisorError::NotFound(_) => ErrorCode::NotRunning,
            SupervisorError::LaunchFailure { .. }
            | SupervisorError::ReadinessTimeout { .. }
            | SupervisorError::Exited { .. }
            | SupervisorError::PortExhaustion { .. } => ErrorCode::LaunchFailed,
        }
    }
}

impl From<&LookupError> for ErrorCode {
    fn from(err: &LookupError) -> Self {
        match err {
            LookupError::NotFound(_) => ErrorCode::UnknownApp,
            LookupError::Ambiguous { .. } => ErrorCode::AmbiguousName,
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Devhost-Error header
pub fn json_error_response(
    code: ErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Devhost-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
