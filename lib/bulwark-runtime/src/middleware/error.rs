use std::fmt;

use axum::response::{IntoResponse, Response};
use bulwark_error::GenericError;
use http::{header, StatusCode};

/// Close code for a normal websocket closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code for a websocket closed because of a policy violation (client errors).
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Close code for a websocket closed because of an internal error (server errors).
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Close code for a websocket closed abnormally.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// An error with an HTTP status and a body that is sent to the client verbatim.
///
/// Handlers return it as the error half of their `Result`. It may also be raised with
/// [`std::panic::panic_any`] from code that has no way to return it, in which case the request guard recovers it and
/// sends it as-is, without substituting the configured failure message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HttpError {
    status: StatusCode,
    body: String,
}

impl HttpError {
    /// Creates a new `HttpError`.
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// A `404 Not Found` error.
    pub fn not_found(body: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, body)
    }

    /// A `400 Bad Request` error.
    pub fn bad_request(body: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, body)
    }

    /// A `500 Internal Server Error` error.
    pub fn server_error(body: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, body)
    }

    /// The error sent when a required request parameter is absent.
    pub fn missing_parameter(name: &str) -> Self {
        Self::bad_request(format!("Missing required parameter: {}", name))
    }

    /// Response status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Response body, without the trailing line terminator.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// The websocket close code equivalent to this error's status class.
    pub fn close_code(&self) -> u16 {
        close_code_for_status(self.status)
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status.as_u16(), self.body)
    }
}

impl std::error::Error for HttpError {}

impl From<GenericError> for HttpError {
    fn from(e: GenericError) -> Self {
        Self::server_error(format!("Internal error: {}", e))
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        (
            self.status,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            format!("{}\r\n", self.body),
        )
            .into_response()
    }
}

/// A websocket close frame to send when a streaming session ends.
///
/// Like [`HttpError`], it can be returned or raised with [`std::panic::panic_any`] from within a streaming session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CloseMessage {
    code: u16,
    reason: String,
}

impl CloseMessage {
    /// Creates a new `CloseMessage`.
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// A normal closure with no reason.
    pub fn normal() -> Self {
        Self::new(CLOSE_NORMAL, "")
    }

    /// An abnormal closure.
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(CLOSE_ABNORMAL, reason)
    }

    /// Close code.
    pub fn code(&self) -> u16 {
        self.code
    }

    /// Close reason.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl fmt::Display for CloseMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "close {} {}", self.code, self.reason)
    }
}

impl From<HttpError> for CloseMessage {
    fn from(e: HttpError) -> Self {
        Self::new(e.close_code(), e.body)
    }
}

/// Maps an HTTP status to a websocket close code by class: success is a normal closure, client errors are policy
/// violations, server errors are internal errors, and anything else is an abnormal closure.
pub fn close_code_for_status(status: StatusCode) -> u16 {
    if status.is_success() {
        CLOSE_NORMAL
    } else if status.is_client_error() {
        CLOSE_POLICY_VIOLATION
    } else if status.is_server_error() {
        CLOSE_INTERNAL_ERROR
    } else {
        CLOSE_ABNORMAL
    }
}
