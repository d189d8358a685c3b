//! Error types: request routing failures and transport failures.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Routing failures reported to HTTP callers. Discriminants are the wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorCode {
    #[error("Transport unknown")]
    UnknownTransport = 0,
    #[error("Session ID unknown")]
    UnknownSid = 1,
    #[error("Bad handshake method")]
    BadHandshakeMethod = 2,
    #[error("Bad request")]
    BadRequest = 3,
}

/// Wire body for routing failures: `{"code": N, "message": "..."}`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: u8,
    pub message: String,
}

impl ErrorCode {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn body(self) -> ErrorBody {
        ErrorBody {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

impl IntoResponse for ErrorCode {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, Json(self.body())).into_response()
    }
}

/// Failures raised by a transport through its `Error` event.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("overlap from client")]
    PollOverlap,
    #[error("data request overlap from client")]
    DataOverlap,
    #[error("websocket read failed: {0}")]
    Read(String),
    #[error("websocket write failed: {0}")]
    Write(String),
}

impl TransportError {
    /// Fatal errors end the transport; overlaps only reject one request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Read(_) | TransportError::Write(_))
    }
}
