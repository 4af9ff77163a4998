use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Canonical error codes shared by every subsystem (spec.md §7).
///
/// These are not HTTP status codes: a single code maps to exactly one HTTP status
/// (see [`Code::http_status`]), but callers deal in codes so that the same error
/// can be logged, recovered from, or retried without any component depending on
/// HTTP directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    InvalidArgument,
    Unauthenticated,
    PermissionDenied,
    NotFound,
    Unavailable,
    DeadlineExceeded,
    Cancelled,
    Internal,
}

impl Code {
    pub fn http_status(self) -> StatusCode {
        match self {
            Code::InvalidArgument => StatusCode::BAD_REQUEST,
            Code::Unauthenticated => StatusCode::UNAUTHORIZED,
            Code::PermissionDenied => StatusCode::FORBIDDEN,
            Code::NotFound => StatusCode::NOT_FOUND,
            Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            Code::Cancelled => StatusCode::from_u16(499).expect("499 is a valid status code"),
            Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A tagged error: anything that crosses a subsystem boundary carries a
/// canonical [`Code`]. Errors without an explicit code (bare `anyhow::Error`,
/// I/O failures, an unexpected child-process exit) are treated as `Internal`,
/// per spec.md §7 ("Any error without a canonical code is treated as Internal").
#[derive(thiserror::Error, Debug)]
#[error("{message}")]
pub struct Error {
    pub code: Code,
    pub message: String,
    #[source]
    source: Option<anyhow::Error>,
}

impl Error {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(Code::Unauthenticated, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(Code::PermissionDenied, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn internal(err: impl Into<anyhow::Error>) -> Self {
        let source = err.into();
        Self {
            code: Code::Internal,
            message: source.to_string(),
            source: Some(source),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code == Code::NotFound
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::internal(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::internal(anyhow::Error::new(err))
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        if self.code == Code::Internal {
            tracing::error!(error = %self.message, source = ?self.source, "internal server error");
        } else {
            tracing::debug!(code = ?self.code, error = %self.message, "request failed");
        }
        (self.code.http_status(), self.message).into_response()
    }
}

/// The best-effort `ERR <message>` pkt-line written when a response stream must
/// be aborted after it has already started (spec.md §7, "User-visible behaviour").
pub fn err_pkt_line(message: &str) -> Vec<u8> {
    crate::pktline::encode_data(format!("ERR {message}\n").as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_spec() {
        assert_eq!(Code::InvalidArgument.http_status(), StatusCode::BAD_REQUEST);
        assert_eq!(Code::Unauthenticated.http_status(), StatusCode::UNAUTHORIZED);
        assert_eq!(Code::PermissionDenied.http_status(), StatusCode::FORBIDDEN);
        assert_eq!(Code::NotFound.http_status(), StatusCode::NOT_FOUND);
        assert_eq!(Code::Unavailable.http_status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(Code::DeadlineExceeded.http_status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(Code::Cancelled.http_status().as_u16(), 499);
        assert_eq!(Code::Internal.http_status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn err_pkt_line_is_well_formed() {
        let line = err_pkt_line("boom");
        assert_eq!(line, b"000dERR boom\n");
    }
}
