//! Error types and HTTP response conversion

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::fmt;
use thiserror::Error;

/// Result type alias using the kernel error
pub type Result<T> = std::result::Result<T, Error>;

/// Authentication failure sub-cause
///
/// Never exposed in web responses; only the generic 401 escapes. The
/// sub-cause is available to admin tooling and log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthKind {
    /// No such user id
    UnknownUser,
    /// User exists but is disabled
    Disabled,
    /// Password, digest or token signature mismatch
    BadCredential,
    /// Nonce or challenge too old
    Stale,
    /// Token past its expiry, or invalidated by a later authorization stamp
    Expired,
}

impl fmt::Display for AuthKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownUser => write!(f, "unknown_user"),
            Self::Disabled => write!(f, "disabled"),
            Self::BadCredential => write!(f, "bad_credential"),
            Self::Stale => write!(f, "stale"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

/// Procedure execution failure sub-cause
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcedureKind {
    /// No procedure registered under the requested name
    NotFound,
    /// Call stack depth limit exceeded
    Recursion,
    /// The call context was cancelled
    Cancelled,
    /// A binding could not be resolved
    Binding,
    /// The procedure body failed
    Runtime,
}

impl fmt::Display for ProcedureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::Recursion => write!(f, "recursion"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Binding => write!(f, "binding"),
            Self::Runtime => write!(f, "runtime"),
        }
    }
}

/// Main error type for the kernel
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Write or remove against a read-only storage mount
    #[error("Read-only storage: {0}")]
    ReadOnly(String),

    /// Stored object could not be constructed or validated
    #[error("Bad object at {path}: {reason}")]
    BadObject { path: String, reason: String },

    /// Underlying storage I/O failure
    #[error("Storage I/O error: {0}")]
    StorageIo(#[from] std::io::Error),

    /// Authentication failure
    #[error("Authentication failed: {0}")]
    Auth(AuthKind),

    /// Authorization failure
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Channel pool borrow timed out
    #[error("Connection pool exhausted: {0}")]
    PoolExhausted(String),

    /// Channel connect or validation failure
    #[error("Channel error: {0}")]
    Channel(String),

    /// Procedure call failure
    #[error("Procedure error ({kind}): {message}")]
    Procedure {
        kind: ProcedureKind,
        message: String,
    },

    /// Plug-in install or load failure
    #[error("Plug-in error: {0}")]
    Plugin(String),

    /// Malformed client input
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Web resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a procedure error of the given kind
    pub fn procedure(kind: ProcedureKind, message: impl Into<String>) -> Self {
        Error::Procedure {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for a bad-object error
    pub fn bad_object(path: impl fmt::Display, reason: impl Into<String>) -> Self {
        Error::BadObject {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    /// True for errors callers may meaningfully retry
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::PoolExhausted(_) | Error::Channel(_))
    }

    /// The HTTP status this error maps to
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Auth(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::PoolExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Procedure {
                kind: ProcedureKind::NotFound,
                ..
            } => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// Web responses are plain text: status line plus a short message. Auth
// errors never reveal their sub-cause, and internal details stay in the
// log rather than the body.
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Error::Auth(kind) => {
                tracing::info!(kind = %kind, "authentication failed");
                "Unauthorized".to_string()
            }
            Error::Forbidden(msg) => format!("Forbidden: {}", msg),
            Error::NotFound(msg) => format!("Not found: {}", msg),
            Error::BadRequest(msg) => format!("Bad request: {}", msg),
            Error::PoolExhausted(_) => {
                tracing::warn!("{}", self);
                "Service temporarily unavailable".to_string()
            }
            Error::Procedure { kind, message } => {
                tracing::warn!(kind = %kind, "procedure call failed: {}", message);
                format!("Procedure error: {}", message)
            }
            other => {
                tracing::error!("{}", other);
                "Internal server error".to_string()
            }
        };
        let text = format!("{} {}\n{}", status.as_u16(), status.canonical_reason().unwrap_or(""), body);
        (status, text).into_response()
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("JSON error: {}", err))
    }
}
