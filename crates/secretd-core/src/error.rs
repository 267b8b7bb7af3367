//! Error taxonomy for the agent.
//!
//! Every fallible operation in the workspace returns [`Error`]. The variants
//! map one-to-one onto the wire statuses written by the daemon; the mapping
//! itself lives in [`Error::status`] so the CLI can render the same envelope
//! for local (journal-backed) failures.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur while serving or performing secret operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Unparseable configuration, an unknown shell, or duplicate plan ids.
    /// Fatal at startup.
    #[error("invalid configuration: {0}")]
    BadConfig(String),

    /// Unparseable request body, a too-long reason, an unknown operation
    /// name, or a non-numeric range bound.
    #[error("{0}")]
    BadRequest(String),

    /// The connection has no usable peer credentials, or the peer could not
    /// be resolved against the user database.
    #[error("{0}")]
    Unauthenticated(String),

    /// The caller's claimed roles do not grant the required permissions.
    #[error("{0}")]
    Forbidden(String),

    /// The per-principal request limiter rejected the call.
    #[error("rate limit exceeded")]
    RateLimited {
        /// Seconds the caller should wait before retrying.
        retry_after: u64,
    },

    /// The secret plan or instance is not known.
    #[error("{0}")]
    NotFound(String),

    /// A state-machine admission guard tripped and `forced` was not set.
    #[error("cannot {0}")]
    OperationRefused(String),

    /// A lifecycle script failed to spawn or exited nonzero.
    #[error("process failed '{command}' - {message}")]
    CommandFailed {
        /// Redacted rendering of the failing command.
        command: String,
        /// Spawn or exit-status detail.
        message: String,
    },

    /// A journal read or write failed. The surrounding transaction has been
    /// rolled back.
    #[error("journal error: {0}")]
    Journal(String),

    /// The ambient cancellation token was tripped.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// The HTTP status this error is reported as.
    ///
    /// Unknown secrets and instances are deliberately reported as 400: the
    /// resource grammar does not distinguish "missing" from "malformed".
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::BadRequest(_) | Self::NotFound(_) | Self::OperationRefused(_) => 400,
            Self::Unauthenticated(_) => 401,
            Self::Forbidden(_) => 403,
            Self::RateLimited { .. } => 429,
            Self::BadConfig(_)
            | Self::CommandFailed { .. }
            | Self::Journal(_)
            | Self::Cancelled => 500,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Journal(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(err.to_string())
    }
}

/// Wire envelope for errors: `{"error": {"status": 400, "message": "..."}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// The error detail; absent on success bodies probed by the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

/// The inner error object of the wire envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// HTTP status code, equal to the response status line.
    pub status: u16,
    /// Human-readable message.
    pub message: String,
}

impl From<&Error> for ErrorBody {
    fn from(err: &Error) -> Self {
        Self {
            error: Some(ErrorDetail {
                status: err.status(),
                message: err.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(Error::BadRequest("x".into()).status(), 400);
        assert_eq!(Error::NotFound("x".into()).status(), 400);
        assert_eq!(Error::OperationRefused("x".into()).status(), 400);
        assert_eq!(Error::Unauthenticated("x".into()).status(), 401);
        assert_eq!(Error::Forbidden("no".into()).status(), 403);
        assert_eq!(Error::RateLimited { retry_after: 60 }.status(), 429);
        assert_eq!(Error::Journal("x".into()).status(), 500);
        assert_eq!(Error::Cancelled.status(), 500);
    }

    #[test]
    fn refusal_message_has_cannot_prefix() {
        let err = Error::OperationRefused("activate when instance i is active".into());
        assert_eq!(err.to_string(), "cannot activate when instance i is active");
    }

    #[test]
    fn envelope_round_trip() {
        let err = Error::BadRequest("failed to parse 'from'".into());
        let body = ErrorBody::from(&err);
        let json = serde_json::to_string(&body).unwrap();
        assert_eq!(
            json,
            r#"{"error":{"status":400,"message":"failed to parse 'from'"}}"#
        );
        let parsed: ErrorBody = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.error.unwrap().status, 400);
    }
}
