use std::{fmt, time::Duration};

use thiserror::Error;

// -----------------------------------------------------------------------------
// ----- DbError ---------------------------------------------------------------

/// Errors that cross the library boundary into application code.
#[derive(Debug, Error)]
pub enum DbError {
    /// Engine creation/repair or session validation ran out of attempts.
    #[error("database connection unavailable after {attempts} attempts: {last_error}")]
    ConnectionUnavailable { attempts: u32, last_error: String },

    #[error("session already closed")]
    SessionClosed,

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl DbError {
    pub fn unavailable(attempts: u32, last_error: impl fmt::Display) -> Self {
        DbError::ConnectionUnavailable {
            attempts,
            last_error: last_error.to_string(),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, DbError::ConnectionUnavailable { .. })
    }
}

// -----------------------------------------------------------------------------
// ----- BackendError ----------------------------------------------------------

/// Failures reported by an engine implementation (pool, connection, server).
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out after {}", human(.0))]
    Timeout(Duration),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{severity} {code}: {message}")]
    Server {
        severity: String,
        code: String,
        message: String,
    },

    #[error("unsupported authentication method (code {0})")]
    UnsupportedAuth(i32),

    #[error("{0}")]
    Closed(&'static str),

    #[error("{0}")]
    Rejected(String),
}

impl BackendError {
    pub fn protocol(message: impl Into<String>) -> Self {
        BackendError::Protocol(message.into())
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        BackendError::Rejected(message.into())
    }

    /// True when the underlying transport can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BackendError::Io(_)
                | BackendError::Timeout(_)
                | BackendError::Protocol(_)
                | BackendError::Closed(_)
        )
    }
}

fn human(duration: &Duration) -> humantime::FormattedDuration {
    humantime::format_duration(*duration)
}

// -----------------------------------------------------------------------------
// ----- CleanupError ----------------------------------------------------------

/// A failure on the release path. Logged and counted, never returned.
#[derive(Debug, Error)]
#[error("session {stage} failed during release: {source}")]
pub struct CleanupError {
    pub stage: CleanupStage,
    #[source]
    pub source: BackendError,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CleanupStage {
    Rollback,
    Close,
}

impl fmt::Display for CleanupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanupStage::Rollback => f.write_str("rollback"),
            CleanupStage::Close => f.write_str("close"),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_mentions_attempts_and_cause() {
        let err = DbError::unavailable(3, BackendError::rejected("connection refused"));
        assert!(err.is_unavailable());
        assert_eq!(
            err.to_string(),
            "database connection unavailable after 3 attempts: connection refused"
        );
    }

    #[test]
    fn timeout_renders_human_duration() {
        let err = BackendError::Timeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "timed out after 1s 500ms");
        assert!(err.is_fatal());
    }

    #[test]
    fn server_errors_keep_the_transport() {
        let err = BackendError::Server {
            severity: "ERROR".into(),
            code: "42P01".into(),
            message: "relation \"nope\" does not exist".into(),
        };
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "ERROR 42P01: relation \"nope\" does not exist");
    }

    #[test]
    fn cleanup_error_names_the_stage() {
        let err = CleanupError {
            stage: CleanupStage::Rollback,
            source: BackendError::Closed("connection closed"),
        };
        assert_eq!(
            err.to_string(),
            "session rollback failed during release: connection closed"
        );
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
