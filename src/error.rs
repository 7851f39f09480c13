//! Stable, user-visible error taxonomy shared across the engine.
//!
//! Each variant maps to a fixed exit code at the CLI boundary (see
//! `cli::exit_code`). Fatal variants propagate directly out of the engine;
//! per-task variants are recorded on a `TaskResult` and never abort a run.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GitOperationKind {
    #[error("non-fast-forward")]
    NonFastForward,
    #[error("authentication refused")]
    AuthRefused,
    #[error("broken ref")]
    BrokenRef,
    #[error("other git failure")]
    Other,
}

#[derive(Debug, Error)]
pub enum MgitError {
    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("profile not found: {0}")]
    ProfileNotFound(String),

    #[error("ambiguous default profile: candidates {0:?}, none marked default")]
    AmbiguousDefault(Vec<String>),

    #[error("invalid query {query:?}: {reason}")]
    InvalidQuery { query: String, reason: String },

    #[error("authentication failed: {0}")]
    AuthError(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("git operation failed ({kind}): {detail}")]
    GitOperationError {
        kind: GitOperationKind,
        detail: String,
    },

    #[error("destination obstructed: {0} exists and is not a git repository")]
    DestinationObstructed(String),

    #[error("name collision: {0:?} all sanitize to {1:?}")]
    NameCollision(Vec<String>, String),

    #[error("cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MgitError {
    /// Whether this error kind is safe to retry internally (adapter-level
    /// transient failures). Git-subprocess failures are never auto-retried
    /// by the executor itself — see `spec.md` §4.6.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MgitError::NetworkError(_) | MgitError::RateLimited(_))
    }

    /// The exit code a *fatal* occurrence of this error should map to.
    /// Per-task errors don't use this directly; see `bulk_ops::exit_code`.
    pub fn fatal_exit_code(&self) -> i32 {
        match self {
            MgitError::ConfigError(_)
            | MgitError::ProfileNotFound(_)
            | MgitError::AmbiguousDefault(_)
            | MgitError::InvalidQuery { .. }
            | MgitError::NameCollision(..) => 2,
            MgitError::AuthError(_) => 3,
            MgitError::Cancelled => 4,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, MgitError>;
