//! The tagged error taxonomy (Section 7).
//!
//! Component-level errors (state store, worktree, executor, ...) are their
//! own `thiserror` enums, each with a `From` impl into `RunError` so that
//! `Engine::run` can bubble anything to a single tagged kind without losing
//! the original message.

use thiserror::Error;

/// The tagged error kinds a run can terminate with.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("corrupt state: {0}")]
    Corrupt(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("assistant exited with code {code}")]
    Subprocess { code: i32 },

    #[error("cancelled")]
    Cancelled,

    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl RunError {
    /// Exit code the CLI should use when this error terminates a foreground run.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::Validation(_) => 2,
            RunError::Cancelled => 130,
            _ => 1,
        }
    }

    /// Whether this error should be logged as a failure, or just noted.
    ///
    /// `Cancelled` is surfaced as a non-zero exit but is not itself a bug,
    /// per Section 7: "surfaced as non-zero exit but not as a failure in logs".
    pub fn is_failure(&self) -> bool {
        !matches!(self, RunError::Cancelled)
    }
}
