//! Failure taxonomy for the command pipeline.
//!
//! Every way a command can fail to produce a normal result is one variant of
//! [`DispatchError`]. The dispatcher never lets these cross its public
//! boundary as `Err`: each one is folded into a [`CommandResponse`] carrying
//! the matching exit code.
//!
//! [`CommandResponse`]: crate::dispatcher::CommandResponse

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Exit code for a successful command.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code for a generic execution error (nonzero exit, spawn failure).
pub const EXIT_FAILURE: i32 = 1;
/// Exit code for a command killed because it outlived its timeout.
pub const EXIT_TIMEOUT: i32 = 124;
/// Exit code for a real execution cancelled by the caller.
pub const EXIT_CANCELLED: i32 = 130;
/// Exit code for input rejected by the sanitizer.
pub const EXIT_INVALID_INPUT: i32 = 400;
/// Exit code for a command rejected by policy.
pub const EXIT_FORBIDDEN: i32 = 403;
/// Exit code for a session over its rate limit.
pub const EXIT_RATE_LIMITED: i32 = 429;
/// Exit code for an internal failure of the pipeline itself.
pub const EXIT_INTERNAL: i32 = 500;

/// Coarse classification of how a command invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failed,
    InvalidInput,
    Forbidden,
    RateLimited,
    Timeout,
    Cancelled,
    InternalError,
}

/// Reasons a command was stopped before or during execution.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// Sanitization or validation failed. The user can correct the input.
    #[error("invalid input: {0}")]
    InputRejected(String),

    /// Unknown command or disallowed argument. Never executed.
    #[error("command rejected: {reason}")]
    PolicyRejected {
        reason: String,
        suggestion: Option<String>,
    },

    /// Session exceeded its quota for the current window.
    #[error("rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimited { remaining: u32, retry_after_secs: u64 },

    /// The subprocess was killed after exceeding its timeout.
    #[error("command timed out after {0}ms")]
    ExecutionTimeout(u64),

    /// Spawn error or nonzero exit, surfaced verbatim.
    #[error("execution failed: {0}")]
    ExecutionFailure(String),

    /// The caller cancelled an in-flight real execution.
    #[error("execution cancelled")]
    Cancelled,

    /// Pipeline state was found inconsistent (e.g. a poisoned lock).
    /// The detail goes to operators only.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    pub fn exit_code(&self) -> i32 {
        match self {
            DispatchError::InputRejected(_) => EXIT_INVALID_INPUT,
            DispatchError::PolicyRejected { .. } => EXIT_FORBIDDEN,
            DispatchError::RateLimited { .. } => EXIT_RATE_LIMITED,
            DispatchError::ExecutionTimeout(_) => EXIT_TIMEOUT,
            DispatchError::ExecutionFailure(_) => EXIT_FAILURE,
            DispatchError::Cancelled => EXIT_CANCELLED,
            DispatchError::Internal(_) => EXIT_INTERNAL,
        }
    }

    pub fn outcome(&self) -> Outcome {
        match self {
            DispatchError::InputRejected(_) => Outcome::InvalidInput,
            DispatchError::PolicyRejected { .. } => Outcome::Forbidden,
            DispatchError::RateLimited { .. } => Outcome::RateLimited,
            DispatchError::ExecutionTimeout(_) => Outcome::Timeout,
            DispatchError::ExecutionFailure(_) => Outcome::Failed,
            DispatchError::Cancelled => Outcome::Cancelled,
            DispatchError::Internal(_) => Outcome::InternalError,
        }
    }

    /// Message safe to show to the client. Internal details are withheld.
    pub fn client_message(&self) -> String {
        match self {
            DispatchError::Internal(_) => {
                "internal error while processing command".to_string()
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(DispatchError::InputRejected("x".into()).exit_code(), 400);
        assert_eq!(
            DispatchError::PolicyRejected {
                reason: "x".into(),
                suggestion: None
            }
            .exit_code(),
            403
        );
        assert_eq!(
            DispatchError::RateLimited {
                remaining: 0,
                retry_after_secs: 10
            }
            .exit_code(),
            429
        );
        assert_eq!(DispatchError::ExecutionTimeout(10).exit_code(), 124);
        assert_eq!(DispatchError::Internal("x".into()).exit_code(), 500);
    }

    #[test]
    fn test_internal_detail_is_not_exposed() {
        let err = DispatchError::Internal("rate limiter mutex poisoned".into());
        assert!(!err.client_message().contains("poisoned"));
    }
}
