//! Command execution backends.
//!
//! Two executors produce the same [`ExecutionResult`] shape:
//! - [`SimulatedExecutor`] returns deterministic canned output and never
//!   touches the host.
//! - [`ProcessExecutor`] spawns a real subprocess with an explicit argv, a
//!   filtered environment, a timeout and capped output.

mod env;
mod process;
mod simulated;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub use env::{
    DEFAULT_ENV_ALLOWLIST, EnvProvider, StaticEnv, SystemEnv, build_restricted_env,
    is_dangerous_env,
};
pub use process::{ProcessExecutor, TRUNCATION_MARKER};
pub use simulated::SimulatedExecutor;

/// How an execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    /// The process (or simulation) ran to completion.
    Exited,
    /// Killed after exceeding the timeout.
    TimedOut,
    /// Killed because the caller cancelled.
    Cancelled,
    /// The binary could not be started.
    SpawnFailed,
    /// The executor's own policy check refused the command.
    Refused,
}

/// Normalized result of either executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub kind: ExecutionKind,
    /// Set when stdout or stderr hit the byte cap.
    #[serde(default)]
    pub truncated: bool,
    /// Process id of a real execution, for diagnostics.
    #[serde(skip)]
    pub pid: Option<u32>,
}

impl ExecutionResult {
    pub fn exited(stdout: impl Into<String>, stderr: impl Into<String>, exit_code: i32) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
            duration_ms: 0,
            kind: ExecutionKind::Exited,
            truncated: false,
            pid: None,
        }
    }

    /// stdout followed by stderr, separated by a newline when needed.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            return self.stdout.clone();
        }
        if self.stdout.is_empty() {
            return self.stderr.clone();
        }
        let mut out = self.stdout.clone();
        if !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&self.stderr);
        out
    }
}

/// A single validated command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub command: String,
    pub args: Vec<String>,
    pub session_id: String,
    pub original_text: String,
    pub timestamp: DateTime<Utc>,
    pub allow_real: bool,
}

/// Options for a real execution.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub cwd: Option<PathBuf>,
    /// Extra variables, still subject to the environment allowlist.
    pub env: HashMap<String, String>,
    pub timeout: Duration,
}

/// Seam between the dispatcher and real execution.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        command: &str,
        args: &[String],
        options: &ExecOptions,
        cancel: &CancellationToken,
    ) -> ExecutionResult;
}
