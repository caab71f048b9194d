//! Secure command dispatcher.
//!
//! Raw text goes through a fixed sequence of stages, each of which may end
//! the request:
//!
//! 0. suspicious-session gate (optional)
//! 1. screen: NFKC, validation, sanitization
//! 2. per-session rate limit
//! 3. parse into `(command, args)`
//! 4. allowlist check
//! 5. execute, simulated or real
//! 6. audit
//!
//! Every stage reports to the [`SecurityMonitor`]. Nothing is spawned unless
//! stages 0 through 4 all passed, and every outcome is returned as a
//! [`CommandResponse`], never as an error.

mod parse;
#[cfg(test)]
mod tests;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{DispatchError, EXIT_FAILURE, Outcome};
use crate::security::monitor::details;
use crate::security::sanitizer::screen;
use crate::security::{Allowlist, ExecMode, RateLimiter, SecurityMonitor, Severity, event_types};
use crate::session::{CommandRecord, SessionRegistry, SessionState};
use crate::shell::{
    CommandRunner, ExecOptions, ExecutionKind, ExecutionRequest, ExecutionResult,
    ProcessExecutor, SimulatedExecutor, SystemEnv,
};

pub use parse::{expand_short_flags, parse_command};

/// What the caller gets back for every command, accepted or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub id: String,
    /// The text as submitted.
    pub command: String,
    /// stdout followed by stderr.
    pub output: String,
    pub stdout: String,
    pub stderr: String,
    /// RFC 3339.
    pub timestamp: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    /// Rate-limit quota left in the current window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u32>,
}

impl CommandResponse {
    fn from_result(
        command: &str,
        result: &ExecutionResult,
        failure: Option<&DispatchError>,
        remaining: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            command: command.to_string(),
            output: result.combined_output(),
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            timestamp: Utc::now().to_rfc3339(),
            exit_code: result.exit_code,
            duration_ms: result.duration_ms,
            outcome: failure.map_or(Outcome::Success, DispatchError::outcome),
            reason: failure.map(DispatchError::client_message),
            suggestion: None,
            remaining: Some(remaining),
        }
    }

    /// A short-circuited request: error code and reason, no output.
    fn rejected(command: &str, err: &DispatchError, duration_ms: u64) -> Self {
        let (suggestion, remaining) = match err {
            DispatchError::PolicyRejected { suggestion, .. } => (suggestion.clone(), None),
            DispatchError::RateLimited { remaining, .. } => (None, Some(*remaining)),
            _ => (None, None),
        };
        Self {
            id: Uuid::new_v4().to_string(),
            command: command.to_string(),
            output: String::new(),
            stdout: String::new(),
            stderr: String::new(),
            timestamp: Utc::now().to_rfc3339(),
            exit_code: err.exit_code(),
            duration_ms,
            outcome: err.outcome(),
            reason: Some(err.client_message()),
            suggestion,
            remaining,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    /// Output if there is any, otherwise the rejection reason.
    pub fn display_text(&self) -> String {
        match (&self.reason, self.output.is_empty()) {
            (Some(reason), true) => match &self.suggestion {
                Some(suggestion) => format!("{reason} (did you mean '{suggestion}'?)"),
                None => reason.clone(),
            },
            _ => self.output.clone(),
        }
    }
}

/// Switches resolved once at startup.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Global real-execution switch. A command also needs `ExecMode::Real`.
    pub allow_real_execution: bool,
    pub exec_timeout: Duration,
    pub working_dir: Option<PathBuf>,
    pub block_suspicious_sessions: bool,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            allow_real_execution: false,
            exec_timeout: Duration::from_secs(30),
            working_dir: None,
            block_suspicious_sessions: true,
        }
    }
}

/// Everything the dispatcher owns, built explicitly by the caller.
pub struct DispatchContext {
    pub allowlist: Arc<Allowlist>,
    pub rate_limiter: RateLimiter,
    pub monitor: Arc<SecurityMonitor>,
    pub runner: Arc<dyn CommandRunner>,
    pub sessions: SessionRegistry,
    pub settings: DispatcherSettings,
}

impl DispatchContext {
    /// Build every component from configuration, with a real
    /// [`ProcessExecutor`] reading allowed variables from the host.
    pub fn from_config(config: &AppConfig) -> Self {
        let (allowlist, unknown) = Allowlist::builtin()
            .with_entries(config.extra_commands.iter().cloned())
            .with_real_execution(&config.execution.real_commands);
        for name in &unknown {
            warn!(command = %name, "Ignoring real_commands entry that is not in the allowlist");
        }
        let allowlist = Arc::new(allowlist);

        let runner = ProcessExecutor::new(Arc::clone(&allowlist), Arc::new(SystemEnv))
            .with_env_allowlist(config.execution.env_allowlist.clone())
            .with_max_output_bytes(config.execution.max_output_bytes)
            .with_default_cwd(config.execution.working_dir.clone());

        Self {
            allowlist,
            rate_limiter: RateLimiter::new(config.rate_limit.max_commands, config.rate_limit.window()),
            monitor: Arc::new(SecurityMonitor::new(config.monitor.clone())),
            runner: Arc::new(runner),
            sessions: SessionRegistry::new(config.session_idle_timeout(), config.history_capacity),
            settings: DispatcherSettings {
                allow_real_execution: config.execution.allow_real_execution,
                exec_timeout: config.execution.timeout(),
                working_dir: config.execution.working_dir.clone(),
                block_suspicious_sessions: config.block_suspicious_sessions,
            },
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }
}

pub struct SecureDispatcher {
    allowlist: Arc<Allowlist>,
    rate_limiter: RateLimiter,
    monitor: Arc<SecurityMonitor>,
    runner: Arc<dyn CommandRunner>,
    simulator: SimulatedExecutor,
    sessions: SessionRegistry,
    settings: DispatcherSettings,
}

impl SecureDispatcher {
    pub fn new(context: DispatchContext) -> Self {
        let simulator = SimulatedExecutor::new(&context.allowlist);
        info!(
            commands = context.allowlist.len(),
            allow_real = context.settings.allow_real_execution,
            "Dispatcher ready"
        );
        Self {
            allowlist: context.allowlist,
            rate_limiter: context.rate_limiter,
            monitor: context.monitor,
            runner: context.runner,
            simulator,
            sessions: context.sessions,
            settings: context.settings,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(DispatchContext::from_config(config))
    }

    pub fn allowlist(&self) -> &Allowlist {
        &self.allowlist
    }

    pub fn monitor(&self) -> &Arc<SecurityMonitor> {
        &self.monitor
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }

    /// Run one command for a session.
    pub async fn handle(&self, raw: &str, session_id: &str) -> CommandResponse {
        self.handle_with_cancel(raw, session_id, &CancellationToken::new())
            .await
    }

    /// Like [`handle`](Self::handle), but a real execution in flight is
    /// killed when `cancel` fires.
    pub async fn handle_with_cancel(
        &self,
        raw: &str,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> CommandResponse {
        let started = Instant::now();

        let handle = match self.sessions.acquire(session_id) {
            Ok(handle) => handle,
            Err(err) => return self.reject(raw, session_id, err, started),
        };
        let mut session = handle.lock().await;

        let response = match self.run_pipeline(raw, session_id, &mut session, cancel).await {
            Ok(response) => response,
            Err(err) => self.reject(raw, session_id, err, started),
        };

        session.record(CommandRecord::new(
            raw.trim(),
            &response.display_text(),
            response.exit_code,
        ));
        response
    }

    async fn run_pipeline(
        &self,
        raw: &str,
        session_id: &str,
        session: &mut SessionState,
        cancel: &CancellationToken,
    ) -> Result<CommandResponse, DispatchError> {
        self.gate_session(session_id)?;
        let sanitized = self.screen_input(raw, session_id)?;
        let remaining = self.count_rate(session_id)?;

        let Some((command, args)) = parse_command(&sanitized) else {
            return Err(DispatchError::InputRejected("empty command".to_string()));
        };
        let mode = self.check_policy(&command, &args, session_id)?;

        let request = ExecutionRequest {
            command,
            args,
            session_id: session_id.to_string(),
            original_text: raw.to_string(),
            timestamp: Utc::now(),
            allow_real: mode == ExecMode::Real && self.settings.allow_real_execution,
        };

        let result = if request.command == "history" {
            run_history(session, &request.args)
        } else {
            self.execute(&request, cancel).await
        };

        self.audit(&request, &result);
        let failure = execution_error(&result, self.settings.exec_timeout);
        Ok(CommandResponse::from_result(raw, &result, failure.as_ref(), remaining))
    }

    /// Stage 0.
    fn gate_session(&self, session_id: &str) -> Result<(), DispatchError> {
        if !self.settings.block_suspicious_sessions || !self.monitor.is_suspicious_session(session_id) {
            return Ok(());
        }
        self.monitor.log_event(
            event_types::BLOCKED_SESSION,
            Severity::Medium,
            session_id,
            details([("reason", "repeated high-severity events".to_string())]),
        );
        Err(DispatchError::PolicyRejected {
            reason: "session blocked after repeated suspicious activity".to_string(),
            suggestion: None,
        })
    }

    /// Stage 1.
    fn screen_input(&self, raw: &str, session_id: &str) -> Result<String, DispatchError> {
        screen(raw).inspect_err(|err| {
            self.monitor.log_event(
                event_types::INVALID_INPUT,
                Severity::Medium,
                session_id,
                details([
                    ("reason", err.to_string()),
                    ("input", preview(raw)),
                ]),
            );
        })
    }

    /// Stage 2. Returns the quota left after this command.
    fn count_rate(&self, session_id: &str) -> Result<u32, DispatchError> {
        let decision = self.rate_limiter.check(session_id)?;
        if decision.allowed {
            return Ok(decision.remaining);
        }
        self.monitor.log_event(
            event_types::RATE_LIMIT_VIOLATIONS,
            Severity::Medium,
            session_id,
            details([
                ("limit", self.rate_limiter.limit().to_string()),
                ("window_secs", self.rate_limiter.window().as_secs().to_string()),
            ]),
        );
        Err(DispatchError::RateLimited {
            remaining: decision.remaining,
            retry_after_secs: decision.retry_after.as_secs().max(1),
        })
    }

    /// Stage 4.
    fn check_policy(
        &self,
        command: &str,
        args: &[String],
        session_id: &str,
    ) -> Result<ExecMode, DispatchError> {
        match self.allowlist.check(command, args) {
            Ok(entry) => Ok(entry.mode),
            Err(err) => {
                let reason = err.to_string();
                if self.allowlist.is_known_command(command) {
                    // Known tool, bad argument: someone is probing.
                    self.monitor.log_event(
                        event_types::SUSPICIOUS_COMMANDS,
                        Severity::High,
                        session_id,
                        details([
                            ("command", command.to_string()),
                            ("args", args.join(" ")),
                            ("reason", reason),
                        ]),
                    );
                } else {
                    self.monitor.log_event(
                        event_types::COMMAND_REJECTED,
                        Severity::Medium,
                        session_id,
                        details([("command", command.to_string()), ("reason", reason)]),
                    );
                }
                Err(err)
            }
        }
    }

    /// Stage 5. The only place simulated and real execution diverge.
    async fn execute(&self, request: &ExecutionRequest, cancel: &CancellationToken) -> ExecutionResult {
        if !request.allow_real {
            debug!(command = %request.command, "Simulated execution");
            return self.simulator.execute(&request.command, &request.args);
        }

        info!(
            session_id = %request.session_id,
            command = %request.command,
            args = ?request.args,
            "Real execution"
        );
        let options = ExecOptions {
            cwd: self.settings.working_dir.clone(),
            timeout: self.settings.exec_timeout,
            ..ExecOptions::default()
        };
        self.runner
            .run(&request.command, &request.args, &options, cancel)
            .await
    }

    /// Stage 6.
    fn audit(&self, request: &ExecutionRequest, result: &ExecutionResult) {
        let (event_type, severity) = match result.kind {
            ExecutionKind::Exited if result.exit_code == 0 => {
                (event_types::COMMAND_EXECUTED, Severity::Low)
            }
            ExecutionKind::Exited => (event_types::EXECUTION_FAILED, Severity::Low),
            ExecutionKind::SpawnFailed => (event_types::EXECUTION_FAILED, Severity::Medium),
            ExecutionKind::TimedOut => (event_types::EXECUTION_TIMEOUT, Severity::Medium),
            ExecutionKind::Cancelled => (event_types::EXECUTION_CANCELLED, Severity::Low),
            // The executor disagreed with the dispatcher's own policy check.
            ExecutionKind::Refused => (event_types::INTERNAL_ERROR, Severity::Critical),
        };
        self.monitor.log_event(
            event_type,
            severity,
            &request.session_id,
            details([
                ("command", request.command.clone()),
                ("args", request.args.join(" ")),
                ("exit_code", result.exit_code.to_string()),
                ("duration_ms", result.duration_ms.to_string()),
                ("mode", if request.allow_real { "real" } else { "simulated" }.to_string()),
            ]),
        );
    }

    fn reject(
        &self,
        raw: &str,
        session_id: &str,
        err: DispatchError,
        started: Instant,
    ) -> CommandResponse {
        if let DispatchError::Internal(detail) = &err {
            error!(session_id, "Internal pipeline failure: {}", detail);
            self.monitor.log_event(
                event_types::INTERNAL_ERROR,
                Severity::Critical,
                session_id,
                details([("detail", detail.clone())]),
            );
        } else {
            debug!(session_id, exit_code = err.exit_code(), "Command rejected: {}", err);
        }
        let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        CommandResponse::rejected(raw, &err, elapsed)
    }
}

/// The failure an execution result represents, if any.
fn execution_error(result: &ExecutionResult, timeout: Duration) -> Option<DispatchError> {
    match result.kind {
        ExecutionKind::Exited if result.exit_code == 0 => None,
        ExecutionKind::Exited => Some(DispatchError::ExecutionFailure(format!(
            "exit code {}",
            result.exit_code
        ))),
        ExecutionKind::SpawnFailed => Some(DispatchError::ExecutionFailure(
            result.stderr.trim().to_string(),
        )),
        ExecutionKind::TimedOut => Some(DispatchError::ExecutionTimeout(
            u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        )),
        ExecutionKind::Cancelled => Some(DispatchError::Cancelled),
        ExecutionKind::Refused => Some(DispatchError::PolicyRejected {
            reason: result.stderr.trim().to_string(),
            suggestion: None,
        }),
    }
}

/// The `history` builtin reads the session transcript; nothing is executed.
fn run_history(session: &SessionState, args: &[String]) -> ExecutionResult {
    let count = match args.first() {
        None => session.log.len(),
        Some(arg) => match arg.parse::<usize>() {
            Ok(n) => n,
            Err(_) => {
                return ExecutionResult::exited(
                    "",
                    format!("history: {arg}: numeric argument required\n"),
                    EXIT_FAILURE,
                );
            }
        },
    };
    ExecutionResult::exited(session.log.render(count), "", 0)
}

/// First 100 characters of rejected input, for the audit log.
fn preview(raw: &str) -> String {
    raw.chars().take(100).collect()
}
