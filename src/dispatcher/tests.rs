use std::sync::Mutex;

use async_trait::async_trait;

use super::*;
use crate::error::{EXIT_CANCELLED, EXIT_FORBIDDEN, EXIT_INVALID_INPUT, EXIT_RATE_LIMITED};
use crate::security::{MonitorConfig, SecurityEvent};
use crate::session::DEFAULT_IDLE_TIMEOUT;

/// Records every call and answers with a fixed result.
struct SpyRunner {
    calls: Mutex<Vec<(String, Vec<String>)>>,
    result: ExecutionResult,
}

impl SpyRunner {
    fn new() -> Self {
        Self::returning(ExecutionResult::exited("real output\n", "", 0))
    }

    fn returning(result: ExecutionResult) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            result,
        }
    }

    fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for SpyRunner {
    async fn run(
        &self,
        command: &str,
        args: &[String],
        _options: &ExecOptions,
        _cancel: &CancellationToken,
    ) -> ExecutionResult {
        self.calls
            .lock()
            .unwrap()
            .push((command.to_string(), args.to_vec()));
        self.result.clone()
    }
}

/// Blocks until cancelled, then reports a cancelled execution.
struct HangingRunner;

#[async_trait]
impl CommandRunner for HangingRunner {
    async fn run(
        &self,
        _command: &str,
        _args: &[String],
        _options: &ExecOptions,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        cancel.cancelled().await;
        ExecutionResult {
            kind: ExecutionKind::Cancelled,
            ..ExecutionResult::exited("partial\n", "cancelled\n", EXIT_CANCELLED)
        }
    }
}

struct Setup {
    limit: u32,
    real_commands: Vec<&'static str>,
    allow_real: bool,
    block_suspicious: bool,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            limit: 100,
            real_commands: Vec::new(),
            allow_real: false,
            block_suspicious: true,
        }
    }
}

impl Setup {
    fn build(self, runner: Arc<dyn CommandRunner>) -> SecureDispatcher {
        let names: Vec<String> = self.real_commands.iter().map(|s| s.to_string()).collect();
        let (allowlist, unknown) = Allowlist::builtin().with_real_execution(&names);
        assert!(unknown.is_empty());

        SecureDispatcher::new(DispatchContext {
            allowlist: Arc::new(allowlist),
            rate_limiter: RateLimiter::new(self.limit, Duration::from_secs(60)),
            monitor: Arc::new(SecurityMonitor::new(MonitorConfig::default())),
            runner,
            sessions: SessionRegistry::new(DEFAULT_IDLE_TIMEOUT, 50),
            settings: DispatcherSettings {
                allow_real_execution: self.allow_real,
                exec_timeout: Duration::from_secs(5),
                working_dir: None,
                block_suspicious_sessions: self.block_suspicious,
            },
        })
    }
}

fn simulated() -> (SecureDispatcher, Arc<SpyRunner>) {
    let spy = Arc::new(SpyRunner::new());
    (Setup::default().build(spy.clone()), spy)
}

fn events_of(dispatcher: &SecureDispatcher, session: &str, event_type: &str) -> Vec<SecurityEvent> {
    dispatcher
        .monitor()
        .events_for_session(session)
        .into_iter()
        .filter(|e| e.event_type == event_type)
        .collect()
}

#[tokio::test]
async fn test_cargo_build_release_accepted() {
    let (dispatcher, spy) = simulated();

    let response = dispatcher.handle("cargo build --release", "s1").await;

    assert_eq!(response.exit_code, 0);
    assert_eq!(response.outcome, Outcome::Success);
    assert!(response.output.contains("Compiling project"));
    assert_eq!(response.command, "cargo build --release");
    assert!(response.reason.is_none());
    assert!(spy.calls().is_empty());
    assert_eq!(events_of(&dispatcher, "s1", event_types::COMMAND_EXECUTED).len(), 1);
}

#[tokio::test]
async fn test_rm_rf_rejected_at_screen() {
    let (dispatcher, spy) = simulated();

    let response = dispatcher.handle("rm -rf /", "s1").await;

    assert_eq!(response.exit_code, EXIT_INVALID_INPUT);
    assert_eq!(response.outcome, Outcome::InvalidInput);
    assert!(response.reason.as_deref().unwrap_or_default().contains("rm -rf"));
    assert!(response.output.is_empty());
    assert!(spy.calls().is_empty());

    let events = dispatcher.monitor().events_for_session("s1");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, event_types::INVALID_INPUT);
    assert!(events[0].severity >= Severity::Medium);
}

#[tokio::test]
async fn test_quoted_dangerous_patterns_rejected_at_screen() {
    let (dispatcher, spy) = simulated();

    let cases = [
        ("s'u'do ls", "sudo"),
        ("r\"m\" -rf /", "rm -rf"),
        ("echo su\"do\"", "sudo"),
    ];
    for (input, pattern) in cases {
        let response = dispatcher.handle(input, "s1").await;
        assert_eq!(response.exit_code, EXIT_INVALID_INPUT, "{input}");
        assert!(
            response.reason.as_deref().unwrap_or_default().contains(pattern),
            "{input}: {:?}",
            response.reason
        );
    }
    assert!(spy.calls().is_empty());
    assert_eq!(events_of(&dispatcher, "s1", event_types::INVALID_INPUT).len(), 3);
    assert!(events_of(&dispatcher, "s1", event_types::COMMAND_REJECTED).is_empty());
}

#[tokio::test]
async fn test_eleventh_command_rate_limited() {
    let spy = Arc::new(SpyRunner::new());
    let dispatcher = Setup {
        limit: 10,
        ..Setup::default()
    }
    .build(spy);

    for i in 0..10 {
        let response = dispatcher.handle("pwd", "s1").await;
        assert_eq!(response.exit_code, 0, "command {i} should pass");
        assert_eq!(response.remaining, Some(9 - i));
    }

    let response = dispatcher.handle("pwd", "s1").await;
    assert_eq!(response.exit_code, EXIT_RATE_LIMITED);
    assert_eq!(response.outcome, Outcome::RateLimited);
    assert_eq!(response.remaining, Some(0));
    assert_eq!(
        events_of(&dispatcher, "s1", event_types::RATE_LIMIT_VIOLATIONS).len(),
        1
    );

    // Another session has its own quota.
    assert_eq!(dispatcher.handle("pwd", "s2").await.exit_code, 0);
}

#[tokio::test]
async fn test_which_curl_rejected_without_execution() {
    let spy = Arc::new(SpyRunner::new());
    let dispatcher = Setup {
        real_commands: vec!["which"],
        allow_real: true,
        ..Setup::default()
    }
    .build(spy.clone());

    let response = dispatcher.handle("which curl", "s1").await;

    assert_eq!(response.exit_code, EXIT_FORBIDDEN);
    assert!(response.reason.as_deref().unwrap_or_default().contains("invalid argument"));
    assert!(spy.calls().is_empty());
    let events = events_of(&dispatcher, "s1", event_types::SUSPICIOUS_COMMANDS);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].severity, Severity::High);
}

#[tokio::test]
async fn test_unknown_command_gets_suggestion() {
    let (dispatcher, spy) = simulated();

    let response = dispatcher.handle("carg build", "s1").await;

    assert_eq!(response.exit_code, EXIT_FORBIDDEN);
    assert_eq!(response.suggestion.as_deref(), Some("cargo"));
    assert!(response.reason.as_deref().unwrap_or_default().contains("not in allowlist"));
    assert!(response.display_text().contains("did you mean 'cargo'"));
    assert!(spy.calls().is_empty());
    assert_eq!(events_of(&dispatcher, "s1", event_types::COMMAND_REJECTED).len(), 1);
}

#[tokio::test]
async fn test_unknown_command_never_reaches_runner() {
    let spy = Arc::new(SpyRunner::new());
    let dispatcher = Setup {
        real_commands: vec!["ls", "cat", "echo"],
        allow_real: true,
        ..Setup::default()
    }
    .build(spy.clone());

    for input in ["curl example.com", "python3 -V", "wget file", "bash", "nc -l 8080"] {
        let response = dispatcher.handle(input, "s1").await;
        assert_eq!(response.exit_code, EXIT_FORBIDDEN, "{input}");
    }
    assert!(spy.calls().is_empty());
}

#[tokio::test]
async fn test_chaining_rejected() {
    let (dispatcher, spy) = simulated();

    for input in ["ls && whoami", "ls; pwd", "echo `id`", "echo $(id)", "cat ../secret"] {
        let response = dispatcher.handle(input, "s1").await;
        assert_eq!(response.exit_code, EXIT_INVALID_INPUT, "{input}");
    }
    assert!(spy.calls().is_empty());
}

#[tokio::test]
async fn test_simulated_output_deterministic() {
    let (dispatcher, _) = simulated();

    let first = dispatcher.handle("git log --oneline", "s1").await;
    let second = dispatcher.handle("git log --oneline", "s2").await;

    assert_eq!(first.output, second.output);
    assert_eq!(first.exit_code, second.exit_code);
    assert_ne!(first.id, second.id);
}

#[tokio::test]
async fn test_combined_flags_expanded_before_policy() {
    let (dispatcher, _) = simulated();

    let response = dispatcher.handle("ls -la", "s1").await;

    assert_eq!(response.exit_code, 0);
    assert!(response.output.contains(".gitignore"));
    assert!(response.output.starts_with("total"));
}

#[tokio::test]
async fn test_real_execution_needs_both_switches() {
    // Flagged real, but the global switch is off.
    let spy = Arc::new(SpyRunner::new());
    let dispatcher = Setup {
        real_commands: vec!["echo"],
        allow_real: false,
        ..Setup::default()
    }
    .build(spy.clone());
    let response = dispatcher.handle("echo hi", "s1").await;
    assert_eq!(response.output, "hi\n");
    assert!(spy.calls().is_empty());

    // Global switch on, but the command is not flagged.
    let spy = Arc::new(SpyRunner::new());
    let dispatcher = Setup {
        allow_real: true,
        ..Setup::default()
    }
    .build(spy.clone());
    dispatcher.handle("echo hi", "s1").await;
    assert!(spy.calls().is_empty());

    // Both on.
    let spy = Arc::new(SpyRunner::new());
    let dispatcher = Setup {
        real_commands: vec!["echo"],
        allow_real: true,
        ..Setup::default()
    }
    .build(spy.clone());
    let response = dispatcher.handle("echo hi there", "s1").await;
    assert_eq!(response.output, "real output\n");
    assert_eq!(
        spy.calls(),
        vec![("echo".to_string(), vec!["hi".to_string(), "there".to_string()])]
    );
}

#[tokio::test]
async fn test_real_timeout_reported() {
    let spy = Arc::new(SpyRunner::returning(ExecutionResult {
        kind: ExecutionKind::TimedOut,
        ..ExecutionResult::exited("partial\n", "timed out\n", 124)
    }));
    let dispatcher = Setup {
        real_commands: vec!["cargo"],
        allow_real: true,
        ..Setup::default()
    }
    .build(spy);

    let response = dispatcher.handle("cargo test", "s1").await;

    assert_eq!(response.exit_code, 124);
    assert_eq!(response.outcome, Outcome::Timeout);
    assert!(response.stdout.contains("partial"));
    assert!(
        response.reason.as_deref().unwrap_or_default().contains("timed out after"),
        "{:?}",
        response.reason
    );
    assert_eq!(events_of(&dispatcher, "s1", event_types::EXECUTION_TIMEOUT).len(), 1);
}

#[tokio::test]
async fn test_cancel_real_execution() {
    let dispatcher = Arc::new(
        Setup {
            real_commands: vec!["cargo"],
            allow_real: true,
            ..Setup::default()
        }
        .build(Arc::new(HangingRunner)),
    );
    let cancel = CancellationToken::new();

    let task = {
        let dispatcher = Arc::clone(&dispatcher);
        let cancel = cancel.clone();
        tokio::spawn(async move { dispatcher.handle_with_cancel("cargo build", "s1", &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let response = task.await.unwrap();
    assert_eq!(response.exit_code, EXIT_CANCELLED);
    assert_eq!(response.outcome, Outcome::Cancelled);
    assert_eq!(response.reason.as_deref(), Some("execution cancelled"));
    assert_eq!(
        events_of(&dispatcher, "s1", event_types::EXECUTION_CANCELLED).len(),
        1
    );
}

#[tokio::test]
async fn test_spawn_failure_reported_as_execution_failure() {
    let spy = Arc::new(SpyRunner::returning(ExecutionResult {
        kind: ExecutionKind::SpawnFailed,
        ..ExecutionResult::exited("", "cargo: No such file or directory\n", 1)
    }));
    let dispatcher = Setup {
        real_commands: vec!["cargo"],
        allow_real: true,
        ..Setup::default()
    }
    .build(spy);

    let response = dispatcher.handle("cargo build", "s1").await;

    assert_eq!(response.exit_code, 1);
    assert_eq!(response.outcome, Outcome::Failed);
    assert_eq!(
        response.reason.as_deref(),
        Some("execution failed: cargo: No such file or directory")
    );
    assert_eq!(events_of(&dispatcher, "s1", event_types::EXECUTION_FAILED).len(), 1);
}

#[tokio::test]
async fn test_suspicious_session_blocked() {
    let (dispatcher, _) = simulated();

    // Three disallowed arguments on known tools are high severity.
    for input in ["which curl", "git push", "cargo install ripgrep"] {
        assert_eq!(dispatcher.handle(input, "bad").await.exit_code, EXIT_FORBIDDEN);
    }
    assert!(dispatcher.monitor().is_suspicious_session("bad"));

    let response = dispatcher.handle("pwd", "bad").await;
    assert_eq!(response.exit_code, EXIT_FORBIDDEN);
    assert!(response.reason.as_deref().unwrap_or_default().contains("blocked"));
    assert_eq!(events_of(&dispatcher, "bad", event_types::BLOCKED_SESSION).len(), 1);

    // Other sessions are unaffected.
    assert_eq!(dispatcher.handle("pwd", "good").await.exit_code, 0);
}

#[tokio::test]
async fn test_suspicious_session_allowed_when_gate_off() {
    let dispatcher = Setup {
        block_suspicious: false,
        ..Setup::default()
    }
    .build(Arc::new(SpyRunner::new()));

    for input in ["which curl", "git push", "cargo install ripgrep"] {
        dispatcher.handle(input, "bad").await;
    }
    assert!(dispatcher.monitor().is_suspicious_session("bad"));
    assert_eq!(dispatcher.handle("pwd", "bad").await.exit_code, 0);
}

#[tokio::test]
async fn test_history_builtin() {
    let (dispatcher, _) = simulated();

    dispatcher.handle("pwd", "s1").await;
    dispatcher.handle("whoami", "s1").await;
    dispatcher.handle("sudo ls", "s1").await;

    let response = dispatcher.handle("history", "s1").await;
    assert_eq!(response.output, "    1  pwd\n    2  whoami\n    3  sudo ls\n");

    let response = dispatcher.handle("history 1", "s1").await;
    assert_eq!(response.output, "    4  history\n");

    let response = dispatcher.handle("history abc", "s1").await;
    assert_eq!(response.exit_code, 1);
    assert_eq!(response.outcome, Outcome::Failed);
    assert_eq!(response.reason.as_deref(), Some("execution failed: exit code 1"));

    let records = dispatcher.sessions().history("s1", 10).await.unwrap();
    assert_eq!(records.len(), 6);
    assert_eq!(records[2].exit_code, EXIT_INVALID_INPUT);
}

#[tokio::test]
async fn test_history_stores_printable_command_lines() {
    let (dispatcher, _) = simulated();

    dispatcher.handle("pwd\x1b[31m", "s1").await;
    dispatcher.handle("who\x07ami\r\n", "s1").await;

    let response = dispatcher.handle("history", "s1").await;
    assert_eq!(response.output, "    1  pwd\n    2  whoami\n");

    let records = dispatcher.sessions().history("s1", 10).await.unwrap();
    assert!(records.iter().all(|r| !r.command_line.chars().any(char::is_control)));
}

#[tokio::test]
async fn test_response_serialization() {
    let (dispatcher, _) = simulated();

    let response = dispatcher.handle("whoami", "s1").await;
    let json = serde_json::to_value(&response).unwrap();

    assert_eq!(json["exitCode"], 0);
    assert_eq!(json["command"], "whoami");
    assert_eq!(json["output"], "user\n");
    assert_eq!(json["outcome"], "success");
    assert!(json["durationMs"].is_u64());
    assert!(json.get("reason").is_none());
    assert!(chrono::DateTime::parse_from_rfc3339(json["timestamp"].as_str().unwrap()).is_ok());
    assert!(Uuid::parse_str(json["id"].as_str().unwrap()).is_ok());
}

#[tokio::test]
async fn test_homoglyph_sudo_rejected() {
    let (dispatcher, _) = simulated();

    let response = dispatcher.handle("ｓｕｄｏ ls", "s1").await;

    assert_eq!(response.exit_code, EXIT_INVALID_INPUT);
    assert!(response.reason.as_deref().unwrap_or_default().contains("sudo"));
}

#[tokio::test]
async fn test_concurrent_sessions_counted_exactly() {
    let spy = Arc::new(SpyRunner::new());
    let dispatcher = Arc::new(
        Setup {
            limit: 5,
            ..Setup::default()
        }
        .build(spy),
    );

    let mut tasks = Vec::new();
    for session in ["a", "b", "c"] {
        for _ in 0..8 {
            let dispatcher = Arc::clone(&dispatcher);
            tasks.push(tokio::spawn(async move {
                (session, dispatcher.handle("pwd", session).await.exit_code)
            }));
        }
    }

    let mut accepted = std::collections::HashMap::new();
    for task in tasks {
        let (session, code) = task.await.unwrap();
        if code == 0 {
            *accepted.entry(session).or_insert(0) += 1;
        }
    }
    for session in ["a", "b", "c"] {
        assert_eq!(accepted.get(session), Some(&5), "session {session}");
    }
}

#[tokio::test]
async fn test_executor_refusal_is_audited_as_internal() {
    let spy = Arc::new(SpyRunner::returning(ExecutionResult {
        kind: ExecutionKind::Refused,
        ..ExecutionResult::exited("", "refused: not enabled\n", EXIT_FORBIDDEN)
    }));
    let dispatcher = Setup {
        real_commands: vec!["pwd"],
        allow_real: true,
        ..Setup::default()
    }
    .build(spy);

    let response = dispatcher.handle("pwd", "s1").await;

    assert_eq!(response.outcome, Outcome::Forbidden);
    let events = events_of(&dispatcher, "s1", event_types::INTERNAL_ERROR);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].severity, Severity::Critical);
}
