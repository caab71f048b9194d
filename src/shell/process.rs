//! Real subprocess execution with bounded lifetime and output.
//!
//! The command is re-checked against the allowlist before anything is
//! spawned, started from an explicit argv (never a shell string) with a
//! filtered environment, and raced against its timeout and the caller's
//! cancellation token. Whichever finishes first decides the result; a
//! losing process is killed together with its process group and reaped.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::env::{EnvProvider, build_restricted_env};
use super::{CommandRunner, ExecOptions, ExecutionKind, ExecutionResult};
use crate::error::{EXIT_CANCELLED, EXIT_FAILURE, EXIT_FORBIDDEN, EXIT_TIMEOUT};
use crate::security::{Allowlist, ExecMode};

/// Appended to stdout/stderr that hit the byte cap.
pub const TRUNCATION_MARKER: &str = "\n...(output truncated)...\n";

/// Default per-stream byte budget.
const DEFAULT_MAX_OUTPUT_BYTES: usize = 50 * 1024;
const READ_CHUNK: usize = 8192;
/// How long readers may keep draining pipes after the process is gone.
const READER_GRACE: Duration = Duration::from_millis(500);

/// Byte buffer that keeps at most `cap` bytes and remembers overflow.
#[derive(Debug)]
struct CappedBuffer {
    data: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl CappedBuffer {
    fn new(cap: usize) -> Self {
        Self {
            data: Vec::new(),
            cap,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let room = self.cap.saturating_sub(self.data.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.data.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    /// Decoded text. When the cap split a multi-byte character, the partial
    /// tail is dropped so the rendered body stays within `cap` bytes. Invalid
    /// bytes elsewhere still decode as U+FFFD.
    fn render(&self) -> String {
        let mut body = self.data.as_slice();
        if self.truncated {
            if let Err(e) = std::str::from_utf8(body) {
                if e.error_len().is_none() {
                    body = &body[..e.valid_up_to()];
                }
            }
        }
        let mut text = String::from_utf8_lossy(body).into_owned();
        if self.truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}

type SharedBuffer = Arc<Mutex<CappedBuffer>>;

/// Drain a pipe into a capped buffer. Reading continues past the cap so the
/// child never blocks on a full pipe.
fn spawn_reader<R>(mut pipe: R, buffer: SharedBuffer) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => match buffer.lock() {
                    Ok(mut buf) => buf.push(&chunk[..n]),
                    Err(e) => {
                        error!("Output buffer lock poisoned: {}", e);
                        break;
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("Pipe read error: {}", e);
                    break;
                }
            }
        }
    })
}

async fn finish_reader(handle: JoinHandle<()>) {
    let abort = handle.abort_handle();
    if tokio::time::timeout(READER_GRACE, handle).await.is_err() {
        // A grandchild may still hold the pipe open.
        abort.abort();
    }
}

fn render_shared(buffer: &SharedBuffer) -> (String, bool) {
    match buffer.lock() {
        Ok(buf) => (buf.render(), buf.truncated),
        Err(e) => {
            error!("Output buffer lock poisoned: {}", e);
            (String::new(), false)
        }
    }
}

fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    EXIT_FAILURE
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: killpg only sends a signal; the child was started with
    // process_group(0) so its pid is also its process group id.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(pid, "killpg failed: {}", std::io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

/// Kill the whole process group, then the child itself, and reap it.
async fn terminate(child: &mut Child, pid: Option<u32>, command: &str) {
    if let Some(pid) = pid {
        kill_process_group(pid);
    }
    if let Err(e) = child.kill().await {
        warn!(command, ?pid, "Failed to kill process: {}", e);
    }
}

enum Race {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Spawns allowlisted commands as real subprocesses.
pub struct ProcessExecutor {
    policy: Arc<Allowlist>,
    env_allowlist: Vec<String>,
    env_provider: Arc<dyn EnvProvider>,
    max_output_bytes: usize,
    default_cwd: Option<PathBuf>,
}

impl ProcessExecutor {
    pub fn new(policy: Arc<Allowlist>, env_provider: Arc<dyn EnvProvider>) -> Self {
        Self {
            policy,
            env_allowlist: super::DEFAULT_ENV_ALLOWLIST
                .iter()
                .map(|s| s.to_string())
                .collect(),
            env_provider,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            default_cwd: None,
        }
    }

    pub fn with_env_allowlist(mut self, names: Vec<String>) -> Self {
        self.env_allowlist = names;
        self
    }

    pub fn with_max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }

    pub fn with_default_cwd(mut self, cwd: Option<PathBuf>) -> Self {
        self.default_cwd = cwd;
        self
    }

    /// Re-validate against the allowlist. Only entries flagged for real
    /// execution may be spawned.
    fn preflight(&self, command: &str, args: &[String]) -> Result<(), String> {
        let Some(entry) = self.policy.get(command) else {
            return Err(format!("command '{command}' is not in allowlist"));
        };
        if entry.mode != ExecMode::Real {
            return Err(format!("command '{command}' is not enabled for real execution"));
        }
        let outcome = entry.validate_args(args);
        if outcome.accepted {
            Ok(())
        } else {
            Err(outcome
                .reason
                .unwrap_or_else(|| format!("invalid arguments for '{command}'")))
        }
    }

    pub async fn execute(
        &self,
        command: &str,
        args: &[String],
        options: &ExecOptions,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let started = Instant::now();

        if let Err(reason) = self.preflight(command, args) {
            warn!(command, "Process executor refused command: {}", reason);
            return ExecutionResult {
                kind: ExecutionKind::Refused,
                ..ExecutionResult::exited("", format!("refused: {reason}"), EXIT_FORBIDDEN)
            };
        }

        let env = build_restricted_env(&self.env_allowlist, self.env_provider.as_ref(), &options.env);

        let mut cmd = Command::new(command);
        cmd.args(args)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = options.cwd.as_ref().or(self.default_cwd.as_ref()) {
            cmd.current_dir(cwd);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(command, "Failed to spawn process: {}", e);
                return ExecutionResult {
                    kind: ExecutionKind::SpawnFailed,
                    duration_ms: elapsed_ms(started),
                    ..ExecutionResult::exited("", format!("{command}: {e}"), EXIT_FAILURE)
                };
            }
        };
        let pid = child.id();
        info!(command, ?pid, timeout_ms = options.timeout.as_millis() as u64, "Spawned process");

        let stdout_buf: SharedBuffer = Arc::new(Mutex::new(CappedBuffer::new(self.max_output_bytes)));
        let stderr_buf: SharedBuffer = Arc::new(Mutex::new(CappedBuffer::new(self.max_output_bytes)));
        let mut readers = Vec::with_capacity(2);
        if let Some(pipe) = child.stdout.take() {
            readers.push(spawn_reader(pipe, stdout_buf.clone()));
        }
        if let Some(pipe) = child.stderr.take() {
            readers.push(spawn_reader(pipe, stderr_buf.clone()));
        }

        let race = tokio::select! {
            status = child.wait() => Race::Exited(status),
            _ = tokio::time::sleep(options.timeout) => Race::TimedOut,
            _ = cancel.cancelled() => Race::Cancelled,
        };

        let (kind, exit_code) = match race {
            Race::Exited(Ok(status)) => (ExecutionKind::Exited, exit_code_of(status)),
            Race::Exited(Err(e)) => {
                error!(command, "Failed to wait for process: {}", e);
                (ExecutionKind::Exited, EXIT_FAILURE)
            }
            Race::TimedOut => {
                terminate(&mut child, pid, command).await;
                warn!(command, ?pid, "Process timed out and was killed");
                (ExecutionKind::TimedOut, EXIT_TIMEOUT)
            }
            Race::Cancelled => {
                terminate(&mut child, pid, command).await;
                info!(command, ?pid, "Process cancelled and was killed");
                (ExecutionKind::Cancelled, EXIT_CANCELLED)
            }
        };

        for reader in readers {
            finish_reader(reader).await;
        }

        let (stdout, stdout_truncated) = render_shared(&stdout_buf);
        let (mut stderr, stderr_truncated) = render_shared(&stderr_buf);
        match kind {
            ExecutionKind::TimedOut => push_line(
                &mut stderr,
                &format!("command timed out after {}ms", options.timeout.as_millis()),
            ),
            ExecutionKind::Cancelled => push_line(&mut stderr, "command cancelled"),
            _ => {}
        }

        ExecutionResult {
            stdout,
            stderr,
            exit_code,
            duration_ms: elapsed_ms(started),
            kind,
            truncated: stdout_truncated || stderr_truncated,
            pid,
        }
    }
}

#[async_trait]
impl CommandRunner for ProcessExecutor {
    async fn run(
        &self,
        command: &str,
        args: &[String],
        options: &ExecOptions,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        self.execute(command, args, options, cancel).await
    }
}

fn push_line(text: &mut String, line: &str) {
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    text.push_str(line);
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
