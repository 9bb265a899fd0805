//! Execution bridge to the external statistical runtime.
//!
//! Every tool call runs in a fresh subprocess:
//!
//! ```text
//! <command> <args…> <script-path>      (cwd = script library)
//!   stdin  ← {"tool": "...", "arguments": {...}}\n
//!   stdout → optional formatted text, then one JSON object on the last line
//!   stderr → diagnostics only
//! ```
//!
//! The bridge enforces the per-call timeout, honours cancellation, caps both
//! output streams, and always reaps the child: on the normal path `wait()`
//! reaps it, on the timeout and cancellation paths it is killed first.
//!
//! On Unix each child leads its own process group. Once the child exits or is
//! abandoned the whole group is sent `SIGKILL`, so processes the runtime
//! forked do not outlive the call.
//! [`ProcessStats`] counts spawns and reaps so callers can check that the two
//! always match.

pub mod cache;
pub mod diagnostics;
pub mod scripts;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinHandle};

use crate::config::RuntimeConfig;
use crate::error::{ExecutionFailure, McpError};
use crate::mcp::context::CancelSignal;

pub use cache::ResultCache;
pub use scripts::{Script, ScriptLibrary, ScriptSource};

/// How long to wait for the output pipes to close after the child exits.
const PIPE_DRAIN: Duration = Duration::from_secs(2);

/// Characters of stderr kept in a process failure.
const STDERR_EXCERPT_CHARS: usize = 2000;

/// Characters of stdout kept in a malformed output failure.
const RAW_EXCERPT_CHARS: usize = 1000;

/// A successful runtime result.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptOutput {
    /// The JSON object printed on the last line of stdout.
    pub payload: Value,
    /// Human-readable text printed before the payload, if any.
    pub formatted: Option<String>,
}

/// The classified result of one execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// Zero exit with a valid payload.
    Success(ScriptOutput),
    /// Non-zero exit with an R diagnostic on stderr.
    ScriptError {
        /// One-line error message.
        message: String,
        /// Diagnostic text without call traces.
        diagnostic: String,
    },
    /// The call exceeded its time budget and was killed.
    Timeout {
        /// The budget that was exceeded.
        after: Duration,
    },
    /// The call was cancelled and the child killed.
    Cancelled,
    /// Zero exit but the last stdout line is not a JSON object.
    MalformedOutput {
        /// Excerpt of stdout.
        raw: String,
    },
    /// Launch failure, signal, or non-zero exit without a diagnostic.
    ProcessFailure {
        /// Exit code, `None` for a signal or launch failure.
        exit_code: Option<i32>,
        /// Tail of stderr, or the launch error.
        stderr_excerpt: String,
    },
}

impl ExecutionOutcome {
    /// Converts the outcome into the payload or the error reported to clients.
    ///
    /// # Errors
    ///
    /// Returns the [`McpError`] matching every non-success outcome.
    pub fn into_result(self, tool: &str) -> Result<ScriptOutput, McpError> {
        match self {
            Self::Success(output) => Ok(output),
            Self::ScriptError {
                message,
                diagnostic,
            } => Err(McpError::ToolExecution {
                kind: ExecutionFailure::Script,
                message,
                diagnostic: Some(diagnostic),
            }),
            Self::Timeout { after } => Err(McpError::ToolTimeout {
                tool: tool.to_string(),
                after,
            }),
            Self::Cancelled => Err(McpError::Cancelled),
            Self::MalformedOutput { raw } => Err(McpError::ToolExecution {
                kind: ExecutionFailure::MalformedOutput,
                message: "runtime output did not end with a JSON object".to_string(),
                diagnostic: (!raw.is_empty()).then_some(raw),
            }),
            Self::ProcessFailure {
                exit_code,
                stderr_excerpt,
            } => Err(McpError::ToolExecution {
                kind: ExecutionFailure::Process,
                message: exit_code.map_or_else(
                    || "runtime did not exit normally".to_string(),
                    |code| format!("runtime exited with status {code}"),
                ),
                diagnostic: (!stderr_excerpt.is_empty()).then_some(stderr_excerpt),
            }),
        }
    }
}

/// Spawn and reap counters.
#[derive(Debug, Default)]
pub struct ProcessStats {
    spawned: AtomicU64,
    reaped: AtomicU64,
}

impl ProcessStats {
    fn record_spawn(&self) {
        self.spawned.fetch_add(1, Ordering::SeqCst);
    }

    fn record_reap(&self) {
        self.reaped.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of subprocesses spawned.
    #[must_use]
    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Number of subprocesses reaped.
    #[must_use]
    pub fn reaped(&self) -> u64 {
        self.reaped.load(Ordering::SeqCst)
    }

    /// Subprocesses spawned but not yet reaped.
    #[must_use]
    pub fn live(&self) -> u64 {
        self.spawned().saturating_sub(self.reaped())
    }
}

/// One call to run.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Tool name, forwarded to the script.
    pub tool: String,
    /// Script library entry to run.
    pub script: String,
    /// Validated arguments, forwarded to the script.
    pub arguments: Value,
}

/// How a running child stopped.
enum Exit {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Runs scripts in the external runtime.
#[derive(Debug)]
pub struct ExecutionBridge {
    command: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    max_output_bytes: usize,
    scripts: ScriptLibrary,
    cache: Option<ResultCache>,
    slots: Semaphore,
    stats: Arc<ProcessStats>,
}

impl ExecutionBridge {
    /// Creates a bridge for `runtime` over a materialised script library.
    #[must_use]
    pub fn new(
        runtime: &RuntimeConfig,
        scripts: ScriptLibrary,
        cache: Option<ResultCache>,
    ) -> Self {
        Self {
            command: runtime.command.clone(),
            args: runtime.args.clone(),
            timeout: runtime.timeout(),
            max_output_bytes: runtime.max_output_bytes,
            scripts,
            cache,
            slots: Semaphore::new(runtime.max_concurrent.max(1)),
            stats: Arc::new(ProcessStats::default()),
        }
    }

    /// The runtime executable.
    #[must_use]
    pub fn command(&self) -> &Path {
        &self.command
    }

    /// The per-call timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The script library.
    #[must_use]
    pub const fn scripts(&self) -> &ScriptLibrary {
        &self.scripts
    }

    /// Whether results are cached.
    #[must_use]
    pub const fn caches_results(&self) -> bool {
        self.cache.is_some()
    }

    /// Shared spawn and reap counters.
    #[must_use]
    pub fn stats(&self) -> Arc<ProcessStats> {
        Arc::clone(&self.stats)
    }

    /// Closes the bridge: queued calls fail instead of spawning.
    pub fn close(&self) {
        self.slots.close();
    }

    /// Runs one call to completion, timeout or cancellation.
    ///
    /// Never panics and never leaves a child behind: every spawned process
    /// has been reaped by the time this returns.
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: &CancelSignal,
    ) -> ExecutionOutcome {
        let Some(script) = self.scripts.get(&request.script) else {
            return ExecutionOutcome::ProcessFailure {
                exit_code: None,
                stderr_excerpt: format!("no script named '{}' in the library", request.script),
            };
        };

        let fingerprint = self
            .cache
            .as_ref()
            .map(|_| ResultCache::fingerprint(&request.tool, &script.digest, &request.arguments));
        if let (Some(cache), Some(fingerprint)) = (&self.cache, &fingerprint) {
            if let Some(output) = cache.load(fingerprint).await {
                tracing::debug!(tool = %request.tool, "Result cache hit");
                return ExecutionOutcome::Success(output);
            }
        }

        let _permit = tokio::select! {
            permit = self.slots.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    return ExecutionOutcome::ProcessFailure {
                        exit_code: None,
                        stderr_excerpt: "execution bridge is shut down".to_string(),
                    };
                }
            },
            () = cancel.cancelled() => return ExecutionOutcome::Cancelled,
        };

        let outcome = self.run(script, request, cancel).await;

        if let (ExecutionOutcome::Success(output), Some(cache), Some(fingerprint)) =
            (&outcome, &self.cache, &fingerprint)
        {
            cache.store(fingerprint, &request.tool, output).await;
        }

        outcome
    }

    async fn run(
        &self,
        script: &Script,
        request: &ExecutionRequest,
        cancel: &CancelSignal,
    ) -> ExecutionOutcome {
        let mut input = json!({ "tool": request.tool, "arguments": request.arguments }).to_string();
        input.push('\n');

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .arg(&script.path)
            .current_dir(self.scripts.dir())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(command = %self.command.display(), error = %e, "Failed to launch runtime");
                return ExecutionOutcome::ProcessFailure {
                    exit_code: None,
                    stderr_excerpt: format!("failed to launch {}: {e}", self.command.display()),
                };
            }
        };
        self.stats.record_spawn();
        let mut group = ProcessGroup::led_by(&child);
        tracing::debug!(tool = %request.tool, pid = ?child.id(), "Spawned runtime");

        let stdin_task = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                // The child may exit without reading its input.
                let _ = stdin.write_all(input.as_bytes()).await;
                let _ = stdin.shutdown().await;
            })
        });
        let stdout_task = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(read_capped(stdout, self.max_output_bytes)));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_capped(stderr, self.max_output_bytes)));

        let readers: Vec<AbortHandle> = stdin_task
            .iter()
            .map(JoinHandle::abort_handle)
            .chain(stdout_task.iter().map(JoinHandle::abort_handle))
            .chain(stderr_task.iter().map(JoinHandle::abort_handle))
            .collect();

        let exit = tokio::select! {
            status = child.wait() => Exit::Exited(status),
            () = tokio::time::sleep(self.timeout) => Exit::TimedOut,
            () = cancel.cancelled() => Exit::Cancelled,
        };

        let status = match exit {
            Exit::Exited(Ok(status)) => {
                self.stats.record_reap();
                group.kill();
                status
            }
            Exit::Exited(Err(e)) => {
                tracing::warn!(tool = %request.tool, error = %e, "Failed to wait for runtime");
                self.kill_and_reap(&mut child, &mut group).await;
                abort_all(&readers);
                return ExecutionOutcome::ProcessFailure {
                    exit_code: None,
                    stderr_excerpt: e.to_string(),
                };
            }
            Exit::TimedOut => {
                tracing::warn!(tool = %request.tool, timeout = ?self.timeout, "Runtime timed out; killing");
                self.kill_and_reap(&mut child, &mut group).await;
                abort_all(&readers);
                return ExecutionOutcome::Timeout {
                    after: self.timeout,
                };
            }
            Exit::Cancelled => {
                tracing::info!(tool = %request.tool, "Runtime cancelled; killing");
                self.kill_and_reap(&mut child, &mut group).await;
                abort_all(&readers);
                return ExecutionOutcome::Cancelled;
            }
        };

        if let Some(task) = stdin_task {
            task.abort();
        }
        let stdout = collect(stdout_task).await;
        let stderr = collect(stderr_task).await;

        tracing::debug!(
            tool = %request.tool,
            code = ?status.code(),
            stdout_bytes = stdout.len(),
            stderr_bytes = stderr.len(),
            "Runtime exited"
        );

        classify(status.code(), &stdout, &stderr)
    }

    async fn kill_and_reap(&self, child: &mut Child, group: &mut ProcessGroup) {
        group.kill();
        if let Err(e) = child.start_kill() {
            tracing::debug!(error = %e, "Kill failed; child already exited");
        }
        match child.wait().await {
            Ok(status) => tracing::debug!(?status, "Reaped runtime"),
            Err(e) => tracing::warn!(error = %e, "Failed to reap runtime"),
        }
        self.stats.record_reap();
    }
}

/// The process group a runtime child leads.
///
/// Killed at most once; dropping it kills whatever is still running, which
/// covers a call whose future is dropped mid-flight.
struct ProcessGroup {
    leader: Option<u32>,
}

impl ProcessGroup {
    fn led_by(child: &Child) -> Self {
        Self { leader: child.id() }
    }

    #[cfg(unix)]
    fn kill(&mut self) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(leader) = self.leader.take() else {
            return;
        };
        let Ok(pgid) = i32::try_from(leader) else {
            return;
        };
        match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
            Ok(()) => tracing::debug!(pgid, "Killed runtime process group"),
            // ESRCH: nothing left in the group.
            Err(e) => tracing::trace!(pgid, error = %e, "Process group already gone"),
        }
    }

    #[cfg(not(unix))]
    fn kill(&mut self) {
        self.leader = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

fn abort_all(readers: &[AbortHandle]) {
    for reader in readers {
        reader.abort();
    }
}

/// Reads a stream to the end, keeping at most `limit` bytes.
///
/// Reading continues past the limit so the child never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> Vec<u8> {
    let mut kept = Vec::new();
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = limit.saturating_sub(kept.len());
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    kept
}

/// Waits briefly for a reader task, giving up if the pipe stays open.
async fn collect(task: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    let Some(task) = task else {
        return Vec::new();
    };
    let abort = task.abort_handle();
    match tokio::time::timeout(PIPE_DRAIN, task).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(_)) => Vec::new(),
        Err(_) => {
            abort.abort();
            Vec::new()
        }
    }
}

/// Classifies a finished child from its exit code and captured output.
///
/// `exit_code` is `None` when the child was terminated by a signal.
#[must_use]
pub fn classify(exit_code: Option<i32>, stdout: &[u8], stderr: &[u8]) -> ExecutionOutcome {
    let stdout = String::from_utf8_lossy(stdout);
    let stderr = String::from_utf8_lossy(stderr);

    if exit_code == Some(0) {
        return parse_stdout(&stdout).map_or_else(
            || ExecutionOutcome::MalformedOutput {
                raw: diagnostics::excerpt(&stdout, RAW_EXCERPT_CHARS),
            },
            ExecutionOutcome::Success,
        );
    }

    if exit_code.is_some() {
        if let Some(diagnostic) = diagnostics::parse(&stderr) {
            return ExecutionOutcome::ScriptError {
                message: diagnostic.message,
                diagnostic: diagnostic.text,
            };
        }
    }

    ExecutionOutcome::ProcessFailure {
        exit_code,
        stderr_excerpt: diagnostics::excerpt(&stderr, STDERR_EXCERPT_CHARS),
    }
}

/// Splits stdout into formatted text and the trailing JSON object.
fn parse_stdout(stdout: &str) -> Option<ScriptOutput> {
    let mut lines: Vec<&str> = stdout.lines().collect();
    while lines.last().is_some_and(|line| line.trim().is_empty()) {
        lines.pop();
    }
    let last = lines.pop()?;

    let payload: Value = serde_json::from_str(last.trim()).ok()?;
    if !payload.is_object() {
        return None;
    }

    let formatted = lines.join("\n").trim().to_string();
    Some(ScriptOutput {
        payload,
        formatted: (!formatted.is_empty()).then_some(formatted),
    })
}
