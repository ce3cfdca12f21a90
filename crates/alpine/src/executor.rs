//! Assistant Executor (Section 4.3): launches the assistant subprocess,
//! captures its output, and enforces timeout and cancellation.
//!
//! The child is placed in its own process group (`setsid`-equivalent) so
//! that a timeout or cancellation can signal the whole tree, not just the
//! direct child — the assistant may itself spawn helpers.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use alpine_core::events::ToolCallStartPayload;

/// Environment variables that signal "running under CI" to many CLIs,
/// which can make them switch into a non-interactive failure mode. The
/// assistant must see an interactive-looking environment.
const CI_ENV_VARS: &[&str] = &[
    "CI",
    "GITHUB_ACTIONS",
    "GITLAB_CI",
    "CONTINUOUS_INTEGRATION",
    "BUILDKITE",
    "CIRCLECI",
];

const CANCEL_GRACE_PERIOD: Duration = Duration::from_secs(5);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("assistant binary not found on PATH: {0} (install it and ensure it is on PATH)")]
    NotFound(String),
    #[error("assistant timed out after {0:?}")]
    Timeout(Duration),
    #[error("assistant exited with code {0}")]
    ExitCode(i32),
    #[error("cancelled")]
    Cancelled,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub assistant_bin: String,
    pub prompt: String,
    pub work_dir: PathBuf,
    pub allowed_tools: Option<String>,
    pub system_prompt: Option<String>,
    pub extra_args: Vec<String>,
    pub timeout: Option<Duration>,
    pub env_overrides: Vec<(String, String)>,
}

impl ExecutorConfig {
    pub fn new(prompt: impl Into<String>, work_dir: PathBuf) -> Self {
        Self {
            assistant_bin: "claude".to_string(),
            prompt: prompt.into(),
            work_dir,
            allowed_tools: None,
            system_prompt: None,
            extra_args: Vec::new(),
            timeout: None,
            env_overrides: Vec::new(),
        }
    }
}

/// An event sink the executor reports stderr tool-log lines to. Kept
/// generic over a closure so the engine can route it to the Event Bus
/// without the executor depending on the bus's internals.
pub type ToolLogSink<'a> = dyn Fn(ToolCallStartPayload) + Send + Sync + 'a;

/// Launch the assistant, wait for it to finish, and return its combined
/// stdout. Enforces `config.timeout` (default 30 minutes); on `ctx`
/// cancellation, sends SIGTERM to the process group, waits up to 5s, then
/// SIGKILLs the group.
pub async fn execute(
    ctx: &CancellationToken,
    config: &ExecutorConfig,
    on_stderr_line: &ToolLogSink<'_>,
) -> Result<String, ExecutorError> {
    if ctx.is_cancelled() {
        return Err(ExecutorError::Cancelled);
    }

    let mut cmd = Command::new(&config.assistant_bin);
    // Match on the binary's file name, not the full path, so an absolute
    // path to the same `claude` binary still gets its flags.
    let is_claude = std::path::Path::new(&config.assistant_bin)
        .file_name()
        .and_then(|name| name.to_str())
        == Some("claude");
    if is_claude {
        cmd.arg("-p")
            .arg("--dangerously-skip-permissions")
            .arg(&config.prompt);
        if let Some(tools) = &config.allowed_tools {
            cmd.arg("--allowed-tools").arg(tools);
        }
        if let Some(system_prompt) = &config.system_prompt {
            cmd.arg("--append-system-prompt").arg(system_prompt);
        }
        for arg in &config.extra_args {
            cmd.arg(arg);
        }
    } else {
        // Non-`claude` assistants (an alternate CLI, or a wrapper script
        // used to invoke one) still need the prompt delivered somehow;
        // appended last, after any of the caller's own extra arguments.
        for arg in &config.extra_args {
            cmd.arg(arg);
        }
        cmd.arg(&config.prompt);
    }

    cmd.current_dir(&config.work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    for key in CI_ENV_VARS {
        cmd.env_remove(key);
    }
    for (key, value) in &config.env_overrides {
        cmd.env(key, value);
    }

    // New process group: pgid == child pid. Lets us signal the whole tree.
    set_process_group(&mut cmd);

    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ExecutorError::NotFound(config.assistant_bin.clone())
        } else {
            ExecutorError::Io(e)
        }
    })?;

    let pid = child.id();

    let stdout_pipe = child.stdout.take().expect("stdout piped");
    let stderr_pipe = child.stderr.take().expect("stderr piped");

    let stdout_task = tokio::spawn(async move {
        let mut reader = BufReader::new(stdout_pipe).lines();
        let mut collected = String::new();
        while let Ok(Some(line)) = reader.next_line().await {
            collected.push_str(&line);
            collected.push('\n');
        }
        collected
    });

    let stderr_task = {
        let mut last_line: Option<String> = None;
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr_pipe).lines();
            let mut lines = Vec::new();
            while let Ok(Some(line)) = reader.next_line().await {
                if last_line.as_deref() != Some(line.as_str()) {
                    lines.push(line.clone());
                    last_line = Some(line);
                }
            }
            lines
        })
    };

    let effective_timeout = config.timeout.unwrap_or(DEFAULT_TIMEOUT);
    let start = Instant::now();

    let wait_result = tokio::select! {
        result = timeout(effective_timeout, child.wait()) => {
            match result {
                Ok(status) => WaitOutcome::Exited(status?),
                Err(_) => WaitOutcome::TimedOut,
            }
        }
        () = ctx.cancelled() => WaitOutcome::Cancelled,
    };

    match wait_result {
        WaitOutcome::Exited(status) => {
            let stdout = stdout_task.await.unwrap_or_default();
            if let Ok(lines) = stderr_task.await {
                for line in lines {
                    on_stderr_line(ToolCallStartPayload { line });
                }
            }
            if status.success() {
                Ok(stdout)
            } else {
                Err(ExecutorError::ExitCode(status.code().unwrap_or(-1)))
            }
        }
        WaitOutcome::TimedOut => {
            debug!(elapsed = ?start.elapsed(), "assistant timed out, killing process group");
            kill_process_group(pid, &mut child).await;
            Err(ExecutorError::Timeout(effective_timeout))
        }
        WaitOutcome::Cancelled => {
            debug!("context cancelled, terminating assistant");
            terminate_gracefully(pid, &mut child).await;
            Err(ExecutorError::Cancelled)
        }
    }
}

enum WaitOutcome {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

#[cfg(unix)]
fn set_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn set_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
async fn kill_process_group(pid: Option<u32>, child: &mut Child) {
    if let Some(pid) = pid {
        let pgid = Pid::from_raw(pid as i32);
        let _ = signal::killpg(pgid, Signal::SIGKILL);
    }
    let _ = child.kill().await;
}

#[cfg(not(unix))]
async fn kill_process_group(_pid: Option<u32>, child: &mut Child) {
    let _ = child.kill().await;
}

/// SIGTERM the group, give it `CANCEL_GRACE_PERIOD` to exit, then SIGKILL.
#[cfg(unix)]
async fn terminate_gracefully(pid: Option<u32>, child: &mut Child) {
    if let Some(pid) = pid {
        let pgid = Pid::from_raw(pid as i32);
        let _ = signal::killpg(pgid, Signal::SIGTERM);
    }
    if tokio::time::timeout(CANCEL_GRACE_PERIOD, child.wait())
        .await
        .is_err()
    {
        kill_process_group(pid, child).await;
    }
}

#[cfg(not(unix))]
async fn terminate_gracefully(_pid: Option<u32>, child: &mut Child) {
    let _ = child.kill().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeout_is_thirty_minutes() {
        assert_eq!(DEFAULT_TIMEOUT, Duration::from_secs(1800));
    }

    #[tokio::test]
    async fn not_found_reports_install_hint() {
        let ctx = CancellationToken::new();
        let config = ExecutorConfig::new("hello", PathBuf::from("."));
        let mut config = config;
        config.assistant_bin = "definitely-not-a-real-binary-xyz".to_string();
        let sink: &ToolLogSink<'_> = &|_| {};
        let err = execute(&ctx, &config, sink).await.unwrap_err();
        assert!(matches!(err, ExecutorError::NotFound(_)));
    }

    #[tokio::test]
    async fn cancelled_before_spawn_short_circuits() {
        let ctx = CancellationToken::new();
        ctx.cancel();
        let config = ExecutorConfig::new("hello", PathBuf::from("."));
        let sink: &ToolLogSink<'_> = &|_| {};
        let err = execute(&ctx, &config, sink).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Cancelled));
    }

    #[tokio::test]
    async fn exit_code_propagates_for_failing_command() {
        let ctx = CancellationToken::new();
        let mut config = ExecutorConfig::new("hello", PathBuf::from("."));
        config.assistant_bin = "false".to_string();
        let sink: &ToolLogSink<'_> = &|_| {};
        let err = execute(&ctx, &config, sink).await.unwrap_err();
        assert!(matches!(err, ExecutorError::ExitCode(_)));
    }

    #[tokio::test]
    async fn timeout_kills_a_sleeping_command() {
        let ctx = CancellationToken::new();
        // The prompt is appended as a trailing argument for non-`claude`
        // binaries (see `execute`), so it must itself be a valid extra
        // `sleep` duration (`0`, summed in) rather than break its parsing.
        let mut config = ExecutorConfig::new("0", PathBuf::from("."));
        config.assistant_bin = "sleep".to_string();
        config.extra_args = vec!["2".to_string()];
        config.timeout = Some(Duration::from_millis(100));
        let sink: &ToolLogSink<'_> = &|_| {};
        let err = execute(&ctx, &config, sink).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Timeout(_)));
    }
}
