//! Command runner for short-lived external commands.
//!
//! Runs a command to completion with both output streams captured in full
//! (nothing is streamed), bounded by an optional wall-clock timeout. On
//! timeout the child is killed before the error is returned.

use chrono::Utc;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// Timeout for capturing stdout/stderr after the process exits or is killed.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum bytes captured from each output stream.
const MAX_OUTPUT_BYTES: usize = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("empty command line")]
    EmptyCommand,
    #[error("command not found: {program}")]
    NotFound { program: String },
    #[error("failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("command timed out after {timeout:?}: {command}")]
    TimedOut { command: String, timeout: Duration },
    #[error("command exited with code {code}: {command}")]
    ExitNonZero {
        command: String,
        code: i32,
        stdout: String,
        stderr: String,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecError {
    /// Captured output worth showing to a human, if the failure carried any.
    ///
    /// Prefers stderr; falls back to stdout when stderr is blank.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::ExitNonZero { stdout, stderr, .. } => {
                let stderr = stderr.trim();
                let stdout = stdout.trim();
                if !stderr.is_empty() {
                    Some(stderr)
                } else if !stdout.is_empty() {
                    Some(stdout)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    pub(crate) fn from_spawn(program: &str, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound {
                program: program.to_string(),
            }
        } else {
            Self::SpawnFailed {
                program: program.to_string(),
                source: err,
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecError>;

/// Description of one command invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program followed by its arguments.
    pub argv: Vec<String>,
    /// Extra environment variables layered over the inherited environment.
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    /// Data written to the child's stdin, which is then closed.
    pub stdin: Option<String>,
    /// Wall-clock bound (`None` = wait forever).
    pub timeout: Option<Duration>,
    /// Fail with [`ExecError::ExitNonZero`] on a non-zero exit code.
    pub check: bool,
    /// Prefer the streaming runner so output shows up in the logs live.
    pub streamed: bool,
}

impl CommandSpec {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn check(mut self, check: bool) -> Self {
        self.check = check;
        self
    }

    #[must_use]
    pub fn streamed(mut self) -> Self {
        self.streamed = true;
        self
    }

    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }

    /// Space-joined argv, for log and error messages.
    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }

    /// Build the tokio command with env and cwd applied. Stdio is left to the caller.
    pub(crate) fn to_command(&self) -> Result<(Command, &str)> {
        let (program, args) = self.argv.split_first().ok_or(ExecError::EmptyCommand)?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .kill_on_drop(true);
        if let Some(ref cwd) = self.cwd {
            cmd.current_dir(cwd);
        }
        Ok((cmd, program.as_str()))
    }
}

/// Outcome of a finished command. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    args: Vec<String>,
    code: i32,
    stdout: String,
    stderr: String,
    duration_ms: u64,
}

impl ProcessOutput {
    pub fn new(
        args: Vec<String>,
        code: i32,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            args,
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            duration_ms,
        }
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Exit code, or -1 when the process was terminated by a signal.
    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn command_line(&self) -> String {
        self.args.join(" ")
    }

    /// Convert a non-zero exit into [`ExecError::ExitNonZero`].
    pub fn into_checked(self) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        error!(
            command = %self.command_line(),
            exit_code = self.code,
            stdout = %self.stdout,
            stderr = %self.stderr,
            "command failed"
        );
        Err(ExecError::ExitNonZero {
            command: self.command_line(),
            code: self.code,
            stdout: self.stdout,
            stderr: self.stderr,
        })
    }
}

/// Read from an async reader with a maximum byte limit.
async fn read_bounded<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    max_bytes: usize,
) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }

        let remaining = max_bytes.saturating_sub(buf.len());
        if remaining == 0 {
            warn!(max_bytes, "output exceeded limit, truncating");
            // Keep draining so the child never blocks on a full pipe.
            while reader.read(&mut chunk).await? > 0 {}
            break;
        }

        let to_take = n.min(remaining);
        buf.extend_from_slice(&chunk[..to_take]);
    }

    Ok(buf)
}

/// Await a capture task, tolerating failures (the exit code is what matters).
async fn collect(task: Option<JoinHandle<std::io::Result<Vec<u8>>>>, stream: &str) -> String {
    let Some(task) = task else {
        return String::new();
    };
    let buf = match timeout(IO_CAPTURE_TIMEOUT, task).await {
        Ok(Ok(Ok(buf))) => buf,
        Ok(Ok(Err(err))) => {
            warn!(stream, error = %err, "capture failed");
            Vec::new()
        }
        Ok(Err(err)) => {
            warn!(stream, error = %err, "capture task panicked");
            Vec::new()
        }
        Err(_) => {
            warn!(stream, "capture timed out");
            Vec::new()
        }
    };
    String::from_utf8_lossy(&buf).into_owned()
}

/// Feed `spec.stdin` to the child on its own task, then close the pipe.
///
/// The write runs concurrently with the wait so a child that never reads
/// stdin is still bounded by `spec.timeout`. A child that exits without
/// reading everything closes its end of the pipe; that is not an error.
pub(crate) fn spawn_stdin_writer(
    stdin: Option<ChildStdin>,
    spec: &CommandSpec,
    command: &str,
) -> Option<JoinHandle<()>> {
    let (mut stdin, input) = (stdin?, spec.stdin.clone()?);
    let command = command.to_string();
    Some(tokio::spawn(async move {
        let written = match stdin.write_all(input.as_bytes()).await {
            Ok(()) => stdin.shutdown().await,
            Err(err) => Err(err),
        };
        match written {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {
                debug!(command = %command, "stdin closed by child before all input was written");
            }
            Err(err) => warn!(command = %command, error = %err, "failed to write stdin"),
        }
    }))
}

/// Stop a stdin writer once the child is gone; dropping the pipe unblocks it.
pub(crate) fn abort_stdin_writer(task: Option<JoinHandle<()>>) {
    if let Some(task) = task {
        task.abort();
    }
}

/// Run a command to completion and capture its output.
///
/// Fails with `NotFound` when the program does not exist, `TimedOut` when
/// `spec.timeout` elapses (the child is killed first), and `ExitNonZero`
/// when `spec.check` is set and the exit code is not zero.
pub async fn run(spec: &CommandSpec) -> Result<ProcessOutput> {
    let (mut cmd, program) = spec.to_command()?;
    cmd.stdin(if spec.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

    let command = spec.command_line();
    debug!(command = %command, "running command");

    let start = Utc::now();
    let mut child = cmd.spawn().map_err(|e| ExecError::from_spawn(program, e))?;

    // Start draining before writing stdin so a chatty child cannot deadlock us.
    let stdout_task = child
        .stdout
        .take()
        .map(|stdout| tokio::spawn(read_bounded(stdout, MAX_OUTPUT_BYTES)));
    let stderr_task = child
        .stderr
        .take()
        .map(|stderr| tokio::spawn(read_bounded(stderr, MAX_OUTPUT_BYTES)));

    let stdin_task = spawn_stdin_writer(child.stdin.take(), spec, &command);

    let waited = match spec.timeout {
        Some(limit) => match timeout(limit, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!(command = %command, timeout_ms = limit.as_millis() as u64, "command timed out; killing");
                if let Err(err) = child.kill().await {
                    warn!(command = %command, error = %err, "failed to kill timed-out process");
                }
                abort_stdin_writer(stdin_task);
                return Err(ExecError::TimedOut {
                    command,
                    timeout: limit,
                });
            }
        },
        None => child.wait().await,
    };
    abort_stdin_writer(stdin_task);
    let status = waited?;

    let stdout = collect(stdout_task, "stdout").await;
    let stderr = collect(stderr_task, "stderr").await;
    let duration_ms = (Utc::now() - start).num_milliseconds() as u64;
    let code = status.code().unwrap_or(-1);

    if !stdout.is_empty() {
        debug!(command = %command, stdout = %stdout, "command stdout");
    }
    if !stderr.is_empty() {
        debug!(command = %command, stderr = %stderr, "command stderr");
    }

    let output = ProcessOutput::new(spec.argv.clone(), code, stdout, stderr, duration_ms);
    if spec.check {
        output.into_checked()
    } else {
        Ok(output)
    }
}
