//! Streaming process runner.
//!
//! Runs a long-lived command with its output forwarded line by line to the
//! logs while it runs, and still returns the full captured text once the
//! process exits. Every exit path (success, failure, timeout, or an error
//! half way through) stops the stream readers and makes sure the child is
//! gone before returning.

use crate::exec::{abort_stdin_writer, spawn_stdin_writer, CommandSpec, ExecError, ProcessOutput, Result};
use crate::stream::{LogSink, StreamCoordinator, StreamLoggers};
use chrono::Utc;
use kindle_core::Config;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Default bound on the post-exit drain of the stream readers.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace period between SIGTERM and SIGKILL during cleanup.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Runner that streams child output through [`StreamLoggers`].
#[derive(Debug, Clone)]
pub struct StreamingRunner {
    loggers: StreamLoggers,
    drain_timeout: Duration,
}

impl StreamingRunner {
    pub fn new(loggers: StreamLoggers, drain_timeout: Duration) -> Self {
        Self {
            loggers,
            drain_timeout,
        }
    }

    pub fn from_config(config: &Config, sink: Arc<dyn LogSink>) -> Self {
        Self::new(
            StreamLoggers::from_config(config, sink),
            config.drain_timeout(),
        )
    }

    /// Run `spec`, streaming whichever outputs have a logger.
    ///
    /// Streams without a logger are inherited from this process and show up
    /// as empty strings in the result.
    pub async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput> {
        let (mut cmd, program) = spec.to_command()?;
        cmd.stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(if self.loggers.stdout.is_some() {
            Stdio::piped()
        } else {
            Stdio::inherit()
        })
        .stderr(if self.loggers.stderr.is_some() {
            Stdio::piped()
        } else {
            Stdio::inherit()
        });

        let command = spec.command_line();
        info!(command = %command, "running streamed command");

        let mut child = cmd.spawn().map_err(|e| ExecError::from_spawn(program, e))?;
        let mut coordinator = StreamCoordinator::new();

        let result = self
            .drive(spec, &command, program, &mut child, &mut coordinator)
            .await;

        // Cleanup runs on every path; the child was spawned with kill_on_drop
        // so a panic above still takes it down.
        coordinator.stop().await;
        terminate(&mut child, &command).await;

        result
    }

    async fn drive(
        &self,
        spec: &CommandSpec,
        command: &str,
        program: &str,
        child: &mut Child,
        coordinator: &mut StreamCoordinator,
    ) -> Result<ProcessOutput> {
        let start = Utc::now();
        coordinator.start_streaming(child, &self.loggers, command_name(program));

        let stdin_task = spawn_stdin_writer(child.stdin.take(), spec, command);
        let waited = wait(child, spec.timeout).await;
        abort_stdin_writer(stdin_task);

        let status = match waited? {
            Some(status) => status,
            None => {
                let limit = spec.timeout.unwrap_or_default();
                warn!(command = %command, timeout_ms = limit.as_millis() as u64, "streamed command timed out; killing");
                if let Err(err) = child.kill().await {
                    warn!(command = %command, error = %err, "failed to kill timed-out process");
                }
                coordinator.stop().await;
                return Err(ExecError::TimedOut {
                    command: command.to_string(),
                    timeout: limit,
                });
            }
        };

        if !coordinator.await_drained(self.drain_timeout).await {
            debug!(command = %command, "stream readers still running after drain timeout");
        }
        let (stdout, stderr) = coordinator.captured_output();
        let duration_ms = (Utc::now() - start).num_milliseconds() as u64;
        let code = status.code().unwrap_or(-1);

        info!(
            command = %command,
            exit_code = code,
            duration_ms,
            stdout_bytes = stdout.len(),
            stderr_bytes = stderr.len(),
            "streamed command finished"
        );

        let output = ProcessOutput::new(spec.argv.clone(), code, stdout, stderr, duration_ms);
        if spec.check {
            output.into_checked()
        } else {
            Ok(output)
        }
    }
}

/// Wait for exit, `None` meaning the timeout elapsed first.
async fn wait(child: &mut Child, limit: Option<Duration>) -> Result<Option<ExitStatus>> {
    match limit {
        Some(limit) => match timeout(limit, child.wait()).await {
            Ok(status) => Ok(Some(status?)),
            Err(_) => Ok(None),
        },
        None => Ok(Some(child.wait().await?)),
    }
}

/// Basename of the program, used to name reader tasks.
fn command_name(program: &str) -> &str {
    std::path::Path::new(program)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(program)
}

/// Make sure the child has exited: SIGTERM, then SIGKILL after a grace period.
async fn terminate(child: &mut Child, command: &str) {
    match child.try_wait() {
        Ok(Some(_)) => return,
        Ok(None) => {}
        Err(err) => {
            warn!(command = %command, error = %err, "failed to poll child status");
        }
    }

    debug!(command = %command, "terminating child process");
    if let Err(err) = send_terminate(child) {
        warn!(command = %command, error = %err, "failed to signal child process");
    }
    if timeout(TERMINATE_GRACE, child.wait()).await.is_err() {
        warn!(command = %command, "child ignored SIGTERM; killing");
        if let Err(err) = child.kill().await {
            warn!(command = %command, error = %err, "failed to kill child process");
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) -> std::io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return Ok(());
    };
    kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(std::io::Error::from)
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
}
