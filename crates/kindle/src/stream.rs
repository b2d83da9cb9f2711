//! Line streaming of child process output.
//!
//! A [`StreamReader`] owns one output stream of a spawned process. It runs on
//! its own task, appends every line to a lock-guarded buffer and forwards it
//! through a [`StreamLogger`]. A [`StreamCoordinator`] owns the readers for one
//! process and aggregates their buffers once the process has exited.
//!
//! Readers only stop on end-of-stream, on a read error, or when the
//! coordinator cancels them. A child that keeps a pipe open without writing
//! keeps its reader parked until the pipe closes or `stop()` aborts it.

use kindle_core::{Config, LogLevel, StreamKind};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Tracing target for forwarded child output.
pub const STREAM_TARGET: &str = "kindle::kind";

/// How long `stop()` waits for a reader task before aborting it.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Poll interval of [`StreamCoordinator::await_drained`].
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Destination for formatted output lines.
///
/// Implementations must be safe for concurrent use: one reader per stream
/// calls into the same sink.
pub trait LogSink: fmt::Debug + Send + Sync {
    fn enabled(&self, stream: StreamKind, level: LogLevel) -> bool;
    fn log(&self, stream: StreamKind, level: LogLevel, message: &str);
}

/// Forwards lines into `tracing` under [`STREAM_TARGET`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn enabled(&self, _stream: StreamKind, level: LogLevel) -> bool {
        match level {
            LogLevel::Debug => tracing::enabled!(target: STREAM_TARGET, tracing::Level::DEBUG),
            LogLevel::Info => tracing::enabled!(target: STREAM_TARGET, tracing::Level::INFO),
            LogLevel::Warning => tracing::enabled!(target: STREAM_TARGET, tracing::Level::WARN),
            LogLevel::Error => tracing::enabled!(target: STREAM_TARGET, tracing::Level::ERROR),
        }
    }

    fn log(&self, stream: StreamKind, level: LogLevel, message: &str) {
        let stream = stream.tag();
        match level {
            LogLevel::Debug => debug!(target: STREAM_TARGET, stream, "{message}"),
            LogLevel::Info => info!(target: STREAM_TARGET, stream, "{message}"),
            LogLevel::Warning => warn!(target: STREAM_TARGET, stream, "{message}"),
            LogLevel::Error => error!(target: STREAM_TARGET, stream, "{message}"),
        }
    }
}

/// Collects forwarded lines in memory, dropping anything below `threshold`.
#[derive(Debug)]
pub struct MemorySink {
    threshold: LogLevel,
    entries: Mutex<Vec<(StreamKind, LogLevel, String)>>,
}

impl MemorySink {
    pub fn new(threshold: LogLevel) -> Self {
        Self {
            threshold,
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn entries(&self) -> Vec<(StreamKind, LogLevel, String)> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.entries().into_iter().map(|(_, _, message)| message).collect()
    }
}

impl LogSink for MemorySink {
    fn enabled(&self, _stream: StreamKind, level: LogLevel) -> bool {
        level >= self.threshold
    }

    fn log(&self, stream: StreamKind, level: LogLevel, message: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((stream, level, message.to_string()));
    }
}

/// Formats lines of one stream and hands them to a sink at a fixed level.
#[derive(Debug, Clone)]
pub struct StreamLogger {
    stream: StreamKind,
    level: LogLevel,
    template: String,
    sink: Arc<dyn LogSink>,
}

impl StreamLogger {
    /// `template` may reference `{stream}` and `{message}`.
    pub fn new(
        stream: StreamKind,
        level: LogLevel,
        template: impl Into<String>,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            stream,
            level,
            template: template.into(),
            sink,
        }
    }

    pub fn stream(&self) -> StreamKind {
        self.stream
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.enabled(self.stream, self.level)
    }

    /// Render a raw line. Blank lines (after trimming) render to nothing.
    pub fn format_line(&self, line: &str) -> Option<String> {
        let message = line.trim_end();
        if message.trim_start().is_empty() {
            return None;
        }
        Some(
            self.template
                .replace("{stream}", self.stream.tag())
                .replace("{message}", message),
        )
    }

    pub fn log_line(&self, line: &str) {
        let Some(message) = self.format_line(line) else {
            return;
        };
        if self.is_enabled() {
            self.sink.log(self.stream, self.level, &message);
        }
    }

    pub fn log_lines(&self, text: &str) {
        for line in text.lines() {
            self.log_line(line);
        }
    }
}

/// The pair of loggers a streamed process is wired to. A missing logger means
/// that stream is not piped at all.
#[derive(Debug, Clone, Default)]
pub struct StreamLoggers {
    pub stdout: Option<StreamLogger>,
    pub stderr: Option<StreamLogger>,
}

impl StreamLoggers {
    pub fn from_config(config: &Config, sink: Arc<dyn LogSink>) -> Self {
        Self {
            stdout: Some(StreamLogger::new(
                StreamKind::Stdout,
                config.stdout_level,
                config.log_format.clone(),
                Arc::clone(&sink),
            )),
            stderr: Some(StreamLogger::new(
                StreamKind::Stderr,
                config.stderr_level,
                config.log_format.clone(),
                sink,
            )),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn get(&self, stream: StreamKind) -> Option<&StreamLogger> {
        match stream {
            StreamKind::Stdout => self.stdout.as_ref(),
            StreamKind::Stderr => self.stderr.as_ref(),
        }
    }
}

/// Reads one output stream line by line on a background task.
#[derive(Debug)]
pub struct StreamReader {
    name: String,
    logger: StreamLogger,
    lines: Arc<Mutex<Vec<String>>>,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl StreamReader {
    pub fn new(name: impl Into<String>, logger: StreamLogger) -> Self {
        Self {
            name: name.into(),
            logger,
            lines: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stream(&self) -> StreamKind {
        self.logger.stream()
    }

    /// Start reading `source` on a new task. A second call is ignored.
    pub fn start<R>(&mut self, source: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        if self.handle.is_some() {
            return;
        }
        self.running.store(true, Ordering::Release);
        debug!(reader = %self.name, stream = %self.logger.stream(), "starting stream reader");
        self.handle = Some(tokio::spawn(read_lines(
            source,
            self.logger.clone(),
            Arc::clone(&self.lines),
            Arc::clone(&self.running),
            self.cancel.clone(),
        )));
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Signal the task to stop and join it, aborting it after a short wait.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        let Some(mut handle) = self.handle.take() else {
            return;
        };
        if tokio::time::timeout(STOP_JOIN_TIMEOUT, &mut handle).await.is_err() {
            warn!(reader = %self.name, "stream reader did not stop in time; aborting");
            handle.abort();
        }
        self.running.store(false, Ordering::Release);
    }

    /// Snapshot of the captured lines, terminators included.
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// All captured lines joined back into one string.
    pub fn output(&self) -> String {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .concat()
    }
}

async fn read_lines<R>(
    source: R,
    logger: StreamLogger,
    lines: Arc<Mutex<Vec<String>>>,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(source);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = tokio::select! {
            () = cancel.cancelled() => break,
            read = reader.read_until(b'\n', &mut buf) => read,
        };
        match read {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).into_owned();
                if logger.is_enabled() {
                    logger.log_line(&line);
                }
                lines
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(line);
            }
            Err(err) => {
                if logger.is_enabled() {
                    logger.log_line(&format!("Error reading stream: {err}"));
                }
                break;
            }
        }
    }

    running.store(false, Ordering::Release);
}

/// Owns the stream readers of one process.
#[derive(Debug, Default)]
pub struct StreamCoordinator {
    stdout: Option<StreamReader>,
    stderr: Option<StreamReader>,
}

impl StreamCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a reader for `stream` to `source` and start it.
    pub fn attach<R>(&mut self, logger: StreamLogger, source: R, command_name: &str)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let stream = logger.stream();
        let name = format!("{command_name}-{}", stream.tag().to_lowercase());
        let mut reader = StreamReader::new(name, logger);
        reader.start(source);
        match stream {
            StreamKind::Stdout => self.stdout = Some(reader),
            StreamKind::Stderr => self.stderr = Some(reader),
        }
    }

    /// Take the piped streams of `child` and start one reader per logger.
    pub fn start_streaming(&mut self, child: &mut Child, loggers: &StreamLoggers, command_name: &str) {
        if let (Some(logger), Some(stdout)) = (loggers.stdout.as_ref(), child.stdout.take()) {
            self.attach(logger.clone(), stdout, command_name);
        }
        if let (Some(logger), Some(stderr)) = (loggers.stderr.as_ref(), child.stderr.take()) {
            self.attach(logger.clone(), stderr, command_name);
        }
    }

    fn readers(&self) -> impl Iterator<Item = &StreamReader> {
        self.stdout.iter().chain(self.stderr.iter())
    }

    pub fn reader_count(&self) -> usize {
        self.readers().count()
    }

    pub fn is_running(&self) -> bool {
        self.readers().any(StreamReader::is_running)
    }

    /// Stop every reader and join its task.
    pub async fn stop(&mut self) {
        if let Some(reader) = self.stdout.as_mut() {
            reader.stop().await;
        }
        if let Some(reader) = self.stderr.as_mut() {
            reader.stop().await;
        }
    }

    /// Poll until every reader has stopped or `timeout` elapses.
    ///
    /// Best effort: returning does not guarantee every byte was read.
    pub async fn await_drained(&self, timeout: Duration) -> bool {
        let started = Instant::now();
        loop {
            if !self.is_running() {
                return true;
            }
            if started.elapsed() >= timeout {
                debug!(timeout_ms = timeout.as_millis() as u64, "stream drain timed out");
                return false;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    /// Captured `(stdout, stderr)` text. Order is only meaningful within a stream.
    pub fn captured_output(&self) -> (String, String) {
        (
            self.stdout.as_ref().map(StreamReader::output).unwrap_or_default(),
            self.stderr.as_ref().map(StreamReader::output).unwrap_or_default(),
        )
    }
}
