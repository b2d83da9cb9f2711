//! Execution substrate used by the cluster lifecycle manager.

use crate::exec::{self, CommandSpec, ProcessOutput};
use crate::stream::{LogSink, TracingSink};
use crate::streaming::StreamingRunner;
use kindle_core::Config;
use std::future::Future;
use std::sync::Arc;

/// Runs commands on behalf of a cluster.
///
/// The lifecycle manager only talks to processes through this trait, so tests
/// can substitute a scripted executor and count invocations.
pub trait Executor: Send + Sync {
    fn run(&self, spec: &CommandSpec) -> impl Future<Output = exec::Result<ProcessOutput>> + Send;
}

impl<T: Executor> Executor for Arc<T> {
    fn run(&self, spec: &CommandSpec) -> impl Future<Output = exec::Result<ProcessOutput>> + Send {
        T::run(self, spec)
    }
}

/// Executor backed by real child processes.
///
/// Specs marked `streamed` go through the [`StreamingRunner`] when streaming
/// is enabled; everything else is captured by [`exec::run`].
#[derive(Debug, Clone, Default)]
pub struct SystemExecutor {
    streaming: Option<StreamingRunner>,
}

impl SystemExecutor {
    /// Executor that never streams.
    pub fn captured() -> Self {
        Self { streaming: None }
    }

    pub fn from_config(config: &Config, sink: Arc<dyn LogSink>) -> Self {
        Self {
            streaming: config
                .stream_logs
                .then(|| StreamingRunner::from_config(config, sink)),
        }
    }

    /// Streams into `tracing` when `stream_logs` is enabled.
    pub fn with_tracing(config: &Config) -> Self {
        Self::from_config(config, Arc::new(TracingSink))
    }

    pub fn streams(&self) -> bool {
        self.streaming.is_some()
    }
}

impl Executor for SystemExecutor {
    async fn run(&self, spec: &CommandSpec) -> exec::Result<ProcessOutput> {
        match self.streaming.as_ref() {
            Some(runner) if spec.streamed => runner.run(spec).await,
            _ => exec::run(spec).await,
        }
    }
}
