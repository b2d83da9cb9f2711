//! kindle - disposable kind clusters with live process output.
//!
//! The [`cluster`] module drives the lifecycle of one kind cluster; the
//! [`exec`], [`stream`] and [`streaming`] modules are the process harness it
//! runs on.

pub mod cluster;
pub mod cluster_config;
pub mod exec;
pub mod executor;
pub mod naming;
pub mod scope;
pub mod stream;
pub mod streaming;

pub use cluster::{ClusterError, ClusterErrorKind, ClusterSettings, ClusterSpec, KindCluster};
pub use exec::{CommandSpec, ExecError, ProcessOutput};
pub use executor::{Executor, SystemExecutor};
pub use scope::ClusterHandle;
pub use stream::{LogSink, MemorySink, StreamLogger, StreamLoggers, TracingSink};
pub use streaming::StreamingRunner;
