//! Cluster lifecycle manager.
//!
//! A [`KindCluster`] owns one named kind cluster: its creation parameters,
//! the kubeconfig exported for it and its [`LifecycleState`]. It sequences
//! prerequisite checks, existence checks, creation, readiness polling, node
//! inspection and deletion over an [`Executor`].
//!
//! Every method that changes the cluster takes `&mut self`, so one instance
//! serves a single logical flow at a time. Share the kubeconfig path (see
//! [`KindCluster::handle`]) rather than the instance itself.

use crate::cluster_config::{self, ConfigFile};
use crate::exec::{CommandSpec, ExecError};
use crate::executor::{Executor, SystemExecutor};
use crate::naming;
use kindle_core::{Config, LifecycleState, PortMapping};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Prefix `kubectl get nodes -o name` puts in front of every node.
const NODE_PREFIX: &str = "node/";

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("prerequisite missing: {tool}: {message}")]
    PrerequisiteMissing { tool: String, message: String },
    #[error("cluster {name} already exists")]
    AlreadyExists { name: String },
    #[error("cluster {name} does not exist")]
    NotFound { name: String },
    #[error("failed to create cluster {name}: {message}")]
    CreationFailed {
        name: String,
        message: String,
        diagnostics: Option<String>,
        /// Why the cluster may still be running, when rollback did not finish.
        residual: Option<String>,
    },
    #[error("failed to delete cluster {name}: {message}")]
    DeletionFailed {
        name: String,
        message: String,
        diagnostics: Option<String>,
    },
    #[error("cluster {name} not ready after {timeout:?} ({probes} probes)")]
    NotReady {
        name: String,
        timeout: Duration,
        probes: u32,
    },
    #[error("no credentials for cluster {name}: {message}")]
    CredentialsMissing { name: String, message: String },
    #[error("timed out listing nodes of cluster {name} after {timeout:?}")]
    NodeQueryTimedOut { name: String, timeout: Duration },
    #[error("failed to list nodes of cluster {name}: {message}")]
    NodeQueryFailed {
        name: String,
        message: String,
        diagnostics: Option<String>,
    },
}

/// Tag of a [`ClusterError`] without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterErrorKind {
    InvalidConfiguration,
    PrerequisiteMissing,
    AlreadyExists,
    NotFound,
    CreationFailed,
    DeletionFailed,
    NotReady,
    CredentialsMissing,
    NodeQueryTimedOut,
    NodeQueryFailed,
}

impl ClusterError {
    pub fn kind(&self) -> ClusterErrorKind {
        match self {
            Self::InvalidConfiguration(_) => ClusterErrorKind::InvalidConfiguration,
            Self::PrerequisiteMissing { .. } => ClusterErrorKind::PrerequisiteMissing,
            Self::AlreadyExists { .. } => ClusterErrorKind::AlreadyExists,
            Self::NotFound { .. } => ClusterErrorKind::NotFound,
            Self::CreationFailed { .. } => ClusterErrorKind::CreationFailed,
            Self::DeletionFailed { .. } => ClusterErrorKind::DeletionFailed,
            Self::NotReady { .. } => ClusterErrorKind::NotReady,
            Self::CredentialsMissing { .. } => ClusterErrorKind::CredentialsMissing,
            Self::NodeQueryTimedOut { .. } => ClusterErrorKind::NodeQueryTimedOut,
            Self::NodeQueryFailed { .. } => ClusterErrorKind::NodeQueryFailed,
        }
    }

    /// Captured command output attached to the failure.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::CreationFailed { diagnostics, .. }
            | Self::DeletionFailed { diagnostics, .. }
            | Self::NodeQueryFailed { diagnostics, .. } => diagnostics.as_deref(),
            _ => None,
        }
    }

    /// Suggested recovery step for an operator.
    pub fn hint(&self) -> Option<String> {
        match self {
            Self::PrerequisiteMissing { tool, .. } => Some(format!(
                "install {tool} and make sure it is on PATH (docker must also be running)"
            )),
            Self::AlreadyExists { name } => Some(format!(
                "pick another name or remove it with `kind delete cluster --name {name}`"
            )),
            Self::NotFound { .. } => Some("list known clusters with `kind get clusters`".to_string()),
            Self::CreationFailed {
                name,
                residual: Some(_),
                ..
            } => Some(format!(
                "the cluster may still exist; remove it with `kind delete cluster --name {name}`"
            )),
            Self::NotReady { .. } => Some("raise cluster_timeout_sec or check docker resources".to_string()),
            Self::CredentialsMissing { .. } => {
                Some("create or attach the cluster before querying it".to_string())
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;

/// Immutable creation parameters of a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSpec {
    /// Explicit name; a random one is generated when `None`.
    pub name: Option<String>,
    /// Bound on blocking lifecycle operations in seconds (0 = no timeout).
    pub timeout_sec: i64,
    /// Make `delete()` a no-op.
    pub keep_cluster: bool,
    pub node_image: Option<String>,
    pub extra_port_mappings: Vec<PortMapping>,
    /// Explicit kind config; wins over inline parameters.
    pub config_path: Option<PathBuf>,
}

impl Default for ClusterSpec {
    fn default() -> Self {
        Self {
            name: None,
            timeout_sec: 300,
            keep_cluster: false,
            node_image: None,
            extra_port_mappings: Vec::new(),
            config_path: None,
        }
    }
}

impl ClusterSpec {
    pub fn from_config(config: &Config) -> Self {
        Self {
            name: config.cluster_name.clone(),
            timeout_sec: config.cluster_timeout_sec,
            keep_cluster: config.keep_cluster,
            node_image: config.node_image.clone(),
            extra_port_mappings: config.extra_port_mappings.clone(),
            config_path: config.cluster_config.clone(),
        }
    }

    /// `None` when the timeout is zero.
    pub fn timeout(&self) -> Option<Duration> {
        u64::try_from(self.timeout_sec)
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// Tool locations and fixed timings used by the lifecycle manager.
#[derive(Debug, Clone)]
pub struct ClusterSettings {
    pub kind_bin: PathBuf,
    pub docker_bin: PathBuf,
    pub kubectl_bin: PathBuf,
    /// Value of kind's `--wait=` flag.
    pub create_wait: String,
    pub ready_poll_interval: Duration,
    pub probe_timeout: Duration,
    pub ready_check_timeout: Duration,
    pub prerequisite_timeout: Duration,
    pub node_query_timeout: Duration,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ClusterSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            kind_bin: config.kind_bin.clone(),
            docker_bin: config.docker_bin.clone(),
            kubectl_bin: config.kubectl_bin.clone(),
            create_wait: config.create_wait.clone(),
            ready_poll_interval: config.ready_poll_interval(),
            probe_timeout: config.probe_timeout(),
            ready_check_timeout: config.ready_check_timeout(),
            prerequisite_timeout: config.prerequisite_timeout(),
            node_query_timeout: config.node_query_timeout(),
        }
    }
}

/// A step of `create()` that failed, flattened for [`ClusterError::CreationFailed`].
struct StepFailure {
    message: String,
    diagnostics: Option<String>,
}

impl From<ExecError> for StepFailure {
    fn from(err: ExecError) -> Self {
        Self {
            diagnostics: err.diagnostics().map(str::to_string),
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for StepFailure {
    fn from(err: std::io::Error) -> Self {
        Self {
            message: err.to_string(),
            diagnostics: None,
        }
    }
}

impl From<ClusterError> for StepFailure {
    fn from(err: ClusterError) -> Self {
        Self {
            diagnostics: err.diagnostics().map(str::to_string),
            message: err.to_string(),
        }
    }
}

/// One disposable kind cluster.
pub struct KindCluster<E: Executor = SystemExecutor> {
    name: String,
    spec: ClusterSpec,
    settings: ClusterSettings,
    executor: E,
    kubeconfig_path: Option<PathBuf>,
    state: LifecycleState,
}

impl<E: Executor> KindCluster<E> {
    /// Build a cluster object; nothing is run until [`KindCluster::create`].
    ///
    /// A negative timeout or an unusable explicit name is rejected here.
    pub fn new(spec: ClusterSpec, settings: ClusterSettings, executor: E) -> Result<Self> {
        if spec.timeout_sec < 0 {
            return Err(ClusterError::InvalidConfiguration(format!(
                "timeout must be non-negative, got {}",
                spec.timeout_sec
            )));
        }
        let name = match spec.name.as_deref() {
            Some(name) => {
                naming::validate_cluster_name(name).map_err(ClusterError::InvalidConfiguration)?;
                name.to_string()
            }
            None => naming::generate_cluster_name(),
        };

        Ok(Self {
            name,
            spec,
            settings,
            executor,
            kubeconfig_path: None,
            state: LifecycleState::Uninitialized,
        })
    }

    pub fn from_config(config: &Config, executor: E) -> Result<Self> {
        Self::new(
            ClusterSpec::from_config(config),
            ClusterSettings::from_config(config),
            executor,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the exported kubeconfig; set only while credentials exist.
    pub fn kubeconfig_path(&self) -> Option<&Path> {
        self.kubeconfig_path.as_deref()
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn spec(&self) -> &ClusterSpec {
        &self.spec
    }

    pub fn settings(&self) -> &ClusterSettings {
        &self.settings
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Create the cluster and wait until it answers.
    ///
    /// Does nothing when the cluster is already created. Any failure after
    /// the prerequisite and existence checks rolls the cluster back with a
    /// best-effort `delete()` and surfaces as [`ClusterError::CreationFailed`].
    pub async fn create(&mut self) -> Result<()> {
        if self.state.is_created() {
            warn!(cluster = %self.name, "cluster already created");
            return Ok(());
        }

        self.check_prerequisites().await?;

        if self.exists().await {
            return Err(ClusterError::AlreadyExists {
                name: self.name.clone(),
            });
        }

        info!(cluster = %self.name, "creating kind cluster");
        let started = Instant::now();

        let config_file = match cluster_config::prepare(
            self.spec.config_path.as_deref(),
            self.spec.node_image.as_deref(),
            &self.spec.extra_port_mappings,
        ) {
            Ok(file) => file,
            Err(err) => {
                return Err(ClusterError::CreationFailed {
                    name: self.name.clone(),
                    message: format!("failed to write kind config: {err}"),
                    diagnostics: None,
                    residual: None,
                });
            }
        };

        let result = self.provision(config_file.as_ref()).await;
        if let Some(file) = config_file {
            file.discard();
        }

        match result {
            Ok(()) => {
                info!(
                    cluster = %self.name,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "kind cluster created"
                );
                Ok(())
            }
            Err(failure) => {
                error!(cluster = %self.name, error = %failure.message, "cluster creation failed");
                let residual = self.rollback().await;
                Err(ClusterError::CreationFailed {
                    name: self.name.clone(),
                    message: failure.message,
                    diagnostics: failure.diagnostics,
                    residual,
                })
            }
        }
    }

    async fn check_prerequisites(&self) -> Result<()> {
        for tool in [&self.settings.kind_bin, &self.settings.docker_bin] {
            let spec = CommandSpec::new([tool_arg(tool), "version".to_string()])
                .timeout(Some(self.settings.prerequisite_timeout))
                .check(true);
            if let Err(err) = self.executor.run(&spec).await {
                return Err(ClusterError::PrerequisiteMissing {
                    tool: tool.display().to_string(),
                    message: err.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn provision(&mut self, config_file: Option<&ConfigFile>) -> std::result::Result<(), StepFailure> {
        let mut spec = self.kind(["create", "cluster", "--name", self.name.as_str()]);
        if let Some(file) = config_file {
            spec = spec.arg("--config").arg(file.path().display().to_string());
        }
        let spec = spec
            .arg(format!("--wait={}", self.settings.create_wait))
            .timeout(self.spec.timeout())
            .check(true)
            .streamed();
        self.executor.run(&spec).await?;

        self.export_kubeconfig().await?;
        self.state = LifecycleState::Created;

        let deadline = self.spec.timeout().unwrap_or_default();
        self.wait_for_ready(deadline).await?;
        Ok(())
    }

    /// Undo a partial creation; returns why the cluster may still exist.
    async fn rollback(&mut self) -> Option<String> {
        let residual = if self.spec.keep_cluster {
            Some("keep_cluster is set, rollback skipped".to_string())
        } else {
            match self.delete().await {
                Ok(()) => None,
                Err(err) => {
                    warn!(cluster = %self.name, error = %err, "rollback delete failed");
                    Some(err.to_string())
                }
            }
        };

        self.discard_credentials();
        if self.state != LifecycleState::Deleted {
            self.state = LifecycleState::Uninitialized;
        }
        residual
    }

    /// Export credentials into a fresh temp file.
    ///
    /// The path is recorded only once the export succeeded; on failure the
    /// file is removed again.
    async fn export_kubeconfig(&mut self) -> std::result::Result<(), StepFailure> {
        let path = tempfile::Builder::new()
            .prefix("kubeconfig-")
            .suffix(".yaml")
            .tempfile()?
            .into_temp_path()
            .keep()
            .map_err(std::io::Error::from)?;

        let spec = self
            .kind(["export", "kubeconfig", "--name", self.name.as_str()])
            .arg("--kubeconfig")
            .arg(path.display().to_string())
            .timeout(self.spec.timeout())
            .check(true);

        match self.executor.run(&spec).await {
            Ok(_) => {
                info!(cluster = %self.name, kubeconfig = %path.display(), "exported kubeconfig");
                self.kubeconfig_path = Some(path);
                Ok(())
            }
            Err(err) => {
                remove_file(&path);
                Err(StepFailure {
                    message: format!("failed to export kubeconfig: {err}"),
                    diagnostics: err.diagnostics().map(str::to_string),
                })
            }
        }
    }

    /// Delete the cluster.
    ///
    /// A no-op when `keep_cluster` is set or the tool does not list the
    /// cluster. The kubeconfig file is removed whether deletion succeeds or not.
    pub async fn delete(&mut self) -> Result<()> {
        if self.spec.keep_cluster {
            info!(cluster = %self.name, "keeping cluster (keep_cluster is set)");
            return Ok(());
        }

        if !self.exists().await {
            debug!(cluster = %self.name, "cluster does not exist; nothing to delete");
            self.discard_credentials();
            if self.state.is_created() {
                self.state = LifecycleState::Deleted;
            }
            return Ok(());
        }

        info!(cluster = %self.name, "deleting kind cluster");
        let spec = self
            .kind(["delete", "cluster", "--name", self.name.as_str()])
            .timeout(self.spec.timeout())
            .check(true)
            .streamed();
        let result = self.executor.run(&spec).await;
        self.discard_credentials();

        match result {
            Ok(_) => {
                self.state = LifecycleState::Deleted;
                info!(cluster = %self.name, "kind cluster deleted");
                Ok(())
            }
            Err(err) => Err(ClusterError::DeletionFailed {
                name: self.name.clone(),
                diagnostics: err.diagnostics().map(str::to_string),
                message: err.to_string(),
            }),
        }
    }

    /// Whether the tool lists a cluster with exactly this name.
    ///
    /// Any failure to list counts as "does not exist".
    pub async fn exists(&self) -> bool {
        let spec = self
            .kind(["get", "clusters"])
            .timeout(Some(self.settings.prerequisite_timeout));
        match self.executor.run(&spec).await {
            Ok(output) if output.success() => cluster_listed(output.stdout(), &self.name),
            Ok(output) => {
                debug!(cluster = %self.name, exit_code = output.code(), "cluster listing failed");
                false
            }
            Err(err) => {
                debug!(cluster = %self.name, error = %err, "cluster listing failed");
                false
            }
        }
    }

    /// Poll until a node listing succeeds or `timeout` has elapsed.
    ///
    /// At least one probe is always made. Success moves the cluster to
    /// [`LifecycleState::Verified`].
    pub async fn wait_for_ready(&mut self, timeout: Duration) -> Result<()> {
        info!(cluster = %self.name, timeout_ms = timeout.as_millis() as u64, "waiting for cluster to be ready");
        let started = Instant::now();
        let mut probes = 0u32;

        loop {
            probes += 1;
            if self.probe().await {
                self.state = LifecycleState::Verified;
                info!(cluster = %self.name, probes, "cluster is ready");
                return Ok(());
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                warn!(cluster = %self.name, probes, "cluster not ready before timeout");
                return Err(ClusterError::NotReady {
                    name: self.name.clone(),
                    timeout,
                    probes,
                });
            }
            tokio::time::sleep(self.settings.ready_poll_interval.min(timeout - elapsed)).await;
        }
    }

    async fn probe(&self) -> bool {
        let Some(kubeconfig) = self.kubeconfig_path.as_deref() else {
            debug!(cluster = %self.name, "no kubeconfig yet; probe skipped");
            return false;
        };
        let spec = self
            .kubectl(["get", "nodes"], kubeconfig)
            .timeout(Some(self.settings.probe_timeout));
        match self.executor.run(&spec).await {
            Ok(output) if output.success() => true,
            Ok(output) => {
                debug!(cluster = %self.name, exit_code = output.code(), "readiness probe failed");
                false
            }
            Err(err) => {
                debug!(cluster = %self.name, error = %err, "readiness probe failed");
                false
            }
        }
    }

    /// Short readiness check; `false` instead of [`ClusterError::NotReady`].
    ///
    /// Without exported credentials there is nothing to probe, so this
    /// answers `false` at once.
    pub async fn is_ready(&mut self) -> bool {
        if self.kubeconfig_path.is_none() {
            return false;
        }
        let timeout = self.settings.ready_check_timeout;
        self.wait_for_ready(timeout).await.is_ok()
    }

    /// Names of the cluster's nodes, without the `node/` prefix.
    pub async fn get_nodes(&self) -> Result<Vec<String>> {
        let Some(kubeconfig) = self.kubeconfig_path.as_deref() else {
            return Err(ClusterError::CredentialsMissing {
                name: self.name.clone(),
                message: "cluster not created or kubeconfig not exported".to_string(),
            });
        };

        let timeout = self.settings.node_query_timeout;
        let spec = self
            .kubectl(["get", "nodes", "-o", "name"], kubeconfig)
            .timeout(Some(timeout));
        let output = match self.executor.run(&spec).await {
            Ok(output) => output,
            Err(err) if err.is_timeout() => {
                return Err(ClusterError::NodeQueryTimedOut {
                    name: self.name.clone(),
                    timeout,
                });
            }
            Err(err) => {
                return Err(ClusterError::NodeQueryFailed {
                    name: self.name.clone(),
                    diagnostics: err.diagnostics().map(str::to_string),
                    message: err.to_string(),
                });
            }
        };

        if !output.success() {
            let stderr = output.stderr().trim();
            return Err(ClusterError::NodeQueryFailed {
                name: self.name.clone(),
                message: format!("{} exited with code {}", output.command_line(), output.code()),
                diagnostics: (!stderr.is_empty()).then(|| stderr.to_string()),
            });
        }

        Ok(output
            .stdout()
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| line.strip_prefix(NODE_PREFIX).unwrap_or(line).to_string())
            .collect())
    }

    /// Adopt a cluster that is already running under this name.
    pub async fn attach(&mut self) -> Result<()> {
        if !self.exists().await {
            return Err(ClusterError::NotFound {
                name: self.name.clone(),
            });
        }
        if let Err(failure) = self.export_kubeconfig().await {
            return Err(ClusterError::CredentialsMissing {
                name: self.name.clone(),
                message: failure.message,
            });
        }
        self.state = LifecycleState::Created;
        info!(cluster = %self.name, "attached to existing cluster");
        Ok(())
    }

    /// Remove the exported kubeconfig without touching the cluster.
    ///
    /// A verified cluster drops back to `Created`: it still runs, but can no
    /// longer be probed until credentials are exported again.
    pub fn discard_credentials(&mut self) {
        if let Some(path) = self.kubeconfig_path.take() {
            remove_file(&path);
        }
        if self.state == LifecycleState::Verified {
            self.state = LifecycleState::Created;
        }
    }

    fn kind<'a>(&self, args: impl IntoIterator<Item = &'a str>) -> CommandSpec {
        let mut spec = CommandSpec::new([tool_arg(&self.settings.kind_bin)]);
        for arg in args {
            spec = spec.arg(arg);
        }
        spec
    }

    fn kubectl<'a>(&self, args: impl IntoIterator<Item = &'a str>, kubeconfig: &Path) -> CommandSpec {
        let mut spec = CommandSpec::new([tool_arg(&self.settings.kubectl_bin)])
            .env("KUBECONFIG", kubeconfig.display().to_string());
        for arg in args {
            spec = spec.arg(arg);
        }
        spec
    }
}

impl<E: Executor> fmt::Display for KindCluster<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KindCluster(name={}, state={})", self.name, self.state)
    }
}

impl<E: Executor> fmt::Debug for KindCluster<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KindCluster")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("kubeconfig_path", &self.kubeconfig_path)
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

/// Exact-name membership in a `kind get clusters` listing.
pub fn cluster_listed(listing: &str, name: &str) -> bool {
    listing
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .any(|line| line == name)
}

fn tool_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn remove_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed kubeconfig"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove kubeconfig"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::ProcessOutput;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    /// Scripted stand-in for kind, docker and kubectl that records every argv.
    #[derive(Debug, Default)]
    struct FakeTools {
        calls: Mutex<Vec<Vec<String>>>,
        listed: AtomicBool,
        listing: Mutex<Option<String>>,
        docker_missing: bool,
        create_fails: bool,
        export_fails: bool,
        delete_fails: bool,
        node_query_times_out: bool,
        node_query_fails: bool,
        /// Probes that fail before the first success; `u32::MAX` never succeeds.
        failing_probes: AtomicU32,
    }

    impl FakeTools {
        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }

        fn count(&self, prefix: &[&str]) -> usize {
            self.calls()
                .iter()
                .filter(|argv| argv.len() >= prefix.len() && argv.iter().zip(prefix).all(|(a, p)| a == p))
                .count()
        }

        fn respond(&self, argv: &[String]) -> crate::exec::Result<ProcessOutput> {
            let args: Vec<&str> = argv.iter().map(String::as_str).collect();
            let ok = |stdout: &str| Ok(ProcessOutput::new(argv.to_vec(), 0, stdout, "", 1));
            let fail = |stderr: &str| Ok(ProcessOutput::new(argv.to_vec(), 1, "", stderr, 1));

            match args.as_slice() {
                ["docker", "version"] if self.docker_missing => Err(ExecError::NotFound {
                    program: "docker".to_string(),
                }),
                [_, "version"] => ok("v0.23.0"),
                ["kind", "get", "clusters"] => {
                    if let Some(listing) = self.listing.lock().unwrap().clone() {
                        return ok(&listing);
                    }
                    if self.listed.load(Ordering::SeqCst) {
                        ok("other\ntest-cluster\n")
                    } else {
                        ok("No kind clusters found.\n")
                    }
                }
                ["kind", "create", "cluster", ..] => {
                    self.listed.store(true, Ordering::SeqCst);
                    if self.create_fails {
                        fail("ERROR: failed to create cluster: node image missing")
                    } else {
                        ok("Creating cluster ...")
                    }
                }
                ["kind", "export", "kubeconfig", ..] if self.export_fails => fail("ERROR: no such cluster"),
                ["kind", "export", "kubeconfig", ..] => ok(""),
                ["kind", "delete", "cluster", ..] if self.delete_fails => fail("ERROR: docker daemon gone"),
                ["kind", "delete", "cluster", ..] => {
                    self.listed.store(false, Ordering::SeqCst);
                    ok("Deleting cluster ...")
                }
                ["kubectl", "get", "nodes"] => {
                    let remaining = self.failing_probes.load(Ordering::SeqCst);
                    if remaining == 0 {
                        ok("NAME STATUS\ntest-cluster-control-plane Ready")
                    } else {
                        if remaining != u32::MAX {
                            self.failing_probes.store(remaining - 1, Ordering::SeqCst);
                        }
                        fail("The connection to the server was refused")
                    }
                }
                ["kubectl", "get", "nodes", "-o", "name"] if self.node_query_times_out => {
                    Err(ExecError::TimedOut {
                        command: argv.join(" "),
                        timeout: Duration::from_secs(30),
                    })
                }
                ["kubectl", "get", "nodes", "-o", "name"] if self.node_query_fails => {
                    fail("error: You must be logged in to the server (Unauthorized)")
                }
                ["kubectl", "get", "nodes", "-o", "name"] => {
                    ok("node/test-cluster-control-plane\nnode/test-cluster-worker\n\n")
                }
                _ => panic!("unexpected command: {args:?}"),
            }
        }
    }

    impl Executor for FakeTools {
        async fn run(&self, spec: &CommandSpec) -> crate::exec::Result<ProcessOutput> {
            self.calls.lock().unwrap().push(spec.argv.clone());
            let output = self.respond(&spec.argv)?;
            if spec.check {
                output.into_checked()
            } else {
                Ok(output)
            }
        }
    }

    fn fast_settings() -> ClusterSettings {
        ClusterSettings {
            ready_poll_interval: Duration::from_millis(5),
            ..ClusterSettings::default()
        }
    }

    fn cluster_with(tools: FakeTools, spec: ClusterSpec) -> (KindCluster<Arc<FakeTools>>, Arc<FakeTools>) {
        let tools = Arc::new(tools);
        let cluster = KindCluster::new(spec, fast_settings(), Arc::clone(&tools)).unwrap();
        (cluster, tools)
    }

    fn named() -> ClusterSpec {
        ClusterSpec {
            name: Some("test-cluster".to_string()),
            ..ClusterSpec::default()
        }
    }

    #[test]
    fn negative_timeout_is_invalid() {
        let spec = ClusterSpec {
            timeout_sec: -1,
            ..ClusterSpec::default()
        };
        let err = KindCluster::new(spec, ClusterSettings::default(), FakeTools::default()).unwrap_err();
        assert_eq!(err.kind(), ClusterErrorKind::InvalidConfiguration);
    }

    #[test]
    fn zero_timeout_is_accepted() {
        let spec = ClusterSpec {
            timeout_sec: 0,
            ..ClusterSpec::default()
        };
        let cluster = KindCluster::new(spec, ClusterSettings::default(), FakeTools::default()).unwrap();
        assert_eq!(cluster.spec().timeout(), None);
    }

    #[test]
    fn invalid_explicit_name_is_rejected() {
        let spec = ClusterSpec {
            name: Some("Bad Name".to_string()),
            ..ClusterSpec::default()
        };
        let err = KindCluster::new(spec, ClusterSettings::default(), FakeTools::default()).unwrap_err();
        assert_eq!(err.kind(), ClusterErrorKind::InvalidConfiguration);
    }

    #[test]
    fn new_cluster_has_generated_name_and_no_credentials() {
        let cluster = KindCluster::new(ClusterSpec::default(), ClusterSettings::default(), FakeTools::default()).unwrap();
        assert!(cluster.name().starts_with(naming::NAME_PREFIX));
        assert!(cluster.kubeconfig_path().is_none());
        assert_eq!(cluster.state(), LifecycleState::Uninitialized);
        assert_eq!(
            cluster.to_string(),
            format!("KindCluster(name={}, state=UNINITIALIZED)", cluster.name())
        );
    }

    #[test]
    fn cluster_listed_requires_exact_match() {
        let listing = "  alpha  \n\n test-cluster-2\ntest\n  test-cluster \n";
        assert!(cluster_listed(listing, "test-cluster"));
        assert!(cluster_listed(listing, "alpha"));
        assert!(!cluster_listed(listing, "test-clus"));
        assert!(!cluster_listed(listing, "cluster"));
        assert!(!cluster_listed("", "test-cluster"));
    }

    #[tokio::test]
    async fn exists_rejects_near_matches() {
        let tools = FakeTools::default();
        *tools.listing.lock().unwrap() = Some("test-cluster-old\nmy-test-cluster\n".to_string());
        let (cluster, _) = cluster_with(tools, named());
        assert!(!cluster.exists().await);
    }

    #[tokio::test]
    async fn create_full_cycle() {
        let (mut cluster, tools) = cluster_with(FakeTools::default(), named());

        cluster.create().await.unwrap();
        assert_eq!(cluster.state(), LifecycleState::Verified);
        let kubeconfig = cluster.kubeconfig_path().unwrap().to_path_buf();
        assert!(kubeconfig.exists());

        let create = tools
            .calls()
            .into_iter()
            .find(|argv| argv[..2] == ["kind", "create"])
            .unwrap();
        assert_eq!(create, ["kind", "create", "cluster", "--name", "test-cluster", "--wait=60s"]);

        assert_eq!(
            cluster.get_nodes().await.unwrap(),
            vec!["test-cluster-control-plane", "test-cluster-worker"]
        );

        cluster.delete().await.unwrap();
        assert_eq!(cluster.state(), LifecycleState::Deleted);
        assert!(cluster.kubeconfig_path().is_none());
        assert!(!kubeconfig.exists());
        assert_eq!(tools.count(&["kind", "delete", "cluster"]), 1);
    }

    #[tokio::test]
    async fn create_is_noop_once_created() {
        let (mut cluster, tools) = cluster_with(FakeTools::default(), named());
        cluster.create().await.unwrap();
        cluster.create().await.unwrap();
        assert_eq!(tools.count(&["kind", "create", "cluster"]), 1);
        cluster.delete().await.unwrap();
    }

    #[tokio::test]
    async fn create_passes_synthesized_config() {
        let spec = ClusterSpec {
            node_image: Some("kindest/node:v1.30.0".to_string()),
            ..named()
        };
        let (mut cluster, tools) = cluster_with(FakeTools::default(), spec);
        cluster.create().await.unwrap();

        let create = tools
            .calls()
            .into_iter()
            .find(|argv| argv[..2] == ["kind", "create"])
            .unwrap();
        let config_index = create.iter().position(|a| a == "--config").unwrap();
        let config_path = PathBuf::from(&create[config_index + 1]);
        assert!(config_path.file_name().unwrap().to_string_lossy().starts_with("kind-config-"));
        // Removed once creation finished.
        assert!(!config_path.exists());
        assert_eq!(create.last().unwrap(), "--wait=60s");
        cluster.delete().await.unwrap();
    }

    #[tokio::test]
    async fn missing_prerequisite_never_creates() {
        let tools = FakeTools {
            docker_missing: true,
            ..FakeTools::default()
        };
        let (mut cluster, tools) = cluster_with(tools, named());

        let err = cluster.create().await.unwrap_err();
        assert_eq!(err.kind(), ClusterErrorKind::PrerequisiteMissing);
        assert!(err.hint().is_some());
        assert_eq!(tools.count(&["kind", "create"]), 0);
        assert_eq!(cluster.state(), LifecycleState::Uninitialized);
    }

    #[tokio::test]
    async fn existing_cluster_is_not_reused() {
        let tools = FakeTools::default();
        tools.listed.store(true, Ordering::SeqCst);
        let (mut cluster, tools) = cluster_with(tools, named());

        let err = cluster.create().await.unwrap_err();
        assert!(matches!(err, ClusterError::AlreadyExists { ref name } if name == "test-cluster"));
        assert_eq!(tools.count(&["kind", "create"]), 0);
    }

    #[tokio::test]
    async fn delete_of_never_created_cluster_runs_nothing() {
        let (mut cluster, tools) = cluster_with(FakeTools::default(), named());
        cluster.delete().await.unwrap();
        assert_eq!(tools.count(&["kind", "delete"]), 0);
        assert_eq!(cluster.state(), LifecycleState::Uninitialized);
    }

    #[tokio::test]
    async fn keep_cluster_skips_deletion() {
        let spec = ClusterSpec {
            keep_cluster: true,
            ..named()
        };
        let (mut cluster, tools) = cluster_with(FakeTools::default(), spec);
        cluster.create().await.unwrap();
        cluster.delete().await.unwrap();
        assert_eq!(tools.count(&["kind", "delete"]), 0);
        assert_eq!(tools.count(&["kind", "get", "clusters"]), 1);
        assert_eq!(cluster.state(), LifecycleState::Verified);
        cluster.discard_credentials();
    }

    #[tokio::test]
    async fn failed_delete_still_removes_kubeconfig() {
        let tools = FakeTools {
            delete_fails: true,
            ..FakeTools::default()
        };
        let (mut cluster, _) = cluster_with(tools, named());
        cluster.create().await.unwrap();
        let kubeconfig = cluster.kubeconfig_path().unwrap().to_path_buf();

        let err = cluster.delete().await.unwrap_err();
        assert_eq!(err.kind(), ClusterErrorKind::DeletionFailed);
        assert_eq!(err.diagnostics(), Some("ERROR: docker daemon gone"));
        assert!(cluster.kubeconfig_path().is_none());
        assert!(!kubeconfig.exists());
    }

    #[tokio::test]
    async fn ready_after_one_failed_probe() {
        let (mut cluster, tools) = cluster_with(FakeTools::default(), named());
        cluster.attach_for_test().await;
        tools.failing_probes.store(1, Ordering::SeqCst);

        cluster.wait_for_ready(Duration::from_secs(5)).await.unwrap();
        assert_eq!(tools.count(&["kubectl", "get", "nodes"]), 2);
        assert_eq!(cluster.state(), LifecycleState::Verified);
        cluster.discard_credentials();
    }

    #[tokio::test]
    async fn never_ready_times_out() {
        let (mut cluster, tools) = cluster_with(FakeTools::default(), named());
        cluster.attach_for_test().await;
        tools.failing_probes.store(u32::MAX, Ordering::SeqCst);

        let err = cluster.wait_for_ready(Duration::from_millis(50)).await.unwrap_err();
        match err {
            ClusterError::NotReady { probes, .. } => assert!(probes >= 2, "probes = {probes}"),
            e => panic!("expected NotReady, got {e:?}"),
        }
        assert_eq!(cluster.state(), LifecycleState::Created);
        cluster.discard_credentials();
    }

    #[tokio::test]
    async fn is_ready_maps_timeout_to_false() {
        let mut settings = fast_settings();
        settings.ready_check_timeout = Duration::from_millis(20);
        let tools = Arc::new(FakeTools::default());
        let mut cluster = KindCluster::new(named(), settings, Arc::clone(&tools)).unwrap();
        cluster.attach_for_test().await;
        tools.failing_probes.store(u32::MAX, Ordering::SeqCst);

        assert!(!cluster.is_ready().await);
        assert!(tools.count(&["kubectl", "get", "nodes"]) >= 1);
        assert_eq!(cluster.state(), LifecycleState::Created);
        cluster.discard_credentials();
    }

    #[tokio::test]
    async fn is_ready_without_credentials_answers_at_once() {
        let (mut cluster, tools) = cluster_with(FakeTools::default(), named());
        assert!(cluster.settings.ready_check_timeout >= Duration::from_secs(1));

        let started = Instant::now();
        assert!(!cluster.is_ready().await);
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(tools.count(&["kubectl"]), 0);
        assert_eq!(cluster.state(), LifecycleState::Uninitialized);
    }

    #[tokio::test]
    async fn get_nodes_timeout_is_reported() {
        let tools = FakeTools {
            node_query_times_out: true,
            ..FakeTools::default()
        };
        let (mut cluster, _) = cluster_with(tools, named());
        cluster.attach_for_test().await;

        let err = cluster.get_nodes().await.unwrap_err();
        assert_eq!(err.kind(), ClusterErrorKind::NodeQueryTimedOut);
        assert!(matches!(
            err,
            ClusterError::NodeQueryTimedOut { ref name, timeout }
                if name == "test-cluster" && timeout == cluster.settings.node_query_timeout
        ));
        cluster.discard_credentials();
    }

    #[tokio::test]
    async fn get_nodes_failure_carries_stderr() {
        let tools = FakeTools {
            node_query_fails: true,
            ..FakeTools::default()
        };
        let (mut cluster, _) = cluster_with(tools, named());
        cluster.attach_for_test().await;

        let err = cluster.get_nodes().await.unwrap_err();
        assert_eq!(err.kind(), ClusterErrorKind::NodeQueryFailed);
        assert_eq!(
            err.diagnostics(),
            Some("error: You must be logged in to the server (Unauthorized)")
        );
        cluster.discard_credentials();
    }

    #[tokio::test]
    async fn discarding_credentials_drops_to_created() {
        let (mut cluster, tools) = cluster_with(FakeTools::default(), named());
        cluster.create().await.unwrap();
        assert_eq!(cluster.state(), LifecycleState::Verified);

        cluster.discard_credentials();
        assert_eq!(cluster.state(), LifecycleState::Created);
        assert!(cluster.kubeconfig_path().is_none());
        assert!(!cluster.is_ready().await);
        assert_eq!(tools.count(&["kind", "delete"]), 0);
        assert_eq!(cluster.state(), LifecycleState::Created);

        cluster.delete().await.unwrap();
        assert_eq!(cluster.state(), LifecycleState::Deleted);
    }

    #[tokio::test]
    async fn get_nodes_requires_credentials() {
        let (cluster, _) = cluster_with(FakeTools::default(), named());
        let err = cluster.get_nodes().await.unwrap_err();
        assert_eq!(err.kind(), ClusterErrorKind::CredentialsMissing);
    }

    #[tokio::test]
    async fn creation_failure_rolls_back() {
        let tools = FakeTools {
            create_fails: true,
            ..FakeTools::default()
        };
        let (mut cluster, tools) = cluster_with(tools, named());

        let err = cluster.create().await.unwrap_err();
        match &err {
            ClusterError::CreationFailed {
                diagnostics, residual, ..
            } => {
                assert_eq!(
                    diagnostics.as_deref(),
                    Some("ERROR: failed to create cluster: node image missing")
                );
                assert!(residual.is_none());
            }
            e => panic!("expected CreationFailed, got {e:?}"),
        }
        assert!(err.hint().is_none());
        assert_eq!(tools.count(&["kind", "delete", "cluster"]), 1);
        assert!(cluster.kubeconfig_path().is_none());
    }

    #[tokio::test]
    async fn export_failure_reports_residual_when_rollback_fails() {
        let tools = FakeTools {
            export_fails: true,
            delete_fails: true,
            ..FakeTools::default()
        };
        let (mut cluster, _) = cluster_with(tools, named());

        let err = cluster.create().await.unwrap_err();
        match &err {
            ClusterError::CreationFailed { message, residual, .. } => {
                assert!(message.contains("export kubeconfig"), "{message}");
                assert!(residual.as_deref().unwrap().contains("failed to delete"));
            }
            e => panic!("expected CreationFailed, got {e:?}"),
        }
        assert!(err.hint().unwrap().contains("kind delete cluster --name test-cluster"));
        assert_eq!(cluster.state(), LifecycleState::Uninitialized);
        assert!(cluster.kubeconfig_path().is_none());
    }

    #[tokio::test]
    async fn keep_cluster_reports_skipped_rollback() {
        let tools = FakeTools {
            create_fails: true,
            ..FakeTools::default()
        };
        let spec = ClusterSpec {
            keep_cluster: true,
            ..named()
        };
        let (mut cluster, tools) = cluster_with(tools, spec);

        let err = cluster.create().await.unwrap_err();
        assert!(matches!(
            err,
            ClusterError::CreationFailed { residual: Some(ref r), .. } if r.contains("keep_cluster")
        ));
        assert_eq!(tools.count(&["kind", "delete"]), 0);
    }

    #[tokio::test]
    async fn attach_requires_listed_cluster() {
        let (mut cluster, tools) = cluster_with(FakeTools::default(), named());
        let err = cluster.attach().await.unwrap_err();
        assert_eq!(err.kind(), ClusterErrorKind::NotFound);

        tools.listed.store(true, Ordering::SeqCst);
        cluster.attach().await.unwrap();
        assert_eq!(cluster.state(), LifecycleState::Created);
        assert!(cluster.kubeconfig_path().unwrap().exists());
        cluster.discard_credentials();
    }

    impl KindCluster<Arc<FakeTools>> {
        async fn attach_for_test(&mut self) {
            self.executor.listed.store(true, Ordering::SeqCst);
            self.attach().await.unwrap();
        }
    }
}
