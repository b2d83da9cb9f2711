//! kindlectl - command-line front end for kindle
//!
//! Creates, inspects and deletes disposable kind clusters, or runs a command
//! against a cluster that only lives for the duration of that command.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::{Args, Parser, Subcommand};
use kindle::{ClusterError, CommandSpec, ExecError, KindCluster, StreamLoggers, StreamingRunner, SystemExecutor};
use kindle_core::{Config, ConfigError, PortMapping};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;
use tracing_subscriber::{fmt, EnvFilter};

/// Disposable kind clusters from the command line.
#[derive(Parser, Debug)]
#[command(name = "kindlectl")]
#[command(about = "Create, inspect and delete disposable kind clusters")]
#[command(version)]
struct Cli {
    /// Config file path (default: $XDG_CONFIG_HOME/kindle/config when present)
    #[arg(long, global = true, env = "KINDLE_CONFIG")]
    config: Option<PathBuf>,

    /// Path to the kind binary
    #[arg(long, global = true)]
    kind_bin: Option<PathBuf>,

    /// Do not stream kind output into the log
    #[arg(long, global = true)]
    no_stream_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a cluster and keep it running
    Create(ClusterArgs),

    /// Delete a cluster
    Delete {
        /// Cluster name
        #[arg(long)]
        name: String,
    },

    /// Exit 0 if the cluster exists, 1 otherwise
    Exists {
        /// Cluster name
        #[arg(long)]
        name: String,
    },

    /// List the nodes of a running cluster
    Nodes {
        /// Cluster name
        #[arg(long)]
        name: String,
    },

    /// Run a command against a temporary cluster
    Run {
        #[command(flatten)]
        cluster: ClusterArgs,

        /// Command to run with KUBECONFIG pointing at the cluster
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

#[derive(Args, Debug)]
struct ClusterArgs {
    /// Cluster name (generated when omitted)
    #[arg(long)]
    name: Option<String>,

    /// Node image override
    #[arg(long)]
    image: Option<String>,

    /// Extra port mapping as container:host[/PROTO] (repeatable)
    #[arg(long = "port", value_parser = parse_port_mapping)]
    ports: Vec<PortMapping>,

    /// Explicit kind config file
    #[arg(long)]
    kind_config: Option<PathBuf>,

    /// Lifecycle timeout in seconds (0 = no timeout)
    #[arg(long, allow_negative_numbers = true)]
    timeout: Option<i64>,
}

impl ClusterArgs {
    fn apply(&self, config: &mut Config) {
        if self.name.is_some() {
            config.cluster_name.clone_from(&self.name);
        }
        if self.image.is_some() {
            config.node_image.clone_from(&self.image);
        }
        if !self.ports.is_empty() {
            config.extra_port_mappings.clone_from(&self.ports);
        }
        if self.kind_config.is_some() {
            config.cluster_config.clone_from(&self.kind_config);
        }
        if let Some(timeout) = self.timeout {
            config.cluster_timeout_sec = timeout;
        }
    }
}

fn parse_port_mapping(s: &str) -> Result<PortMapping, String> {
    s.parse()
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("failed to encode output: {0}")]
    Json(#[from] serde_json::Error),
}

impl CliError {
    fn hint(&self) -> Option<String> {
        match self {
            Self::Cluster(err) => err.hint(),
            _ => None,
        }
    }
}

/// Printed by `create`.
#[derive(Debug, Serialize)]
struct CreatedCluster {
    name: String,
    kubeconfig: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays machine-readable.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e}");
            if let Some(hint) = e.hint() {
                eprintln!("hint: {hint}");
            }
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<i32, CliError> {
    let mut config = load_config(cli.config.as_ref())?;
    if let Some(kind_bin) = cli.kind_bin {
        config.kind_bin = kind_bin;
    }
    if cli.no_stream_logs {
        config.stream_logs = false;
    }

    configure(&mut config, &cli.command);

    match cli.command {
        Command::Create(_) => run_create(&config).await,
        Command::Delete { .. } => run_delete(&config).await,
        Command::Exists { .. } => run_exists(&config).await,
        Command::Nodes { .. } => run_nodes(&config).await,
        Command::Run { command, .. } => run_scoped(&config, command).await,
    }
}

/// Fold the subcommand's flags into `config`.
///
/// `create` leaves `keep_cluster` as configured, so a failed creation is
/// still rolled back; a cluster that comes up stays running either way.
fn configure(config: &mut Config, command: &Command) {
    match command {
        Command::Create(args) | Command::Run { cluster: args, .. } => args.apply(config),
        Command::Delete { name } => {
            config.cluster_name = Some(name.clone());
            config.keep_cluster = false;
        }
        Command::Exists { name } | Command::Nodes { name } => {
            config.cluster_name = Some(name.clone());
        }
    }
}

/// Load the explicit config file, else the default one if it exists.
fn load_config(explicit: Option<&PathBuf>) -> Result<Config, ConfigError> {
    let path = match explicit {
        Some(path) => Some(path.clone()),
        None => default_config_path().filter(|path| path.is_file()),
    };

    let mut config = Config::default();
    if let Some(path) = path {
        debug!(path = %path.display(), "loading config");
        config.load_file(&path)?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
    }
    config.validate()?;
    Ok(config)
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("kindle").join("config"))
}

fn cluster(config: &Config) -> Result<KindCluster, CliError> {
    config.validate()?;
    Ok(KindCluster::from_config(config, SystemExecutor::with_tracing(config))?)
}

async fn run_create(config: &Config) -> Result<i32, CliError> {
    let mut cluster = cluster(config)?;
    cluster.create().await?;

    let created = CreatedCluster {
        name: cluster.name().to_string(),
        kubeconfig: cluster.kubeconfig_path().map(PathBuf::from),
    };
    println!("{}", serde_json::to_string_pretty(&created)?);
    Ok(0)
}

async fn run_delete(config: &Config) -> Result<i32, CliError> {
    let mut cluster = cluster(config)?;
    cluster.delete().await?;
    println!("deleted {}", cluster.name());
    Ok(0)
}

async fn run_exists(config: &Config) -> Result<i32, CliError> {
    let cluster = cluster(config)?;
    Ok(if cluster.exists().await { 0 } else { 1 })
}

async fn run_nodes(config: &Config) -> Result<i32, CliError> {
    let mut cluster = cluster(config)?;
    cluster.attach().await?;
    let nodes = cluster.get_nodes().await;
    cluster.discard_credentials();

    for node in nodes? {
        println!("{node}");
    }
    Ok(0)
}

/// Run `command` against a cluster that is deleted afterwards.
///
/// The command inherits this process's stdout and stderr; its exit code
/// becomes ours.
async fn run_scoped(config: &Config, command: Vec<String>) -> Result<i32, CliError> {
    let mut cluster = cluster(config)?;
    let runner = StreamingRunner::new(StreamLoggers::disabled(), config.drain_timeout());

    let output = cluster
        .scoped(|handle| async move {
            let spec = CommandSpec::new(command)
                .env("KUBECONFIG", handle.kubeconfig_path.display().to_string());
            runner.run(&spec).await
        })
        .await??;
    Ok(output.code())
}
