//! nodeshiftd — the nodeshift daemon.
//!
//! Single binary that assembles the state store, the upgrade orchestrator
//! and the REST API.
//!
//! # Usage
//!
//! ```text
//! nodeshiftd standalone --config nodeshift.toml --port 8443 --data-dir /var/lib/nodeshift
//! nodeshiftd check-config --config nodeshift.toml
//! ```

mod standalone;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use nodeshift_core::NodeshiftConfig;
use nodeshift_state::NodePool;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,nodeshiftd=debug,nodeshift=debug";

#[derive(Parser)]
#[command(name = "nodeshiftd", about = "nodeshift node-pool upgrade daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the API server and orchestrator in one process.
    Standalone {
        /// Path to nodeshift.toml.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides `server.port`).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state (overrides `server.data_dir`).
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Parse a config file and print what it resolves to.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Standalone {
            config,
            port,
            data_dir,
        } => {
            let config = match config {
                Some(path) => NodeshiftConfig::from_file(&path)?,
                None => NodeshiftConfig::default(),
            };
            let port = port.unwrap_or_else(|| config.port());
            let data_dir = data_dir.unwrap_or_else(|| config.data_dir());
            standalone::run(config, port, data_dir).await
        }
        Command::CheckConfig { config } => check_config(&config),
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn check_config(path: &std::path::Path) -> anyhow::Result<()> {
    let config = NodeshiftConfig::from_file(path)?;
    let settings = config.orchestrator_settings()?;

    println!("cluster:        {}", config.cluster_name());
    println!("listen port:    {}", config.port());
    println!("data dir:       {}", config.data_dir().display());
    println!("health timeout: {:?}", settings.health_timeout);
    println!("poll interval:  {:?}", settings.poll_interval);
    println!(
        "retries:        {} (backoff {:?})",
        settings.retry_limit, settings.retry_backoff
    );
    println!(
        "thresholds:     unhealthy {} / ready {}",
        settings.unhealthy_threshold, settings.ready_threshold
    );

    for cfg in &config.pools {
        let pool = NodePool::try_from(cfg)?;
        pool.validate()?;
        println!(
            "pool {}: {} x {} ({:?})",
            pool.id, pool.desired_count, pool.current_version, pool.strategy
        );
    }
    Ok(())
}
