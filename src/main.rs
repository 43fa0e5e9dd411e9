//! ssh-mcp - SSH tools for MCP hosts
//!
//! Speaks newline-delimited JSON-RPC on stdin/stdout and exposes SSH
//! connect, execute, file transfer and directory listing as MCP tools.
//!
//! ## Subcommands
//!
//! **serve** (default): run the stdio server until stdin closes or Ctrl-C.
//!
//! **tools**: print the `tools/list` payload.
//!
//! **config**: print the effective configuration as TOML.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser as ClapParser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ssh_mcp::config::{default_config_path, ServerConfig};
use ssh_mcp::mcp::tools;
use ssh_mcp::server;
use ssh_mcp::transport::memory::MemoryHost;
use ssh_mcp::transport::ssh::SshConnector;
use ssh_mcp::transport::Connector;

/// ssh-mcp - SSH tools for MCP hosts
///
/// Run it as a stdio MCP server from an AI host; all logging goes to stderr.
#[derive(ClapParser, Debug)]
#[command(name = "ssh-mcp", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to the TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Transport used to reach remote hosts
    #[arg(long, value_enum, default_value_t = TransportKind::Ssh, global = true)]
    transport: TransportKind,

    /// Maximum number of concurrent connections
    #[arg(long, env = "SSH_MCP_MAX_CONNECTIONS", global = true)]
    max_connections: Option<usize>,

    /// Default command timeout in seconds
    #[arg(long, env = "SSH_MCP_COMMAND_TIMEOUT", global = true)]
    command_timeout: Option<u64>,

    /// Seconds between health sweeps
    #[arg(long, env = "SSH_MCP_HEALTH_SWEEP_INTERVAL", global = true)]
    health_sweep_interval: Option<u64>,

    /// Try to reconnect dropped sessions before evicting them
    #[arg(long, env = "SSH_MCP_AUTO_RECONNECT", global = true)]
    auto_reconnect: bool,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Commands {
    /// Run the MCP server over stdio
    Serve,
    /// Print the tool catalog as JSON
    Tools,
    /// Print the effective configuration as TOML
    Config,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum TransportKind {
    /// Real SSH connections (libssh2)
    Ssh,
    /// In-process simulated host, for demos and protocol testing
    Memory,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing_stderr();

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    let result = runtime.block_on(run(cli));
    // A pending stdin read would otherwise keep the runtime alive after Ctrl-C.
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = effective_config(&cli)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_serve(config, cli.transport).await,
        Commands::Tools => {
            println!("{}", serde_json::to_string_pretty(&tools::list_tools_payload())?);
            Ok(())
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

/// Config file (or defaults), then CLI/env overrides, then validation.
fn effective_config(cli: &Cli) -> anyhow::Result<ServerConfig> {
    let path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = match ServerConfig::load(&path)? {
        Some(config) => {
            tracing::info!(path = %path.display(), "loaded config");
            config
        }
        None if cli.config.is_some() => {
            anyhow::bail!("config file {} does not exist", path.display());
        }
        None => ServerConfig::default(),
    };

    if let Some(max) = cli.max_connections {
        config.max_connections = max;
    }
    if let Some(secs) = cli.command_timeout {
        config.command_timeout_secs = secs;
    }
    if let Some(secs) = cli.health_sweep_interval {
        config.health.sweep_interval_secs = secs;
    }
    if cli.auto_reconnect {
        config.reconnect.enabled = true;
    }
    config.validate()?;
    Ok(config)
}

/// Initialize tracing with stderr output.
///
/// stdout carries the JSON-RPC stream, so all tracing MUST go to stderr.
fn init_tracing_stderr() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ssh_mcp=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

// ── Serve mode ─────────────────────────────────────────────────────

async fn run_serve(config: ServerConfig, transport: TransportKind) -> anyhow::Result<()> {
    let connector: Arc<dyn Connector> = match transport {
        TransportKind::Ssh => Arc::new(SshConnector),
        TransportKind::Memory => {
            tracing::warn!("using the in-memory transport; no real hosts will be contacted");
            Arc::new(MemoryHost::new())
        }
    };
    tracing::info!(version = env!("CARGO_PKG_VERSION"), ?transport, "ssh-mcp starting");

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received Ctrl+C");
            signal_cancel.cancel();
        }
    });

    server::run(
        &config,
        connector,
        tokio::io::stdin(),
        tokio::io::stdout(),
        cancel,
    )
    .await
    .context("stdio server failed")
}
