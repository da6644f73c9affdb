//! Chatr - TCP chat relay
//!
//! `chatr server` runs the relay, `chatr client` joins it from a terminal.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chatr::{
    client::TerminalPresenter, config::ConfigManager, metrics::MetricsServer, ChatServer,
    ClientSession, Config, RelayMetrics, ShutdownCoordinator,
};

/// CLI arguments for chatr
#[derive(Parser, Debug)]
#[command(name = "chatr")]
#[command(about = "Chatr - TCP chat relay server and terminal client")]
#[command(version)]
#[command(long_about = "
Chatr - TCP chat relay server and terminal client

Configuration priority (highest to lowest):
1. Command-line arguments
2. Environment variables
3. Configuration file
4. Built-in defaults

Environment variables (also read from ./.env; variables already set win):
  CHATR_HOST, HOST          - Host to bind (server) or dial (client)
  CHATR_PORT, PORT          - Port to bind (server) or dial (client)
  CHATR_USERNAME, USERNAME  - Display name announced by the client
  CHATR_IDLE_TIMEOUT        - Server idle read timeout (e.g., 2m, 90s)
  CHATR_METRICS_ADDR        - Prometheus scrape address (e.g., 127.0.0.1:9090)
  CHATR_LOG_LEVEL           - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, default_value = "chatr.toml", global = true)]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat relay server
    Server(ServerArgs),
    /// Join a chat relay from the terminal
    Client(ClientArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Host to bind
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Port to bind
    #[arg(short = 'P', long)]
    pub port: Option<u16>,

    /// Disconnect clients idle for this long (e.g., 2m, 90s)
    #[arg(long, value_parser = humantime::parse_duration)]
    pub idle_timeout: Option<Duration>,

    /// Serve Prometheus metrics on this address
    #[arg(long)]
    pub metrics_addr: Option<SocketAddr>,
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Server host
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Server port
    #[arg(short = 'P', long)]
    pub port: Option<u16>,

    /// Username to display in the chat
    #[arg(short, long)]
    pub username: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let mut config = ConfigManager::load(&args.config)?;
    if let Some(level) = &args.log_level {
        config.monitoring.log_level = level.clone();
    }

    match args.command {
        Command::Server(server_args) => {
            config.merge_server_args(
                server_args.host.as_deref(),
                server_args.port,
                server_args.idle_timeout,
                server_args.metrics_addr,
            );
            config
                .validate()
                .context("Final configuration validation failed")?;
            init_tracing(&config, args.verbose, false)?;
            run_server(config).await
        }
        Command::Client(client_args) => {
            config.merge_client_args(
                client_args.host.as_deref(),
                client_args.port,
                client_args.username.as_deref(),
            );
            config
                .validate()
                .and_then(|_| config.validate_client_target())
                .context("Final configuration validation failed")?;
            init_tracing(&config, args.verbose, true)?;
            run_client(config).await
        }
    }
}

async fn run_server(config: Config) -> Result<()> {
    info!(
        "Starting chatr server v{} on {}",
        env!("CARGO_PKG_VERSION"),
        config.server.address()
    );
    info!("Idle timeout: {:?}", config.server.idle_timeout);

    let shutdown_coordinator = ShutdownCoordinator::new(config.server.shutdown_timeout);
    let metrics = Arc::new(RelayMetrics::new()?);

    let metrics_handle = match config.monitoring.metrics_addr {
        Some(addr) => {
            let metrics_server = MetricsServer::bind(Arc::clone(&metrics), addr).await?;
            Some(tokio::spawn(async move {
                if let Err(e) = metrics_server.start().await {
                    error!("Metrics server error: {}", e);
                }
            }))
        }
        None => None,
    };

    let server = Arc::new(ChatServer::bind(Arc::new(config), metrics).await?);

    let server_handle = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(e) = server.start().await {
                error!("Server error: {}", e);
            }
        })
    };

    info!("Press Ctrl+C or send SIGTERM/SIGINT to shut down");
    if let Err(e) = shutdown_coordinator.listen_for_signals().await {
        error!("Error setting up signal handlers: {}", e);
    }

    shutdown_coordinator.shutdown_server(&server).await?;

    if let Err(e) = server_handle.await {
        if !e.is_cancelled() {
            error!("Server task failed: {}", e);
        }
    }

    if let Some(handle) = metrics_handle {
        handle.abort();
    }

    info!("Server shutdown complete");
    Ok(())
}

async fn run_client(config: Config) -> Result<()> {
    let client = &config.client;
    info!("Connecting to server at {} as {}...", client.address(), client.username);

    let session = ClientSession::connect(&client.host, client.port, &client.username, TerminalPresenter).await?;
    let mut input = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = input.next_line() => match line {
                Ok(Some(text)) => session.send(&text).await,
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to read input: {}", e);
                    break;
                }
            },
            _ = session.wait() => return Ok(()),
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.close().await
}

/// Initialize tracing/logging
fn init_tracing(config: &Config, verbose: bool, to_stderr: bool) -> Result<()> {
    let log_level = if verbose {
        "debug"
    } else {
        config.monitoring.log_level.as_str()
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_level(true)
        .with_ansi(!to_stderr);

    if to_stderr {
        tracing_subscriber::registry()
            .with(fmt_layer.with_writer(std::io::stderr))
            .with(env_filter)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(fmt_layer.with_thread_ids(true))
            .with(env_filter)
            .try_init()?;
    }

    Ok(())
}
