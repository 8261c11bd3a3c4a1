use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::info;
use uhttpd_gw::{config::AppConfig, context::AppContext, logging};

#[derive(Parser)]
#[command(name = "uhttpd-gw")]
#[command(about = "HTTP server with a JSON-RPC gateway to the system bus", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server
    Serve(ServeArgs),
    /// Print the effective configuration
    Config(ServeArgs),
}

#[derive(Args, Serialize)]
struct ServeArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, short = 'p')]
    listen: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    max_connections: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    max_request_size: Option<usize>,

    /// Seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, short = 'T')]
    network_timeout: Option<u64>,

    /// Seconds; 0 disables keep-alive
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, short = 'k')]
    http_keepalive: Option<u64>,

    /// Seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, short = 't')]
    script_timeout: Option<u64>,

    /// Enable the JSON-RPC gateway under this URL prefix
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, short = 'u')]
    ubus_prefix: Option<String>,

    /// Skip session access checks
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, short = 'a')]
    ubus_noauth: Option<bool>,

    /// Bus bridge address
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, short = 'U')]
    ubus_socket: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    simulation: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    log_json: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, short = 'v')]
    verbose: Option<bool>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve(args) => {
            let config = AppConfig::new(cli.config.as_deref(), Some(args))
                .context("Failed to load configuration")?;
            logging::init(logging::LogConfig {
                json: config.log_json,
                verbose: config.verbose,
            });
            run_server(config).await.context("Server failed")?
        }
        Commands::Config(args) => {
            let config = AppConfig::new(cli.config.as_deref(), Some(args))
                .context("Failed to load configuration")?;
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

async fn run_server(config: AppConfig) -> Result<()> {
    let listen = config.listen.clone();
    let ctx = AppContext::connect(config)
        .await
        .context("Failed to connect to the bus")?;
    let server = ctx.server();

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
            let _ = shutdown_tx.send(());
        }
    });

    server.listen(listener, shutdown_rx).await
}
