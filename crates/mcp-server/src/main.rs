//! mcp-server binary entry point.

use clap::Parser;
use mcp_server::auth::AuthStore;
use mcp_server::{ConfigOverrides, McpServer, ServerConfig};
use std::path::PathBuf;
use tracing::{error, info};

/// mcp-server: MetaTrader Connection Protocol broker
#[derive(Parser, Debug)]
#[command(name = "mcp-server", version, about = "MetaTrader Connection Protocol broker")]
struct Cli {
    /// Listen address
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.mcp/config.toml")]
    config: String,

    /// Accept commands without authentication
    #[arg(long)]
    no_auth: bool,

    /// Maximum concurrent connections
    #[arg(long)]
    max_clients: Option<usize>,

    /// Seconds to wait for the EA to answer a command
    #[arg(long)]
    command_timeout: Option<u64>,

    /// Shorthand for --log-level debug
    #[arg(long)]
    debug: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let level = if cli.debug { "debug" } else { cli.log_level.as_str() };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting mcp-server");

    let config_path = PathBuf::from(&cli.config);
    let overrides = ConfigOverrides {
        host: cli.host,
        port: cli.port,
        no_auth: cli.no_auth,
        max_clients: cli.max_clients,
        command_timeout_secs: cli.command_timeout,
    };
    let config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let auth = match AuthStore::load(&config.token_source()) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "failed to load auth tokens");
            std::process::exit(1);
        }
    };
    if !config.auth_enabled {
        info!("authentication disabled, all connections are trusted");
    }

    let server = match McpServer::bind(config, auth).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run_until(shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("mcp-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }

    info!("received shutdown signal");
}
