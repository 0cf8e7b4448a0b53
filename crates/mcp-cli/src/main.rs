//! mcp: MetaTrader Connection Protocol client CLI.
//!
//! Sends commands through an `mcp-server` broker to MetaTrader and prints the
//! replies as JSON.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use commands::Target;
use std::path::PathBuf;
use std::time::Duration;
use tracing::error;

/// mcp: MetaTrader Connection Protocol client
#[derive(Parser)]
#[command(name = "mcp", version, about = "MetaTrader Connection Protocol client")]
struct Cli {
    /// Broker host
    #[arg(long, global = true)]
    host: Option<String>,

    /// Broker port
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Authentication token
    #[arg(long, global = true, env = "MCP_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Seconds to wait for a reply
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Config file path
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send any command with parameters
    Call {
        /// Command name (e.g. get_price)
        command: String,
        /// Parameter as key=value (repeatable)
        #[arg(short = 'P', long = "param")]
        param: Vec<String>,
        /// Parameters as a JSON object
        #[arg(long)]
        params: Option<String>,
    },

    /// Current price of a symbol
    Price { symbol: String },

    /// Account information
    Account,

    /// Open orders
    Orders,

    /// Historical bars
    History {
        symbol: String,
        /// Timeframe (M1, M5, H1, D1, ...)
        timeframe: String,
        #[arg(long, default_value_t = 100)]
        bars: u32,
    },

    /// Open an order
    Open {
        symbol: String,
        /// BUY, SELL, BUY_LIMIT, SELL_LIMIT, BUY_STOP, SELL_STOP
        order_type: String,
        volume: f64,
        #[arg(long)]
        price: Option<f64>,
        #[arg(long)]
        sl: Option<f64>,
        #[arg(long)]
        tp: Option<f64>,
        #[arg(long)]
        comment: Option<String>,
    },

    /// Close an order by ticket
    Close { ticket: u64 },

    /// Change price or stop levels of an order
    Modify {
        ticket: u64,
        #[arg(long)]
        price: Option<f64>,
        #[arg(long)]
        sl: Option<f64>,
        #[arg(long)]
        tp: Option<f64>,
    },

    /// Print every message the server sends
    Watch,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing.
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("mcp=debug,mcp_cli=debug,mcp_client=debug,mcp_core=debug")
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("mcp=warn,mcp_cli=warn,mcp_client=warn")
            .with_target(false)
            .init();
    }

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        eprintln!("mcp: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_default()
            .join(".mcp")
            .join("client.toml")
    });
    let cfg = config::Config::load(&config_path)?;

    // CLI overrides config.
    let target = Target {
        host: cli.host.clone().unwrap_or_else(|| cfg.default.host.clone()),
        port: cli.port.unwrap_or(cfg.default.port),
        token: cli.token.clone().or_else(|| cfg.token()),
        timeout: Duration::from_secs(cli.timeout.unwrap_or(cfg.default.timeout_secs)),
    };

    match cli.command {
        Command::Call {
            command,
            param,
            params,
        } => {
            let params = commands::call::build_params(params.as_deref(), &param)?;
            commands::call::run(&target, &command, params).await
        }
        Command::Price { symbol } => commands::trade::run_price(&target, &symbol).await,
        Command::Account => commands::trade::run_account(&target).await,
        Command::Orders => commands::trade::run_orders(&target).await,
        Command::History {
            symbol,
            timeframe,
            bars,
        } => commands::trade::run_history(&target, &symbol, &timeframe, bars).await,
        Command::Open {
            symbol,
            order_type,
            volume,
            price,
            sl,
            tp,
            comment,
        } => {
            let order =
                commands::trade::order_from_args(&symbol, &order_type, volume, price, sl, tp, comment)?;
            commands::trade::run_open(&target, &order).await
        }
        Command::Close { ticket } => commands::trade::run_close(&target, ticket).await,
        Command::Modify {
            ticket,
            price,
            sl,
            tp,
        } => commands::trade::run_modify(&target, ticket, price, sl, tp).await,
        Command::Watch => commands::watch::run(&target).await,
    }
}
