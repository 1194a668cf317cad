//! Sync harness binary
//!
//! Serves an in-memory replica speaking the statehive sync protocol, for
//! exercising clients configured with `sync.endpoint`:
//!
//!   sync-harness --port 3000
//!   STATEHIVE_SYNC_ENDPOINT=http://127.0.0.1:3000 <client>

use anyhow::Result;
use clap::Parser;
use statehive_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use statehive_core::metrics::init_metrics;
use statehive_core::sync::harness::start_server;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "sync-harness")]
#[command(about = "statehive reference sync remote", long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "3000")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: LogLevel,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging_with_config(LogConfig::new(args.log_level))?;
    init_metrics();

    let addr = format!("{}:{}", args.host, args.port);
    info!(%addr, "starting sync harness");
    start_server(addr).await
}
