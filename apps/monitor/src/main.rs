//! Request desk monitor
//!
//! Headless front end for the request desk backend: mirrors the playback
//! queue, stock lists, rules, comment/log feeds and system status, following
//! server pushes and logging every snapshot it accepts.
//!
//! Usage:
//!   requestdesk-monitor --api-url http://localhost:8080 --stock default

mod context;
mod sinks;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use requestdesk_core::sync::{SyncConfig, POLL_FALLBACK_INTERVAL_SECS, RELOAD_DEBOUNCE_MS};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use crate::context::MonitorContext;

#[derive(Parser, Debug)]
#[command(name = "requestdesk-monitor")]
#[command(about = "Mirror request desk resources and follow server pushes")]
struct Args {
    /// Base URL of the request desk backend
    #[arg(long, env = "REQUESTDESK_API_URL", default_value = "http://localhost:8080")]
    api_url: String,

    /// Stock list to mirror (repeatable)
    #[arg(long = "stock", env = "REQUESTDESK_STOCKS", value_delimiter = ',')]
    stocks: Vec<String>,

    /// Also mirror every stock list the backend reports
    #[arg(long)]
    discover_stocks: bool,

    /// Quiet period before a burst of reload requests is fetched
    #[arg(long, default_value_t = RELOAD_DEBOUNCE_MS)]
    debounce_ms: u64,

    /// Reload cadence when push is disabled
    #[arg(long, default_value_t = POLL_FALLBACK_INTERVAL_SECS)]
    poll_interval_secs: u64,

    /// Periodically reload every mirrored resource
    #[arg(long, env = "REQUESTDESK_AUTO_REFRESH_SECS")]
    auto_refresh_secs: Option<u64>,

    /// Do not open the event stream; poll instead
    #[arg(long)]
    no_push: bool,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn sync_config(&self) -> Result<SyncConfig> {
        let config = SyncConfig {
            reload_debounce: Duration::from_millis(self.debounce_ms),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            auto_refresh_interval: self.auto_refresh_secs.map(Duration::from_secs),
            ..SyncConfig::default()
        };
        config.validate().context("Invalid sync configuration")?;
        Ok(config)
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.as_str().to_ascii_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = args.sync_config()?;
    info!("Request desk monitor starting against {}", args.api_url);

    let context = MonitorContext::build(&args.api_url, config, !args.no_push);
    context
        .track_resources(&args.stocks, args.discover_stocks)
        .await;
    context.start().await;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down");
    context.shutdown().await;

    let engine = context.engine();
    for key in engine.tracked_keys() {
        let view = engine.view(&key);
        let count = view.snapshot.as_ref().map_or(0, |snapshot| snapshot.len());
        info!("{}: {} items at shutdown", key, count);
    }
    if let Some(line) = context.status().latest() {
        info!("Last status: {} at {}", line.message, line.at.to_rfc3339());
    }
    Ok(())
}
