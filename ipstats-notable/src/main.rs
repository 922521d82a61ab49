//! ipstats-notable - first and notable observations report
//!
//! Reads `<data-root>/<analysis>/config.yaml` and the project export it names,
//! classifies every species-level observation against the configured places,
//! and writes `index.html` and `species.csv` to `<analysis>/output/current/`.

use anyhow::{Context, Result};
use clap::Parser;
use ipstats_common::config::{resolve_data_root, DATA_DIR_ENV};
use ipstats_notable::pipeline::{run_analysis, RunOverrides};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "ipstats-notable", version, about)]
struct Args {
    /// Analysis folder name under the data root
    analysis: String,

    /// Data root (default: $IPSTATS_DATA_DIR, then ./data)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Concurrent occurrence lookups (overrides config)
    #[arg(long)]
    workers: Option<usize>,

    /// Abort the analysis after this many seconds (overrides config)
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "ipstats_notable=info,ipstats_common=info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    info!("Starting ipstats-notable");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let data_root = resolve_data_root(args.data_dir.as_deref(), DATA_DIR_ENV);
    info!(data_root = %data_root.display(), analysis = %args.analysis, "Resolved analysis folder");

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling analysis");
            ctrl_c.cancel();
        }
    });

    let overrides = RunOverrides {
        workers: args.workers,
        timeout_secs: args.timeout_secs,
    };

    let output = run_analysis(&data_root, &args.analysis, &overrides, &cancel)
        .await
        .with_context(|| format!("Analysis '{}' failed", args.analysis))?;

    info!(
        html = %output.html_path.display(),
        priority = %output.priority_path.display(),
        csv = %output.csv_path.display(),
        "Analysis complete"
    );

    Ok(())
}
