//! CMEMS Export - one delivery run against the push server

use anyhow::{Context, Result};
use clap::Parser;
use cmems_common::logging::{init_logging, LogConfig, LogLevel};
use cmems_export::catalog::PgCatalogStore;
use cmems_export::config::ExportConfig;
use cmems_export::engine::{plan_from_catalog, ExportEngine};
use cmems_export::remote::FtpRemoteStore;
use std::process::ExitCode;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "cmems-export")]
#[command(author, version, about = "Deliver rendered files to the CMEMS in-situ push server")]
struct Cli {
    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("cmems-export")
        .build();

    // Environment variables take precedence
    let log_config = match log_config.clone().merge_env() {
        Ok(merged) => merged,
        Err(e) => {
            eprintln!("Ignoring invalid logging environment: {:#}", e);
            log_config
        },
    };

    let _guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialise logging: {:#}", e);
            return ExitCode::from(1);
        },
    };

    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("Export failed: {:#}", e);
            ExitCode::from(1)
        },
    }
}

async fn run() -> Result<u8> {
    let config = ExportConfig::load().context("Failed to load configuration")?;
    debug!(?config, "Configuration loaded");

    let catalog = PgCatalogStore::connect(&config.database)
        .await
        .context("Failed to open the catalog")?;

    let now = chrono::Utc::now();
    let batch = plan_from_catalog(&catalog, now, config.retention_days)
        .await
        .context("Failed to plan the batch")?;
    if batch.is_noop() {
        info!("Nothing to deliver");
        return Ok(0);
    }

    let store = FtpRemoteStore::connect(&config.ftp)
        .await
        .with_context(|| format!("Failed to connect to {}", config.ftp.host))?;

    let result = ExportEngine::new(&catalog, &store, &config).run(now).await;

    if let Err(e) = store.disconnect().await {
        warn!("FTP logout failed: {}", e);
    }

    let report = result.context("Export run failed")?;
    debug!(report = %serde_json::to_string(&report)?, "Run report");
    info!(outcome = %report.outcome, exit_code = report.exit_code(), "Export complete");
    Ok(report.exit_code())
}
