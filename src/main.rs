//! CLI entry point for lambda_daq
//!
//! Loads the configuration, connects to the heat pump and InfluxDB, then polls
//! every configured measurement group until Ctrl-C or SIGTERM.
//!
//! # Usage
//!
//! ```bash
//! lambda_daq --config lambda.yaml --log-level debug
//! ```
//!
//! Exits with 0 after a signal-triggered shutdown and with 1 when startup
//! fails or every measurement group has stopped with an error.

use anyhow::{Context, Result};
use clap::Parser;
use lambda_daq::config::Settings;
use lambda_daq::daemon::{Daemon, ShutdownHandle};
use lambda_daq::logging::{self, LoggingConfig};
use lambda_daq::sink::InfluxSink;
use lambda_daq::transport::ModbusTcpReader;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, error, info, Level};

#[derive(Parser)]
#[command(name = "lambda_daq", version)]
#[command(about = "Polls Lambda heat pump registers and writes them to InfluxDB", long_about = None)]
struct Cli {
    /// Path to the configuration file (YAML, or TOML by extension)
    #[arg(long)]
    config: PathBuf,

    /// Log level: trace, debug, info, warn(ing) or error
    #[arg(long, default_value = "info", value_parser = logging::parse_log_level)]
    log_level: Level,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let init = LoggingConfig::from_env(cli.log_level).and_then(logging::init);
    if let Err(e) = init {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = format!("{e:#}"), "lambda_daq stopped with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    let groups = settings.validate()?;
    info!(
        config = %cli.config.display(),
        groups = groups.len(),
        device = %settings.device.address(),
        "Configuration loaded"
    );

    let sink = InfluxSink::new(&settings.influxdb)?;
    match sink.ping().await {
        Ok(()) => debug!(url = %settings.influxdb.base_url(), "InfluxDB ready"),
        Err(e) => debug!(url = %settings.influxdb.base_url(), error = %e, "InfluxDB not ready"),
    }

    let reader = ModbusTcpReader::connect(
        &settings.device.address(),
        settings.device.unit_id,
        settings.device.timeout()?,
    )
    .await?;

    let daemon = Daemon::new(
        groups.into_iter().map(Arc::new).collect(),
        Arc::new(reader),
        Arc::new(sink),
    );
    tokio::spawn(shutdown_on_signal(daemon.shutdown_handle()));

    let summary = daemon.run().await?;
    info!(
        groups = summary.groups,
        failed = summary.failed,
        "Shutdown complete"
    );
    Ok(())
}

async fn shutdown_on_signal(handle: ShutdownHandle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                error!(error = %e, "Cannot listen for SIGTERM, only Ctrl-C stops the daemon");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "Cannot listen for Ctrl-C");
                    return;
                }
                info!("Received Ctrl-C");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Cannot listen for Ctrl-C");
            return;
        }
        info!("Received Ctrl-C");
    }

    handle.trigger();
}
