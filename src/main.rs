//! # Acquisition Service (AcqSrv) - Main Entry Point
//!
//! Polls configured Modbus TCP devices and streams decoded samples as
//! line-protocol records to a local telemetry collector.
//!
//! ## Usage
//!
//! ```bash
//! # Start with default configuration
//! cargo run --bin acqsrv
//!
//! # Start with custom configuration file
//! cargo run --bin acqsrv -- --config config/acqsrv.yaml
//!
//! # Start with custom log level
//! RUST_LOG=debug cargo run --bin acqsrv
//! ```

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use acqsrv::config::{AppConfig, ThreadingMode};
use acqsrv::{wait_for_shutdown, AcquisitionService, ServiceEvent};

/// Command line arguments for the acquisition service
#[derive(Parser)]
#[command(
    name = "acqsrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "SCADA data acquisition service for Modbus TCP devices",
    long_about = "Polls Modbus TCP devices through per-device workers and streams \
                  decoded samples to a local telemetry collector over a Unix datagram socket"
)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/acqsrv.yaml", env = "ACQSRV_CONFIG")]
    config: String,

    /// Log directory; when set, logs additionally go to a daily file
    #[arg(long)]
    log_dir: Option<String>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = match &args.log_level {
        Some(level) => EnvFilter::new(level.clone()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    match &args.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "acqsrv.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        },
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        },
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(&args);

    let config = AppConfig::load(&args.config)
        .map_err(|e| anyhow::anyhow!("failed to load configuration '{}': {e}", args.config))?;

    let device_count = config.device_count();
    let threading = config.acquisition.resolve_threading(device_count);
    info!(
        "Loaded {} points across {} devices (threading: {:?})",
        config.points.len(),
        device_count,
        threading
    );

    let runtime = match threading {
        ThreadingMode::Single => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?,
        _ => {
            let workers = config
                .acquisition
                .max_worker_threads
                .clamp(1, 64)
                .min(device_count.max(1) + 1);
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(workers)
                .enable_all()
                .build()?
        },
    };

    runtime.block_on(run(config))
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    let service = AcquisitionService::new(config);

    // Surface service errors and write completions in the log.
    let mut events = service.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ServiceEvent::Error(message)) => error!("{message}"),
                Ok(ServiceEvent::WriteCompleted {
                    request_id,
                    ok,
                    error,
                }) => {
                    if ok {
                        info!("Write {} completed", request_id);
                    } else {
                        error!(
                            "Write {} failed: {}",
                            request_id,
                            error.unwrap_or_else(|| "unknown".into())
                        );
                    }
                },
                Ok(ServiceEvent::StatisticsUpdated(stats)) => {
                    info!(
                        "Fleet: {}/{} connected, {} requests ({} failed), avg {:.1} ms",
                        stats.connected_devices,
                        stats.active_workers,
                        stats.total_requests,
                        stats.total_failed,
                        stats.global_avg_response_ms
                    );
                },
                Ok(_) => {},
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    service
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("service start failed: {e}"))?;
    info!("Acquisition service started");

    wait_for_shutdown().await;
    info!("Shutdown signal received");
    service.stop().await;

    let stats = service.stats();
    info!(
        "Final statistics: {} reads ({} ok, {} failed), {} samples sent, {} sink errors",
        stats.total_reads,
        stats.successful_reads,
        stats.failed_reads,
        stats.samples_sent,
        stats.sink_errors
    );
    Ok(())
}
