//! flurry: stream stdin lines into S3 through rolling local part files.

use clap::Parser;
use snafu::prelude::*;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use flurry::config::Config;
use flurry::error::{AddressParseSnafu, ConfigSnafu, MetricsSnafu, PipelineError};
use flurry::{OutputModule, metrics, signal};

/// Durable buffered writes to S3.
#[derive(Parser, Debug)]
#[command(name = "flurry")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Dry run - validate configuration without processing.
    #[arg(long)]
    dry_run: bool,
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = Config::from_file(&args.config).context(ConfigSnafu)?;

    if args.dry_run {
        info!(
            bucket = %config.s3.bucket_name,
            output_directory = %config.s3.output_directory_path,
            staging_dir = %config.compaction.staging_dir.display(),
            partitions = config.compaction.partitions,
            "Configuration is valid"
        );
        return Ok(());
    }

    if config.metrics.enabled {
        let addr = config.metrics.address.parse().context(AddressParseSnafu)?;
        metrics::init(addr).context(MetricsSnafu)?;
        debug!(
            "Metrics endpoint listening on http://{}/metrics",
            config.metrics.address
        );
    }

    let shutdown = CancellationToken::new();
    signal::spawn_shutdown_handler(shutdown.clone());

    let mut module = OutputModule::strings(config)
        .with_shutdown(shutdown.clone())
        .start()
        .await?;

    let input = module.input().clone();
    module.inputs.clear();

    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = tokio::select! {
                _ = shutdown.cancelled() => break,
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => {
                    if input.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("stdin closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    break;
                }
            }
        }
    });

    while let Some(ack) = module.output.recv().await {
        info!(
            bucket = %ack.bucket,
            key = %ack.key,
            bytes = ack.size,
            attempts = ack.attempts,
            "Committed"
        );
    }

    // Compactors are gone once the output closes; stop reading stdin.
    reader.abort();
    let stats = module.join().await?;

    info!("flurry stopped");
    info!("  Records accepted: {}", stats.records_accepted);
    info!("  Files finalized: {}", stats.files_finalized);
    info!("  Files uploaded: {}", stats.files_uploaded);
    info!("  Bytes uploaded: {}", stats.bytes_uploaded);
    info!("  Upload retries: {}", stats.upload_retries);
    info!("  Upload failures: {}", stats.upload_failures);

    Ok(())
}
