// Replayer service entry point.
mod observability;

use anyhow::{Context, Result};
use replayer::capture::CaptureFileSource;
use replayer::config::ReplayerConfig;
use replayer::driver::{BufferedSinkFactory, ReplayDriver, ReplaySummary};
use replayer::tcp_sink::TcpSinkFactory;
use std::future::Future;

#[tokio::main]
async fn main() -> Result<()> {
    run_with_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
    .map(|_| ())
}

async fn run_with_shutdown<F>(shutdown: F) -> Result<ReplaySummary>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("traffic-replayer")?;
    let config = ReplayerConfig::from_env_or_yaml()?;
    tokio::spawn(observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
    ));

    let source = CaptureFileSource::open(config.capture_path()?, config.read_batch_size)
        .await
        .context("open capture")?;
    let summary = if config.dry_run {
        tracing::info!("dry run, requests are assembled but not sent");
        ReplayDriver::new(config.driver_config(), BufferedSinkFactory)
            .run(source, shutdown)
            .await?
    } else {
        tracing::info!(target_addr = %config.target_addr, "replaying to target");
        let sinks =
            TcpSinkFactory::new(config.target_addr).with_write_timeout(config.write_timeout());
        ReplayDriver::new(config.driver_config(), sinks)
            .run(source, shutdown)
            .await?
    };
    tracing::info!(
        completed = summary.requests_completed,
        incomplete = summary.requests_incomplete,
        failed = summary.requests_failed,
        "replayer stopped"
    );
    Ok(summary)
}
