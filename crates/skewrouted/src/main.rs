//! Skewroute daemon - skew-aware key routing over a record stream
//!
//! Usage:
//!   # stdin to stdout, defaults
//!   skewrouted < records.txt
//!
//!   # Files, 8 partitions, larger detection epochs
//!   skewrouted --parallelism 8 \
//!     --metric-window-size 5000 \
//!     --input records.txt \
//!     --output routed.tsv
//!
//!   # From a config file, with Prometheus metrics
//!   skewrouted --config skewroute.yaml --metrics-addr 0.0.0.0:9090

use clap::Parser;
use skewroute::{init_metrics, RebalanceDriver, RebalancePlanner};
use skewrouted::{open_input, open_output, Cli, Pipeline, PipelineConfig, PipelineStats};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Logs go to stderr; stdout may be the output sink
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match cli.pipeline_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };
    print_banner(&config);

    init_metrics(config.metrics_addr).map_err(|e| anyhow::anyhow!("Metrics init failed: {}", e))?;

    let planner = Arc::new(RebalancePlanner::<String>::new(config.rebalance.clone())?);
    let driver = RebalanceDriver::spawn(planner.clone());

    // Handle shutdown signals
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("Shutdown signal received, stopping pipeline...");
        shutdown_signal.store(true, Ordering::Relaxed);
    });

    // Blocking line I/O runs off the async workers
    let pipeline_planner = planner.clone();
    let pipeline_config = config.clone();
    let pipeline_shutdown = shutdown.clone();
    let result = tokio::task::spawn_blocking(move || -> anyhow::Result<PipelineStats> {
        let input = open_input(&pipeline_config.input_source)?;
        let output = open_output(&pipeline_config.output_sink)?;
        Pipeline::new(&pipeline_config, pipeline_planner).run(input, output, &pipeline_shutdown)
    })
    .await;

    // Apply whatever the last round planned before exiting
    while planner.advance() {}
    let driver_stats = driver.stop().await?;

    match result {
        Ok(Ok(stats)) => {
            tracing::info!(
                records = stats.records,
                epochs = stats.epochs,
                rounds = stats.rounds_planned,
                batches = driver_stats.batches_applied,
                partitions = ?stats.partition_counts,
                "Pipeline complete"
            );
        }
        Ok(Err(e)) => {
            tracing::error!("Pipeline error: {}", e);
            return Err(e);
        }
        Err(e) => {
            tracing::error!("Pipeline task panicked: {}", e);
            return Err(e.into());
        }
    }

    tracing::info!("Goodbye!");
    Ok(())
}

/// Wait for shutdown signals (Ctrl+C or SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}

fn print_banner(config: &PipelineConfig) {
    let timeout = config
        .rebalance
        .round_timeout
        .map(|t| format!("{:?}", t))
        .unwrap_or_else(|| "none".to_string());

    eprintln!(
        r#"
  skewrouted v{}
  ─────────────────────────────────────
  Partitions:      {}
  Affinity factor: {} (theta {:.4})
  Epoch size:      {} records
  Hot threshold:   {}
  Round timeout:   {}
  Input:           {}
  Output:          {}
"#,
        env!("CARGO_PKG_VERSION"),
        config.rebalance.parallelism,
        config.rebalance.affinity_factor,
        config.rebalance.theta(),
        config.metric_window_size,
        config.hot_key_threshold,
        timeout,
        config.input_source,
        config.output_sink,
    );
}
