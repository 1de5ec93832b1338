//! Process entry point: config parsing, logging setup, database client
//! selection, and stream-driver wiring. Process launch, config parsing, and
//! logging are deliberately kept out of the replication engine itself, so
//! this binary is kept intentionally thin.

use std::sync::Arc;
use std::time::Duration;

use blp_player::checkpoint;
use blp_player::client::{DatabaseClient, DryRunClient, LiveClient};
use blp_player::config::RecoveryState;
use blp_player::driver;
use blp_player::filter::Filter;
use blp_player::stats::Stats;
use blp_player::{Config, PlayerResult};
use clap::Parser;
use tokio::sync::oneshot;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> PlayerResult<()> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new().install() {
        tracing::warn!(error = %e, "failed to install prometheus metrics recorder");
    }

    info!(config = %serde_json::to_string(&config).unwrap_or_default(), "starting binlog player");

    let mut client: Box<dyn DatabaseClient> = if config.dry_run {
        Box::new(DryRunClient::new(tokio::io::stdout()))
    } else {
        let opts = mysql_async::Opts::from_url(&config.downstream_dsn)
            .map_err(|e| blp_player::PlayerError::Config(format!("invalid downstream DSN: {e}")))?;
        Box::new(LiveClient::new(opts))
    };
    client.connect().await?;

    let start = checkpoint::read_start_position(client.as_mut(), config.uid, config.slow_query_threshold()).await?;
    let mut recovery = RecoveryState {
        uid: config.uid,
        addr: if start.addr.is_empty() { config.addr.clone() } else { start.addr },
        position: start.position,
    };

    let filter = Filter::new(config.tables.clone());
    let stats = Arc::new(Stats::new(config.stats_rate_window_samples));

    let (interrupt_tx, interrupt_rx) = oneshot::channel();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = interrupt_tx.send(());
    });

    tokio::spawn(sample_stats_periodically(Arc::clone(&stats)));

    let result = driver::apply_binlog_events(&config, &mut recovery, client.as_mut(), &filter, &stats, interrupt_rx)
        .await;

    if let Err(e) = &result {
        error!(error = %e, "stream driver exited with error");
    }
    if let Err(e) = client.close().await {
        error!(error = %e, "failed to close database client");
    }
    result
}

async fn sample_stats_periodically(stats: Arc<Stats>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    loop {
        ticker.tick().await;
        stats.tick();
    }
}

/// Resolves on the first of SIGINT or SIGTERM, feeding the driver's
/// interrupt channel an external source in a concrete binary.
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
