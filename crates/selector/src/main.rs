use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

mod bus;
mod events;
mod gate;
mod metrics;
mod persist;
mod refresh;
mod scheduler;
mod scorer;

#[tokio::main]
async fn main() -> Result<()> {
    let config = common::config::Config::load()?;

    let (dispatch, _otel_guard) =
        common::observability::build_dispatch("selector", &config.general.log_level);
    tracing::dispatcher::set_global_default(dispatch).map_err(anyhow::Error::msg)?;

    tracing::info!("trader selector starting");

    if let Some(parent) = std::path::Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    metrics::install_prometheus(config.observability.prometheus_port)?;
    metrics::describe();

    let db = common::db::AsyncDb::open(&config.database.path).await?;

    let cfg = Arc::new(config);
    let api = Arc::new(common::upstream::UpstreamClient::new_with_settings(
        &cfg.upstream.leaderboard_url,
        &cfg.upstream.stats_url,
        &cfg.upstream.info_url,
        Duration::from_secs(cfg.upstream.timeout_secs),
        cfg.upstream.stats_retries,
        cfg.upstream.series_retries,
        Duration::from_millis(cfg.upstream.backoff_base_ms),
    ));
    let bus = bus::CandidateBus::new(64);
    let cancel = gate::CancelFlag::new();

    // Downstream consumers attach here; this subscriber keeps the bus alive
    // and gives operators a trace of what was published.
    let mut candidate_rx = bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = candidate_rx.recv().await {
            tracing::debug!(
                address = %event.address,
                score = event.score_hint,
                rank = event.meta.leaderboard.rank,
                "candidate published"
            );
        }
    });

    // One repeating job drives the whole refresh; the first cycle runs
    // immediately on startup.
    let (refresh_tx, mut refresh_rx) = tokio::sync::mpsc::channel::<()>(8);
    let _scheduler_handles = scheduler::start(vec![scheduler::JobSpec {
        name: "leaderboard_refresh".to_string(),
        interval: Duration::from_secs(cfg.selector.refresh_secs),
        tick: refresh_tx,
        run_immediately: true,
    }]);

    tokio::spawn({
        let db = db.clone();
        let api = api.clone();
        let cfg = cfg.clone();
        let bus = bus.clone();
        let cancel = cancel.clone();
        async move {
            while refresh_rx.recv().await.is_some() {
                let span = tracing::info_span!("job_run", job = "leaderboard_refresh");
                let _g = span.enter();
                match refresh::run_refresh_once(&db, api.as_ref(), &bus, cfg.as_ref(), &cancel)
                    .await
                {
                    Ok(summary) => tracing::info!(
                        periods_ok = summary.periods_ok,
                        periods_failed = summary.periods_failed,
                        published = summary.published,
                        "leaderboard_refresh done"
                    ),
                    Err(e) => tracing::error!(error = %e, "leaderboard_refresh failed"),
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    cancel.cancel();
    tracing::info!("shutting down");

    Ok(())
}
