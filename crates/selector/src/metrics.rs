use anyhow::Result;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;

const HISTOGRAM_BUCKETS_MS: &[f64] = &[
    1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0,
];

pub fn describe() {
    describe_counter!(
        "tracing_error_events",
        "Cumulative count of all ERROR-level tracing events."
    );
    describe_counter!(
        "selector_refresh_cycles_total",
        "Completed refresh cycles per period."
    );
    describe_counter!(
        "selector_refresh_failures_total",
        "Refresh cycles that failed and were left to the next tick."
    );
    describe_counter!(
        "selector_entries_ranked_total",
        "Ranked entries persisted across all cycles."
    );
    describe_counter!(
        "selector_entries_filtered_total",
        "Entries rejected by hard filters, labeled by reason."
    );
    describe_counter!(
        "selector_candidates_published_total",
        "Candidate events delivered to the bus."
    );
    describe_counter!(
        "selector_publish_failures_total",
        "Candidate events that found no live subscriber."
    );
    describe_counter!(
        "selector_upstream_errors_total",
        "Upstream request failures classified by kind."
    );
    describe_gauge!(
        "selector_pool_size",
        "Entries persisted in the most recent cycle, labeled by period."
    );
    describe_histogram!(
        "selector_db_query_latency_ms",
        "SQLite operation latency (queue wait + exec) in milliseconds."
    );
    describe_histogram!(
        "selector_db_queue_wait_ms",
        "Time a DB job waited in the queue before execution."
    );
    describe_histogram!(
        "selector_db_exec_ms",
        "Time a DB job spent executing on the SQLite thread."
    );
    describe_counter!(
        "selector_db_query_errors_total",
        "SQLite operation errors."
    );
    describe_gauge!(
        "selector_db_queue_depth",
        "DB jobs currently queued or executing."
    );
}

pub fn install_prometheus(port: u16) -> Result<()> {
    // Localhost only: the scrape endpoint stays private on the host.
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();

    // `install` (not `install_recorder`) so the HTTP listener actually serves
    // /metrics.
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("selector_".to_string()),
            HISTOGRAM_BUCKETS_MS,
        )
        .map_err(anyhow::Error::from)?
        .with_http_listener(addr)
        .install()
        .map_err(anyhow::Error::msg)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_handle_renders_metric_names() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        describe();

        metrics::with_local_recorder(&recorder, || {
            metrics::counter!("selector_refresh_cycles_total").increment(1);
            metrics::counter!("selector_entries_filtered_total", "reason" => "scalping_penalty")
                .increment(2);
            metrics::gauge!("selector_pool_size", "period" => "30").set(12.0);
        });

        let rendered = handle.render();
        assert!(rendered.contains("selector_refresh_cycles_total"));
        assert!(rendered.contains("selector_entries_filtered_total"));
        assert!(rendered.contains(r#"reason="scalping_penalty""#));
        assert!(rendered.contains("selector_pool_size"));
    }
}
