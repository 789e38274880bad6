//! One end-to-end refresh cycle per period:
//! page the leaderboard → phase-1 score → bounded enrichment fan-out →
//! phase-2 refilter → transactional persist → best-effort publish.

use std::collections::HashMap;

use anyhow::Result;

use common::config::Config;
use common::db::AsyncDb;
use common::types::{AddressStats, RawLeaderboardEntry, Sort, WindowSeries};
use common::upstream::classify_upstream_error;

use crate::bus::CandidateBus;
use crate::events::candidate_from_entry;
use crate::gate::{CancelFlag, Gate};
use crate::persist;
use crate::scorer::{self, ScoringParams};

pub trait LeaderboardPager {
    fn fetch_page(
        &self,
        period: u32,
        page_num: u32,
        page_size: u32,
        sort: Sort,
    ) -> impl std::future::Future<Output = Result<(Vec<RawLeaderboardEntry>, bool)>> + Send;
}

pub trait AddressStatsFetcher {
    fn fetch_address_stat(
        &self,
        address: &str,
        period: u32,
    ) -> impl std::future::Future<Output = Result<Option<AddressStats>>> + Send;
}

pub trait PortfolioFetcher {
    fn fetch_portfolio_series(
        &self,
        address: &str,
    ) -> impl std::future::Future<Output = Result<Option<Vec<WindowSeries>>>> + Send;
}

impl LeaderboardPager for common::upstream::UpstreamClient {
    async fn fetch_page(
        &self,
        period: u32,
        page_num: u32,
        page_size: u32,
        sort: Sort,
    ) -> Result<(Vec<RawLeaderboardEntry>, bool)> {
        common::upstream::UpstreamClient::fetch_page(self, period, page_num, page_size, sort).await
    }
}

impl AddressStatsFetcher for common::upstream::UpstreamClient {
    async fn fetch_address_stat(&self, address: &str, period: u32) -> Result<Option<AddressStats>> {
        common::upstream::UpstreamClient::fetch_address_stat(self, address, period).await
    }
}

impl PortfolioFetcher for common::upstream::UpstreamClient {
    async fn fetch_portfolio_series(&self, address: &str) -> Result<Option<Vec<WindowSeries>>> {
        common::upstream::UpstreamClient::fetch_portfolio_series(self, address).await
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RefreshSummary {
    pub periods_ok: usize,
    pub periods_failed: usize,
    pub published: usize,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PeriodOutcome {
    pub persisted: usize,
    pub published: usize,
    pub cancelled: bool,
}

/// Run one full refresh across every configured period. Periods execute
/// sequentially to keep upstream pressure bounded; a failed period is logged
/// and left for the next tick.
pub async fn run_refresh_once<C>(
    db: &AsyncDb,
    api: &C,
    bus: &CandidateBus,
    cfg: &Config,
    cancel: &CancelFlag,
) -> Result<RefreshSummary>
where
    C: LeaderboardPager + AddressStatsFetcher + PortfolioFetcher + Sync,
{
    let mut summary = RefreshSummary::default();
    for &period in &cfg.selector.periods {
        if cancel.is_cancelled() {
            break;
        }
        match run_period_refresh(db, api, bus, cfg, period, cancel).await {
            Ok(outcome) if outcome.cancelled => {
                tracing::info!(period, "refresh cycle cancelled");
                break;
            }
            Ok(outcome) => {
                summary.periods_ok += 1;
                summary.published += outcome.published;
                metrics::counter!("selector_refresh_cycles_total").increment(1);
                tracing::info!(
                    period,
                    persisted = outcome.persisted,
                    published = outcome.published,
                    "refresh cycle done"
                );
            }
            Err(e) => {
                summary.periods_failed += 1;
                metrics::counter!("selector_refresh_failures_total").increment(1);
                tracing::error!(period, error = %e, "refresh cycle failed; waiting for next tick");
            }
        }
    }
    Ok(summary)
}

async fn run_period_refresh<C>(
    db: &AsyncDb,
    api: &C,
    bus: &CandidateBus,
    cfg: &Config,
    period: u32,
    cancel: &CancelFlag,
) -> Result<PeriodOutcome>
where
    C: LeaderboardPager + AddressStatsFetcher + PortfolioFetcher + Sync,
{
    let cancelled = PeriodOutcome {
        cancelled: true,
        ..Default::default()
    };

    // 1. Pagination. Errors here abort the period: a partial snapshot would
    // bias the ranking toward whichever pages happened to load.
    let sort = Sort::from_i64(cfg.selector.sort).unwrap_or_default();
    let mut raw: Vec<RawLeaderboardEntry> = Vec::new();
    let mut page_num = 1_u32;
    loop {
        let (entries, has_more) = api
            .fetch_page(period, page_num, cfg.selector.page_size, sort)
            .await
            .map_err(|e| {
                metrics::counter!(
                    "selector_upstream_errors_total",
                    "kind" => classify_upstream_error(&e).as_str()
                )
                .increment(1);
                e
            })?;
        raw.extend(entries);
        if !has_more || raw.len() >= cfg.selector.top_n {
            break;
        }
        page_num += 1;
    }
    raw.truncate(cfg.selector.top_n);
    tracing::debug!(period, entries = raw.len(), pages = page_num, "leaderboard snapshot loaded");

    if cancel.is_cancelled() {
        return Ok(cancelled);
    }

    // 2. Phase-1 score over the complete snapshot.
    let params = ScoringParams::from_config(&cfg.scoring);
    let outcome = scorer::score(
        raw,
        &params,
        cfg.selector.select_count,
        cfg.selector.fallback_when_all_filtered,
    );
    metrics::counter!("selector_entries_filtered_total", "reason" => "max_drawdown_exceeded")
        .increment(outcome.filtered_drawdown as u64);
    metrics::counter!("selector_entries_filtered_total", "reason" => "scalping_penalty")
        .increment(outcome.filtered_scalping as u64);
    if outcome.fallback_used {
        tracing::warn!(period, "every candidate failed hard filters; using fallback list");
    }
    let ranked = outcome.entries;

    // 3. Enrich more than select_count so phase-2 shrinkage cannot leave the
    // pool short.
    let enrich_target = ranked
        .len()
        .min(cfg.selector.enrich_count.max(cfg.selector.select_count * 2));
    let addrs: Vec<String> = ranked
        .iter()
        .take(enrich_target)
        .map(|e| e.address.clone())
        .collect();

    if cancel.is_cancelled() {
        return Ok(cancelled);
    }

    // 4. Bounded fan-out to both enrichment APIs. Per-address failures are
    // logged and omitted from the maps; the cycle continues.
    let stats_gate = Gate::new(cfg.concurrency.stats_concurrency);
    let series_gate = Gate::new(cfg.concurrency.series_concurrency);

    let (stat_results, series_results) = tokio::join!(
        stats_gate.run_all(addrs.clone(), cancel, |addr: String| async move {
            match api.fetch_address_stat(&addr, period).await {
                Ok(stats) => Ok(stats),
                Err(e) => {
                    metrics::counter!(
                        "selector_upstream_errors_total",
                        "kind" => classify_upstream_error(&e).as_str()
                    )
                    .increment(1);
                    tracing::warn!(
                        address = %addr,
                        period,
                        error = %e,
                        "address stat enrichment failed; omitting address"
                    );
                    Err(e)
                }
            }
        }),
        series_gate.run_all(addrs.clone(), cancel, |addr: String| async move {
            match api.fetch_portfolio_series(&addr).await {
                Ok(series) => Ok(series),
                Err(e) => {
                    metrics::counter!(
                        "selector_upstream_errors_total",
                        "kind" => classify_upstream_error(&e).as_str()
                    )
                    .increment(1);
                    tracing::warn!(
                        address = %addr,
                        error = %e,
                        "portfolio series enrichment failed; omitting address"
                    );
                    Err(e)
                }
            }
        }),
    );

    let mut stats_map: HashMap<String, AddressStats> = HashMap::new();
    for (addr, res) in addrs.iter().zip(stat_results) {
        if let Some(Some(stats)) = res {
            stats_map.insert(addr.clone(), stats);
        }
    }
    let mut series_by_addr: HashMap<String, Vec<WindowSeries>> = HashMap::new();
    for (addr, res) in addrs.iter().zip(series_results) {
        if let Some(Some(series)) = res {
            series_by_addr.insert(addr.clone(), series);
        }
    }

    if cancel.is_cancelled() {
        return Ok(cancelled);
    }

    // 5. Phase 2: merge stats, re-apply the drawdown filter, re-rank.
    let mut entries = ranked;
    scorer::apply_stats(&mut entries, &stats_map);
    let before = entries.len();
    let entries = scorer::refilter_and_renormalize(entries, &params, cfg.selector.select_count);
    let refiltered = before - entries.len();
    if refiltered > 0 {
        metrics::counter!("selector_entries_filtered_total", "reason" => "max_drawdown_exceeded")
            .increment(refiltered as u64);
        tracing::debug!(period, refiltered, "entries dropped by enriched drawdown");
    }

    if cancel.is_cancelled() {
        return Ok(cancelled);
    }

    // 6. Persist, then 7. publish — in that order, so subscribers can always
    // re-read the committed state by (period, address).
    let pool: Vec<_> = entries
        .iter()
        .take(cfg.selector.select_count)
        .cloned()
        .collect();
    let events: Vec<_> = pool.iter().map(|e| candidate_from_entry(e, period)).collect();
    let persisted = entries.len();

    persist::replace_period(db, period, entries, &pool, &series_by_addr).await?;
    metrics::counter!("selector_entries_ranked_total").increment(persisted as u64);
    metrics::gauge!("selector_pool_size", "period" => period.to_string()).set(persisted as f64);

    let mut published = 0_usize;
    for event in events {
        match bus.publish(event) {
            Ok(_) => {
                published += 1;
                metrics::counter!("selector_candidates_published_total").increment(1);
            }
            Err(e) => {
                metrics::counter!("selector_publish_failures_total").increment(1);
                tracing::warn!(address = %e.0.address, period, "candidate publish failed: no subscribers");
            }
        }
    }

    Ok(PeriodOutcome {
        persisted,
        published,
        cancelled: false,
    })
}
