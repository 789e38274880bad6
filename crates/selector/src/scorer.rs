//! Two-phase trader scoring.
//!
//! Phase 1 maps raw leaderboard entries through hard filters and the
//! composite score, ranks the survivors, and normalizes selection weights.
//! Phase 2 merges enrichment stats, re-applies the drawdown filter on the
//! enriched values, and re-ranks/re-weights. Everything here is pure and
//! deterministic: no I/O, no clock, no ambient state.

use std::collections::HashMap;

use serde::Serialize;

use common::config;
use common::types::{AddressStats, FilterReason, PnlSample, RawLeaderboardEntry};

#[derive(Debug, Clone, Copy)]
pub struct ScoringParams {
    pub smooth_pnl_weight: f64,
    pub win_rate_weight: f64,
    pub pnl_weight: f64,
    pub trade_freq_weight: f64,
    /// Center of the trade-count Gaussian.
    pub optimal_trades: f64,
    /// Width of the trade-count Gaussian.
    pub trade_sigma: f64,
    /// Denominator for log-normalizing realized PnL.
    pub pnl_reference: f64,
    /// Hard reject above this peak-to-trough fraction.
    pub max_drawdown_limit: f64,
    /// Start of the progressive trade-count penalty.
    pub scalping_threshold: i64,
    /// Hard reject above this trade count.
    pub max_trades_hard_limit: i64,
}

impl Default for ScoringParams {
    fn default() -> Self {
        Self {
            smooth_pnl_weight: 0.45,
            win_rate_weight: 0.30,
            pnl_weight: 0.15,
            trade_freq_weight: 0.10,
            optimal_trades: 100.0,
            trade_sigma: 150.0,
            pnl_reference: 100_000.0,
            max_drawdown_limit: 0.80,
            scalping_threshold: 100,
            max_trades_hard_limit: 200,
        }
    }
}

impl ScoringParams {
    pub fn from_config(s: &config::Scoring) -> Self {
        Self {
            smooth_pnl_weight: s.smooth_pnl_weight,
            win_rate_weight: s.win_rate_weight,
            pnl_weight: s.pnl_weight,
            trade_freq_weight: s.trade_freq_weight,
            optimal_trades: s.optimal_trades,
            trade_sigma: s.trade_sigma,
            pnl_reference: s.pnl_reference,
            max_drawdown_limit: s.max_drawdown_limit,
            scalping_threshold: s.scalping_threshold,
            max_trades_hard_limit: s.max_trades_hard_limit,
        }
    }
}

/// All score components for one entry. Every field is finite; any non-finite
/// intermediate degrades the affected component to zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ScoringDetails {
    pub smooth_pnl_score: f64,
    pub max_drawdown: f64,
    pub ulcer_index: f64,
    pub up_fraction: f64,
    pub raw_win_rate: f64,
    pub adj_win_rate: f64,
    pub normalized_pnl: f64,
    pub trade_freq_score: f64,
    pub w_smooth_pnl: f64,
    pub w_win_rate: f64,
    pub w_pnl: f64,
    pub w_trade_freq: f64,
}

/// Audit record carried alongside each ranked entry and persisted as the
/// `metrics` JSON column.
#[derive(Debug, Clone, Serialize)]
pub struct EntryMeta {
    pub raw: RawLeaderboardEntry,
    pub details: ScoringDetails,
    pub stats: Option<AddressStats>,
    pub api_max_drawdown: f64,
    pub filtered: bool,
    pub filter_reason: Option<FilterReason>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RankedEntry {
    /// Normalized lowercase address.
    pub address: String,
    /// 1-based, dense within the surviving set for a period.
    pub rank: u32,
    pub score: f64,
    pub weight: f64,
    pub filtered: bool,
    pub filter_reason: Option<FilterReason>,
    pub win_rate: f64,
    pub executed_orders: i64,
    pub realized_pnl: f64,
    /// realized_pnl / max(executed_orders, 1); equals realized_pnl when the
    /// trader has no executed orders (the ratio is never taken).
    pub efficiency: f64,
    pub pnl_consistency: f64,
    pub remark: Option<String>,
    pub labels: Vec<String>,
    pub stat_open_positions: Option<i64>,
    pub stat_closed_positions: Option<i64>,
    pub stat_avg_pos_duration: Option<f64>,
    pub stat_total_pnl: Option<f64>,
    pub stat_max_drawdown: Option<f64>,
    pub meta: EntryMeta,
}

/// Result of a phase-1 scoring pass.
#[derive(Debug, Clone)]
pub struct ScoreOutcome {
    pub entries: Vec<RankedEntry>,
    pub filtered_drawdown: usize,
    pub filtered_scalping: usize,
    pub dropped_suspicious: usize,
    pub fallback_used: bool,
}

fn finite_or_zero(x: f64) -> f64 {
    if x.is_finite() {
        x
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SmoothPnl {
    score: f64,
    max_drawdown: f64,
    ulcer_index: f64,
    up_fraction: f64,
}

/// Path-shape score over a cumulative PnL series.
///
/// The series is re-based to start at zero; drawdowns are measured against
/// the running peak, the ulcer index is the RMS of the drawdown sequence,
/// and the final value is scaled by how often the path moved up.
fn smooth_pnl(pnl_list: &[PnlSample]) -> SmoothPnl {
    let values: Vec<f64> = pnl_list
        .iter()
        .map(|p| p.value)
        .filter(|v| v.is_finite())
        .collect();
    if values.len() < 2 {
        return SmoothPnl::default();
    }

    let base = values[0];
    let x: Vec<f64> = values.iter().map(|v| v - base).collect();
    let n = x.len();

    let mut peak = x[0];
    let mut max_drawdown = 0.0_f64;
    let mut dd_sq_sum = 0.0_f64;
    for &xi in &x {
        if xi > peak {
            peak = xi;
        }
        let dd = if peak > 0.0 {
            ((peak - xi) / peak).max(0.0)
        } else {
            0.0
        };
        if dd > max_drawdown {
            max_drawdown = dd;
        }
        dd_sq_sum += dd * dd;
    }
    let ulcer_index = (dd_sq_sum / n as f64).sqrt();

    let ups = x.windows(2).filter(|w| w[1] > w[0]).count();
    let up_fraction = ups as f64 / (n - 1) as f64;

    let last = x[n - 1];
    let max_abs = x.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    let r = if last > 0.0 && max_abs > 0.0 {
        last / max_abs
    } else {
        0.0
    };

    let score = r.max(0.0) * up_fraction / (1.0 + max_drawdown + ulcer_index);
    if !(score.is_finite()
        && max_drawdown.is_finite()
        && ulcer_index.is_finite()
        && up_fraction.is_finite())
    {
        return SmoothPnl::default();
    }
    SmoothPnl {
        score,
        max_drawdown,
        ulcer_index,
        up_fraction,
    }
}

/// Laplace-smoothed win rate with penalties for too-perfect records.
fn adjusted_win_rate(num_wins: i64, num_losses: i64) -> f64 {
    let base = (num_wins as f64 + 1.0) / ((num_wins + num_losses) as f64 + 2.0);
    if num_losses == 0 && num_wins > 0 {
        base * 0.7
    } else if base > 0.95 && num_wins + num_losses > 20 {
        base * 0.8
    } else {
        base
    }
}

fn normalized_pnl(realized_pnl: f64, reference: f64) -> f64 {
    if realized_pnl <= 0.0 {
        return 0.0;
    }
    let denom = reference.log10();
    if !(denom.is_finite() && denom > 0.0) {
        return 0.0;
    }
    finite_or_zero(((realized_pnl + 1.0).log10() / denom).clamp(0.0, 1.0))
}

/// Gaussian bell around the optimal trade count, with a progressive penalty
/// once the count crosses the scalping threshold.
fn trade_freq_score(num_trades: i64, params: &ScoringParams) -> f64 {
    if num_trades <= 0 {
        return 0.0;
    }
    let n = num_trades as f64;
    let spread = 2.0 * params.trade_sigma * params.trade_sigma;
    if !(spread.is_finite() && spread > 0.0) {
        return 0.0;
    }
    let base = (-(n - params.optimal_trades).powi(2) / spread).exp();

    let excess = num_trades - params.scalping_threshold;
    let penalty = if excess <= 0 {
        1.0
    } else if excess <= 50 {
        0.7
    } else if excess <= 100 {
        0.4
    } else if excess <= 200 {
        0.2
    } else {
        0.05
    };
    finite_or_zero(base * penalty)
}

/// Full component computation for one unfiltered entry. Returns the details
/// plus the path-based hard-filter verdict (the drawdown observed in the PnL
/// series itself can reject an entry even when API stats were absent).
fn compute_details(
    realized_pnl: f64,
    num_trades: i64,
    win_rate: f64,
    pnl_list: &[PnlSample],
    params: &ScoringParams,
) -> (ScoringDetails, f64, Option<FilterReason>) {
    let smooth = smooth_pnl(pnl_list);

    if smooth.max_drawdown > params.max_drawdown_limit {
        let details = ScoringDetails {
            max_drawdown: smooth.max_drawdown,
            raw_win_rate: win_rate,
            ..Default::default()
        };
        return (details, 0.0, Some(FilterReason::MaxDrawdownExceeded));
    }

    let num_wins = (num_trades as f64 * win_rate).round() as i64;
    let num_losses = num_trades - num_wins;

    let adj_win_rate = finite_or_zero(adjusted_win_rate(num_wins, num_losses));
    let norm_pnl = normalized_pnl(realized_pnl, params.pnl_reference);
    let freq = trade_freq_score(num_trades, params);

    let w_smooth_pnl = finite_or_zero(params.smooth_pnl_weight * smooth.score);
    let w_win_rate = finite_or_zero(params.win_rate_weight * adj_win_rate);
    let w_pnl = finite_or_zero(params.pnl_weight * norm_pnl);
    let w_trade_freq = finite_or_zero(params.trade_freq_weight * freq);
    let score = finite_or_zero(w_smooth_pnl + w_win_rate + w_pnl + w_trade_freq);

    let details = ScoringDetails {
        smooth_pnl_score: smooth.score,
        max_drawdown: smooth.max_drawdown,
        ulcer_index: smooth.ulcer_index,
        up_fraction: smooth.up_fraction,
        raw_win_rate: win_rate,
        adj_win_rate,
        normalized_pnl: norm_pnl,
        trade_freq_score: freq,
        w_smooth_pnl,
        w_win_rate,
        w_pnl,
        w_trade_freq,
    };
    (details, score, None)
}

/// Map one raw entry to an unranked entry (rank and weight are assigned
/// after sorting the surviving set).
fn score_entry(raw: RawLeaderboardEntry, params: &ScoringParams) -> RankedEntry {
    let address = raw.address.to_lowercase();
    let win_rate = raw.win_rate.unwrap_or(0.0).clamp(0.0, 1.0);
    let executed_orders = raw.executed_orders.unwrap_or(0).max(0);
    let realized_pnl = finite_or_zero(raw.realized_pnl.unwrap_or(0.0));

    let api_max_drawdown = raw
        .stats
        .and_then(|s| s.max_drawdown)
        .or(raw.max_drawdown)
        .unwrap_or(0.0);

    let (details, score, path_filter) = if api_max_drawdown > params.max_drawdown_limit {
        (
            ScoringDetails {
                raw_win_rate: win_rate,
                ..Default::default()
            },
            0.0,
            Some(FilterReason::MaxDrawdownExceeded),
        )
    } else if executed_orders > params.max_trades_hard_limit {
        (
            ScoringDetails {
                raw_win_rate: win_rate,
                ..Default::default()
            },
            0.0,
            Some(FilterReason::ScalpingPenalty),
        )
    } else {
        compute_details(realized_pnl, executed_orders, win_rate, &raw.pnl_list, params)
    };

    let filtered = path_filter.is_some();
    let stat_max_drawdown = api_max_drawdown.max(details.max_drawdown);
    let efficiency = finite_or_zero(realized_pnl / executed_orders.max(1) as f64);

    let stats = raw.stats;
    RankedEntry {
        address,
        rank: 0,
        score,
        weight: 0.0,
        filtered,
        filter_reason: path_filter,
        win_rate,
        executed_orders,
        realized_pnl,
        efficiency,
        pnl_consistency: details.smooth_pnl_score,
        remark: raw.remark.clone(),
        labels: raw.labels.clone(),
        stat_open_positions: stats.and_then(|s| s.open_pos_count),
        stat_closed_positions: stats.and_then(|s| s.close_pos_count),
        stat_avg_pos_duration: stats.and_then(|s| s.avg_pos_duration),
        stat_total_pnl: stats.and_then(|s| s.total_pnl),
        stat_max_drawdown: Some(stat_max_drawdown),
        meta: EntryMeta {
            raw,
            details,
            stats,
            api_max_drawdown,
            filtered,
            filter_reason: path_filter,
        },
    }
}

/// Sort by score (descending, address as the deterministic tie-break),
/// assign dense 1-based ranks, and normalize weights over the top-K slice.
///
/// With S = Σ max(scoreᵢ, 0) over the top K: weights are max(scoreᵢ, 0)/S
/// inside the slice and 0 elsewhere, so the top-K sum is exactly 1 whenever
/// any selected entry has positive score, and 0 otherwise.
fn rank_and_weight(mut entries: Vec<RankedEntry>, select_count: usize) -> Vec<RankedEntry> {
    entries.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.address.cmp(&b.address))
    });

    let top_k = select_count.min(entries.len());
    let total: f64 = entries[..top_k].iter().map(|e| e.score.max(0.0)).sum();

    for (i, e) in entries.iter_mut().enumerate() {
        e.rank = (i + 1) as u32;
        e.weight = if i < top_k && total > 0.0 {
            e.score.max(0.0) / total
        } else {
            0.0
        };
    }
    entries
}

/// Phase 1: score, filter, rank, weight.
pub fn score(
    raw_entries: Vec<RawLeaderboardEntry>,
    params: &ScoringParams,
    select_count: usize,
    fallback_when_all_filtered: bool,
) -> ScoreOutcome {
    let mapped: Vec<RankedEntry> = raw_entries
        .into_iter()
        .map(|raw| score_entry(raw, params))
        .collect();

    let filtered_drawdown = mapped
        .iter()
        .filter(|e| e.filter_reason == Some(FilterReason::MaxDrawdownExceeded))
        .count();
    let filtered_scalping = mapped
        .iter()
        .filter(|e| e.filter_reason == Some(FilterReason::ScalpingPenalty))
        .count();

    let is_suspicious =
        |e: &RankedEntry| !e.filtered && e.win_rate >= 0.999 && e.executed_orders >= 10;
    let dropped_suspicious = mapped.iter().filter(|e| is_suspicious(e)).count();

    let survivors: Vec<RankedEntry> = mapped
        .iter()
        .filter(|e| !e.filtered && !is_suspicious(e))
        .cloned()
        .collect();

    // An all-filtered period would starve downstream; optionally fall back
    // to the pre-drop list so consumers still see a ranking.
    let (entries, fallback_used) = if survivors.is_empty() && !mapped.is_empty() {
        if fallback_when_all_filtered {
            (mapped, true)
        } else {
            (Vec::new(), false)
        }
    } else {
        (survivors, false)
    };

    ScoreOutcome {
        entries: rank_and_weight(entries, select_count),
        filtered_drawdown,
        filtered_scalping,
        dropped_suspicious,
        fallback_used,
    }
}

/// Phase 2a: merge enrichment stats into the ranked entries. Scores are not
/// touched; only the win rate, the stat columns, and the audit blob change.
pub fn apply_stats(entries: &mut [RankedEntry], stats_map: &HashMap<String, AddressStats>) {
    for e in entries.iter_mut() {
        let Some(s) = stats_map.get(&e.address) else {
            continue;
        };
        if let Some(wr) = s.win_rate {
            e.win_rate = wr.clamp(0.0, 1.0);
        }
        if s.open_pos_count.is_some() {
            e.stat_open_positions = s.open_pos_count;
        }
        if s.close_pos_count.is_some() {
            e.stat_closed_positions = s.close_pos_count;
        }
        if s.avg_pos_duration.is_some() {
            e.stat_avg_pos_duration = s.avg_pos_duration;
        }
        if s.total_pnl.is_some() {
            e.stat_total_pnl = s.total_pnl;
        }
        if let Some(dd) = s.max_drawdown {
            let prior = e.stat_max_drawdown.unwrap_or(0.0);
            e.stat_max_drawdown = Some(prior.max(dd));
        }

        let mut merged = e.meta.stats.unwrap_or_default();
        merged.win_rate = s.win_rate.or(merged.win_rate);
        merged.open_pos_count = s.open_pos_count.or(merged.open_pos_count);
        merged.close_pos_count = s.close_pos_count.or(merged.close_pos_count);
        merged.avg_pos_duration = s.avg_pos_duration.or(merged.avg_pos_duration);
        merged.total_pnl = s.total_pnl.or(merged.total_pnl);
        merged.max_drawdown = s.max_drawdown.or(merged.max_drawdown);
        e.meta.stats = Some(merged);
    }
}

/// Phase 2b: re-apply the drawdown hard filter on the enriched values, drop
/// the newly filtered entries, and re-rank/re-weight the remainder. Never
/// grows the set.
pub fn refilter_and_renormalize(
    entries: Vec<RankedEntry>,
    params: &ScoringParams,
    select_count: usize,
) -> Vec<RankedEntry> {
    let kept: Vec<RankedEntry> = entries
        .into_iter()
        .filter(|e| e.stat_max_drawdown.unwrap_or(0.0) <= params.max_drawdown_limit)
        .collect();
    rank_and_weight(kept, select_count)
}
