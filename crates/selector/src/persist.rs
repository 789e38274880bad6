//! Transactional persistence of a period's ranking.
//!
//! `replace_period` swaps out everything the previous cycle wrote for one
//! period in a single SQLite transaction: readers either see the old cycle
//! or the new one, never a mix. The delete-then-insert discipline also makes
//! the operation idempotent for identical inputs.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{Context, Result};

use common::db::AsyncDb;
use common::types::{PnlSource, WindowSeries};

use crate::scorer::RankedEntry;

const ENTRY_CHUNK: usize = 100;
const POINT_CHUNK: usize = 400;

/// One persisted time-series sample.
#[derive(Debug, Clone, PartialEq)]
pub struct PnlPointRow {
    pub address: String,
    pub source: PnlSource,
    pub window_name: String,
    pub point_ts: i64,
    pub pnl_value: Option<f64>,
    pub equity_value: Option<f64>,
}

/// Ranked entry as read back from the database.
#[derive(Debug, Clone)]
pub struct RankedRow {
    pub period_days: u32,
    pub address: String,
    pub rank: u32,
    pub score: f64,
    pub weight: f64,
    pub win_rate: f64,
    pub executed_orders: i64,
    pub realized_pnl: f64,
    pub pnl_consistency: Option<f64>,
    pub efficiency: Option<f64>,
    pub remark: Option<String>,
    pub labels: Vec<String>,
    pub stat_max_drawdown: Option<f64>,
}

/// Build the PnL points for one cycle.
///
/// Tracked entries contribute their raw leaderboard series under the
/// `hyperbot` source and a `period_{N}` window; exchange portfolio windows
/// whose lookback matches the period contribute under `hyperliquid`, with
/// pnl and equity series merged by timestamp. Within the cycle a full key
/// holds at most one point.
pub fn synthesize_points(
    period: u32,
    tracked: &[RankedEntry],
    series_by_addr: &HashMap<String, Vec<WindowSeries>>,
) -> Vec<PnlPointRow> {
    let mut out = Vec::new();
    let mut seen: HashSet<(String, &'static str, String, i64)> = HashSet::new();

    let window = format!("period_{period}");
    for entry in tracked {
        for p in &entry.meta.raw.pnl_list {
            let key = (
                entry.address.clone(),
                PnlSource::Hyperbot.as_str(),
                window.clone(),
                p.timestamp_ms,
            );
            if !seen.insert(key) {
                continue;
            }
            out.push(PnlPointRow {
                address: entry.address.clone(),
                source: PnlSource::Hyperbot,
                window_name: window.clone(),
                point_ts: p.timestamp_ms,
                pnl_value: Some(p.value),
                equity_value: None,
            });
        }
    }

    let mut addrs: Vec<&String> = series_by_addr.keys().collect();
    addrs.sort();
    for addr in addrs {
        for series in &series_by_addr[addr] {
            if series.period_days() != Some(period) {
                continue;
            }
            let mut by_ts: BTreeMap<i64, (Option<f64>, Option<f64>)> = BTreeMap::new();
            for p in &series.pnl_history {
                by_ts.entry(p.timestamp_ms).or_default().0 = Some(p.value);
            }
            for p in &series.account_value_history {
                by_ts.entry(p.timestamp_ms).or_default().1 = Some(p.value);
            }
            for (ts, (pnl_value, equity_value)) in by_ts {
                let key = (
                    addr.clone(),
                    PnlSource::Hyperliquid.as_str(),
                    series.window.clone(),
                    ts,
                );
                if !seen.insert(key) {
                    continue;
                }
                out.push(PnlPointRow {
                    address: addr.clone(),
                    source: PnlSource::Hyperliquid,
                    window_name: series.window.clone(),
                    point_ts: ts,
                    pnl_value,
                    equity_value,
                });
            }
        }
    }

    out
}

/// Replace a period's ranked entries and PnL points atomically.
pub async fn replace_period(
    db: &AsyncDb,
    period: u32,
    entries: Vec<RankedEntry>,
    tracked: &[RankedEntry],
    series_by_addr: &HashMap<String, Vec<WindowSeries>>,
) -> Result<()> {
    let points = synthesize_points(period, tracked, series_by_addr);

    db.call_named("persist.replace_period", move |conn| {
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM ranked_entries WHERE period_days = ?1",
            [period],
        )?;
        tx.execute("DELETE FROM pnl_points WHERE period_days = ?1", [period])?;

        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO ranked_entries
                    (period_days, address, rank, score, weight, win_rate, executed_orders,
                     realized_pnl, pnl_consistency, efficiency, remark, labels, metrics,
                     stat_open_positions, stat_closed_positions, stat_avg_pos_duration,
                     stat_total_pnl, stat_max_drawdown)
                VALUES
                    (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
                ",
            )?;
            for chunk in entries.chunks(ENTRY_CHUNK) {
                for e in chunk {
                    let labels = serde_json::to_string(&e.labels).unwrap_or_default();
                    let meta = serde_json::to_string(&e.meta).unwrap_or_default();
                    stmt.execute(rusqlite::params![
                        period,
                        e.address,
                        e.rank,
                        e.score,
                        e.weight,
                        e.win_rate,
                        e.executed_orders,
                        e.realized_pnl,
                        e.pnl_consistency,
                        e.efficiency,
                        e.remark,
                        labels,
                        meta,
                        e.stat_open_positions,
                        e.stat_closed_positions,
                        e.stat_avg_pos_duration,
                        e.stat_total_pnl,
                        e.stat_max_drawdown,
                    ])?;
                }
            }
        }

        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO pnl_points
                    (period_days, address, source, window_name, point_ts, pnl_value, equity_value)
                VALUES
                    (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ",
            )?;
            for chunk in points.chunks(POINT_CHUNK) {
                for p in chunk {
                    stmt.execute(rusqlite::params![
                        period,
                        p.address,
                        p.source.as_str(),
                        p.window_name,
                        p.point_ts,
                        p.pnl_value,
                        p.equity_value,
                    ])?;
                }
            }
        }

        tx.commit()?;
        Ok(())
    })
    .await
    .with_context(|| format!("replace_period failed for period {period}"))
}

fn row_from_sql(row: &rusqlite::Row<'_>) -> rusqlite::Result<RankedRow> {
    let labels_json: Option<String> = row.get(11)?;
    let labels = labels_json
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default();
    Ok(RankedRow {
        period_days: row.get(0)?,
        address: row.get(1)?,
        rank: row.get(2)?,
        score: row.get(3)?,
        weight: row.get(4)?,
        win_rate: row.get(5)?,
        executed_orders: row.get(6)?,
        realized_pnl: row.get(7)?,
        pnl_consistency: row.get(8)?,
        efficiency: row.get(9)?,
        remark: row.get(10)?,
        labels,
        stat_max_drawdown: row.get(12)?,
    })
}

const RANKED_COLUMNS: &str = "period_days, address, rank, score, weight, win_rate, \
     executed_orders, realized_pnl, pnl_consistency, efficiency, remark, labels, \
     stat_max_drawdown";

/// Read a period's entries ordered by rank.
pub async fn read_ranked(db: &AsyncDb, period: u32, limit: usize) -> Result<Vec<RankedRow>> {
    db.call_named("persist.read_ranked", move |conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {RANKED_COLUMNS} FROM ranked_entries
             WHERE period_days = ?1 ORDER BY rank ASC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(rusqlite::params![period, limit as i64], row_from_sql)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    })
    .await
}

/// Read a period's entries ordered by selection weight, heaviest first.
pub async fn read_selected(db: &AsyncDb, period: u32, limit: usize) -> Result<Vec<RankedRow>> {
    db.call_named("persist.read_selected", move |conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {RANKED_COLUMNS} FROM ranked_entries
             WHERE period_days = ?1 ORDER BY weight DESC, rank ASC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(rusqlite::params![period, limit as i64], row_from_sql)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scorer::{score, ScoringParams};
    use common::types::{PnlSample, RawLeaderboardEntry};

    fn ranked_fixture(n: usize) -> Vec<RankedEntry> {
        let raws: Vec<RawLeaderboardEntry> = (0..n)
            .map(|i| RawLeaderboardEntry {
                address: format!("0xAddr{i:02}"),
                win_rate: Some(0.4 + i as f64 * 0.05),
                executed_orders: Some(30 + i as i64 * 10),
                realized_pnl: Some(1_000.0 * (i as f64 + 1.0)),
                labels: vec!["auto".to_string()],
                pnl_list: vec![
                    PnlSample {
                        timestamp_ms: 1_000,
                        value: 0.0,
                    },
                    PnlSample {
                        timestamp_ms: 2_000,
                        value: 500.0 * (i as f64 + 1.0),
                    },
                ],
                ..Default::default()
            })
            .collect();
        score(raws, &ScoringParams::default(), 3, true).entries
    }

    fn month_series(points: &[(i64, f64)], equity: &[(i64, f64)]) -> WindowSeries {
        WindowSeries {
            window: "month".to_string(),
            pnl_history: points
                .iter()
                .map(|&(t, v)| PnlSample {
                    timestamp_ms: t,
                    value: v,
                })
                .collect(),
            account_value_history: equity
                .iter()
                .map(|&(t, v)| PnlSample {
                    timestamp_ms: t,
                    value: v,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_replace_period_roundtrip_and_ordering() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let entries = ranked_fixture(5);
        let tracked = entries.clone();

        replace_period(&db, 30, entries, &tracked, &HashMap::new())
            .await
            .unwrap();

        let ranked = read_ranked(&db, 30, 100).await.unwrap();
        assert_eq!(ranked.len(), 5);
        for (i, row) in ranked.iter().enumerate() {
            assert_eq!(row.rank, (i + 1) as u32);
            assert_eq!(row.period_days, 30);
            assert_eq!(row.labels, vec!["auto".to_string()]);
            assert!(row.address.starts_with("0xaddr"), "address not normalized");
        }

        let selected = read_selected(&db, 30, 100).await.unwrap();
        for pair in selected.windows(2) {
            assert!(pair[0].weight >= pair[1].weight);
        }
        // Heaviest selected row is rank 1.
        assert_eq!(selected[0].rank, 1);
    }

    #[tokio::test]
    async fn test_replace_period_is_idempotent() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let entries = ranked_fixture(4);
        let tracked = entries.clone();
        let mut series = HashMap::new();
        series.insert(
            entries[0].address.clone(),
            vec![month_series(&[(1_000, 1.0), (2_000, 2.0)], &[(1_000, 50.0)])],
        );

        replace_period(&db, 30, entries.clone(), &tracked, &series)
            .await
            .unwrap();
        let first_ranked = read_ranked(&db, 30, 100).await.unwrap();
        let first_points: i64 = db
            .call(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM pnl_points", [], |row| row.get(0))?)
            })
            .await
            .unwrap();

        replace_period(&db, 30, entries, &tracked, &series)
            .await
            .unwrap();
        let second_ranked = read_ranked(&db, 30, 100).await.unwrap();
        let second_points: i64 = db
            .call(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM pnl_points", [], |row| row.get(0))?)
            })
            .await
            .unwrap();

        assert_eq!(first_ranked.len(), second_ranked.len());
        assert_eq!(first_points, second_points);
        for (a, b) in first_ranked.iter().zip(&second_ranked) {
            assert_eq!(a.address, b.address);
            assert_eq!(a.rank, b.rank);
            assert_eq!(a.score, b.score);
            assert_eq!(a.weight, b.weight);
        }
    }

    #[tokio::test]
    async fn test_replace_period_does_not_touch_other_periods() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let entries = ranked_fixture(3);
        let tracked = entries.clone();

        replace_period(&db, 30, entries.clone(), &tracked, &HashMap::new())
            .await
            .unwrap();
        replace_period(&db, 7, entries, &tracked, &HashMap::new())
            .await
            .unwrap();

        assert_eq!(read_ranked(&db, 30, 100).await.unwrap().len(), 3);
        assert_eq!(read_ranked(&db, 7, 100).await.unwrap().len(), 3);

        // Re-replacing period 7 with nothing leaves period 30 intact.
        replace_period(&db, 7, Vec::new(), &[], &HashMap::new())
            .await
            .unwrap();
        assert_eq!(read_ranked(&db, 7, 100).await.unwrap().len(), 0);
        assert_eq!(read_ranked(&db, 30, 100).await.unwrap().len(), 3);
    }

    #[test]
    fn test_synthesize_points_sources_and_windows() {
        let tracked = ranked_fixture(1);
        let addr = tracked[0].address.clone();

        let mut series = HashMap::new();
        series.insert(
            addr.clone(),
            vec![
                month_series(&[(1_000, 10.0), (2_000, 20.0)], &[(2_000, 500.0), (3_000, 510.0)]),
                WindowSeries {
                    window: "day".to_string(),
                    pnl_history: vec![PnlSample {
                        timestamp_ms: 9_000,
                        value: 1.0,
                    }],
                    account_value_history: vec![],
                },
            ],
        );

        let points = synthesize_points(30, &tracked, &series);

        let hyperbot: Vec<&PnlPointRow> = points
            .iter()
            .filter(|p| p.source == PnlSource::Hyperbot)
            .collect();
        assert_eq!(hyperbot.len(), tracked[0].meta.raw.pnl_list.len());
        assert!(hyperbot.iter().all(|p| p.window_name == "period_30"));
        assert!(hyperbot.iter().all(|p| p.equity_value.is_none()));

        let hyperliquid: Vec<&PnlPointRow> = points
            .iter()
            .filter(|p| p.source == PnlSource::Hyperliquid)
            .collect();
        // The "day" window does not map to period 30 and must be skipped;
        // the month window merges pnl and equity by timestamp: 1000, 2000, 3000.
        assert_eq!(hyperliquid.len(), 3);
        assert!(hyperliquid.iter().all(|p| p.window_name == "month"));
        let merged = hyperliquid.iter().find(|p| p.point_ts == 2_000).unwrap();
        assert_eq!(merged.pnl_value, Some(20.0));
        assert_eq!(merged.equity_value, Some(500.0));
        let equity_only = hyperliquid.iter().find(|p| p.point_ts == 3_000).unwrap();
        assert_eq!(equity_only.pnl_value, None);
        assert_eq!(equity_only.equity_value, Some(510.0));
    }

    #[test]
    fn test_synthesize_points_dedupes_within_key() {
        let mut tracked = ranked_fixture(1);
        // Duplicate timestamp in the raw series: only one point may survive.
        let dup = tracked[0].meta.raw.pnl_list[0];
        tracked[0].meta.raw.pnl_list.push(dup);

        let points = synthesize_points(30, &tracked, &HashMap::new());
        let ts_list: Vec<i64> = points.iter().map(|p| p.point_ts).collect();
        let unique: HashSet<i64> = ts_list.iter().copied().collect();
        assert_eq!(ts_list.len(), unique.len());
    }
}
