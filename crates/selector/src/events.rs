use serde::Serialize;

use crate::scorer::RankedEntry;

/// One alpha-pool candidate, published per refresh cycle for every entry at
/// rank ≤ select_count. Delivery is at-most-once.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateEvent {
    pub address: String,
    pub source: String,
    /// ISO-8601 UTC publication time.
    pub ts: String,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    pub score_hint: f64,
    pub meta: CandidateMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateMeta {
    pub leaderboard: LeaderboardMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaderboardMeta {
    pub period_days: u32,
    pub rank: u32,
    pub weight: f64,
    pub score: f64,
    #[serde(rename = "winRate")]
    pub win_rate: f64,
    #[serde(rename = "executedOrders")]
    pub executed_orders: i64,
    #[serde(rename = "realizedPnl")]
    pub realized_pnl: f64,
    #[serde(rename = "pnlConsistency")]
    pub pnl_consistency: f64,
    pub efficiency: f64,
    pub labels: Vec<String>,
}

pub fn candidate_from_entry(entry: &RankedEntry, period: u32) -> CandidateEvent {
    CandidateEvent {
        address: entry.address.clone(),
        source: "daily".to_string(),
        ts: chrono::Utc::now().to_rfc3339(),
        tags: vec![format!("period:{period}"), "leaderboard".to_string()],
        nickname: entry.remark.clone(),
        score_hint: entry.score,
        meta: CandidateMeta {
            leaderboard: LeaderboardMeta {
                period_days: period,
                rank: entry.rank,
                weight: entry.weight,
                score: entry.score,
                win_rate: entry.win_rate,
                executed_orders: entry.executed_orders,
                realized_pnl: entry.realized_pnl,
                pnl_consistency: entry.pnl_consistency,
                efficiency: entry.efficiency,
                labels: entry.labels.clone(),
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scorer::{score, ScoringParams};
    use common::types::RawLeaderboardEntry;

    #[test]
    fn test_candidate_event_shape() {
        let raw = RawLeaderboardEntry {
            address: "0xAbC".to_string(),
            win_rate: Some(0.6),
            executed_orders: Some(50),
            realized_pnl: Some(1000.0),
            remark: Some("steady".to_string()),
            labels: vec!["whale".to_string()],
            ..Default::default()
        };
        let ranked = score(vec![raw], &ScoringParams::default(), 12, true).entries;
        let event = candidate_from_entry(&ranked[0], 30);

        assert_eq!(event.address, "0xabc");
        assert_eq!(event.source, "daily");
        assert_eq!(event.tags, vec!["period:30", "leaderboard"]);
        assert_eq!(event.nickname.as_deref(), Some("steady"));
        assert_eq!(event.meta.leaderboard.period_days, 30);
        assert_eq!(event.meta.leaderboard.rank, 1);

        let json = serde_json::to_value(&event).unwrap();
        assert!(json["meta"]["leaderboard"]["winRate"].is_number());
        assert!(json["meta"]["leaderboard"]["executedOrders"].is_number());
        assert!(json["ts"].as_str().unwrap().contains('T'));
    }
}
