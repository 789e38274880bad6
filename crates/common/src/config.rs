use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub general: General,
    pub database: Database,
    pub observability: Observability,
    pub upstream: Upstream,
    pub selector: Selector,
    pub concurrency: Concurrency,
    pub scoring: Scoring,
}

#[derive(Debug, Deserialize)]
pub struct General {
    pub log_level: String,
}

#[derive(Debug, Deserialize)]
pub struct Database {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct Observability {
    pub prometheus_port: u16,
}

#[derive(Debug, Deserialize)]
pub struct Upstream {
    pub leaderboard_url: String,
    pub stats_url: String,
    pub info_url: String,
    pub timeout_secs: u64,
    pub stats_retries: u32,
    pub series_retries: u32,
    pub backoff_base_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct Selector {
    pub top_n: usize,
    pub select_count: usize,
    pub enrich_count: usize,
    pub periods: Vec<u32>,
    pub page_size: u32,
    pub refresh_secs: u64,
    /// Wire value of the leaderboard sort order (see `types::Sort`).
    pub sort: i64,
    pub fallback_when_all_filtered: bool,
}

#[derive(Debug, Deserialize)]
pub struct Concurrency {
    pub stats_concurrency: usize,
    pub series_concurrency: usize,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Scoring {
    pub smooth_pnl_weight: f64,
    pub win_rate_weight: f64,
    pub pnl_weight: f64,
    pub trade_freq_weight: f64,
    pub optimal_trades: f64,
    pub trade_sigma: f64,
    pub pnl_reference: f64,
    pub max_drawdown_limit: f64,
    pub scalping_threshold: i64,
    pub max_trades_hard_limit: i64,
}

impl Config {
    /// Load from the path in `SELECTOR_CONFIG`, falling back to
    /// `config/default.toml`.
    pub fn load() -> Result<Self> {
        let path = std::env::var("SELECTOR_CONFIG")
            .unwrap_or_else(|_| "config/default.toml".to_string());
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_default_config() {
        let config = Config::from_toml_str(include_str!("../../../config/default.toml")).unwrap();
        assert_eq!(config.selector.top_n, 1000);
        assert_eq!(config.selector.select_count, 12);
        assert_eq!(config.selector.periods, vec![30]);
        assert_eq!(config.selector.sort, 3);
        assert!(config.selector.fallback_when_all_filtered);
        assert_eq!(config.concurrency.stats_concurrency, 4);
        assert_eq!(config.concurrency.series_concurrency, 2);
        assert_eq!(config.scoring.smooth_pnl_weight, 0.45);
        assert_eq!(config.scoring.max_trades_hard_limit, 200);
        assert_eq!(config.upstream.backoff_base_ms, 200);
    }

    #[test]
    fn test_scoring_weights_sum_to_one() {
        let config = Config::from_toml_str(include_str!("../../../config/default.toml")).unwrap();
        let s = config.scoring;
        let sum = s.smooth_pnl_weight + s.win_rate_weight + s.pnl_weight + s.trade_freq_weight;
        assert!((sum - 1.0).abs() < 1e-9);
    }
}
