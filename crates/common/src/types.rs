use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::num;

/// Sort orders accepted by the leaderboard page endpoint.
///
/// The numeric values are part of the wire contract; value 2 does not exist
/// upstream and the gap must be preserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Sort {
    WinRate,
    AccountValue,
    RealizedPnl,
    TradesCount,
    ProfitableTrades,
    LastOperation,
    AvgHoldingPeriod,
    CurrentPositions,
}

impl Sort {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::WinRate => 0,
            Self::AccountValue => 1,
            Self::RealizedPnl => 3,
            Self::TradesCount => 4,
            Self::ProfitableTrades => 5,
            Self::LastOperation => 6,
            Self::AvgHoldingPeriod => 7,
            Self::CurrentPositions => 8,
        }
    }

    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(Self::WinRate),
            1 => Some(Self::AccountValue),
            3 => Some(Self::RealizedPnl),
            4 => Some(Self::TradesCount),
            5 => Some(Self::ProfitableTrades),
            6 => Some(Self::LastOperation),
            7 => Some(Self::AvgHoldingPeriod),
            8 => Some(Self::CurrentPositions),
            _ => None,
        }
    }
}

impl Default for Sort {
    fn default() -> Self {
        Self::RealizedPnl
    }
}

/// Where a persisted PnL point came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PnlSource {
    Hyperbot,
    Hyperliquid,
}

impl PnlSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hyperbot => "hyperbot",
            Self::Hyperliquid => "hyperliquid",
        }
    }
}

/// Why an entry was rejected by a hard filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterReason {
    MaxDrawdownExceeded,
    ScalpingPenalty,
}

impl FilterReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MaxDrawdownExceeded => "max_drawdown_exceeded",
            Self::ScalpingPenalty => "scalping_penalty",
        }
    }
}

/// One (timestamp_ms, value) sample of a cumulative PnL or equity series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PnlSample {
    pub timestamp_ms: i64,
    pub value: f64,
}

/// Parse one upstream series point. Accepts `[ts, value]` tuples and
/// `{timestamp|ts|timestamp_ms, value|pnl}` records; anything else is `None`.
fn parse_pnl_sample(v: &Value) -> Option<PnlSample> {
    match v {
        Value::Array(pair) if pair.len() >= 2 => {
            let ts = num::as_finite_f64(&pair[0])? as i64;
            let value = num::as_finite_f64(&pair[1])?;
            Some(PnlSample {
                timestamp_ms: ts,
                value,
            })
        }
        Value::Object(map) => {
            let ts_raw = map
                .get("timestamp")
                .or_else(|| map.get("ts"))
                .or_else(|| map.get("timestamp_ms"))?;
            let val_raw = map.get("value").or_else(|| map.get("pnl"))?;
            Some(PnlSample {
                timestamp_ms: num::as_finite_f64(ts_raw)? as i64,
                value: num::as_finite_f64(val_raw)?,
            })
        }
        _ => None,
    }
}

/// Serde helper for series fields: drop malformed points, keep valid neighbors.
pub fn de_pnl_list<'de, D>(de: D) -> Result<Vec<PnlSample>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<Value>::deserialize(de)?;
    let Some(Value::Array(items)) = v else {
        return Ok(Vec::new());
    };
    Ok(items.iter().filter_map(parse_pnl_sample).collect())
}

/// Per-address stats blob, either nested in a leaderboard entry or returned
/// by the `query-addr-stat` endpoint. Every field tolerates absence,
/// string-typed numbers, and non-finite garbage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressStats {
    #[serde(rename = "winRate", deserialize_with = "num::de_opt_finite")]
    pub win_rate: Option<f64>,
    #[serde(rename = "openPosCount", deserialize_with = "num::de_opt_count")]
    pub open_pos_count: Option<i64>,
    #[serde(rename = "closePosCount", deserialize_with = "num::de_opt_count")]
    pub close_pos_count: Option<i64>,
    /// Average position duration in seconds.
    #[serde(rename = "avgPosDuration", deserialize_with = "num::de_opt_finite")]
    pub avg_pos_duration: Option<f64>,
    #[serde(rename = "totalPnl", deserialize_with = "num::de_opt_finite")]
    pub total_pnl: Option<f64>,
    #[serde(rename = "maxDrawdown", deserialize_with = "num::de_opt_finite")]
    pub max_drawdown: Option<f64>,
}

/// Raw entry from the leaderboard page API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawLeaderboardEntry {
    pub address: String,
    #[serde(rename = "winRate", deserialize_with = "num::de_opt_finite")]
    pub win_rate: Option<f64>,
    #[serde(rename = "executedOrders", deserialize_with = "num::de_opt_count")]
    pub executed_orders: Option<i64>,
    #[serde(rename = "realizedPnl", deserialize_with = "num::de_opt_finite")]
    pub realized_pnl: Option<f64>,
    pub remark: Option<String>,
    pub labels: Vec<String>,
    #[serde(rename = "pnlList", deserialize_with = "de_pnl_list")]
    pub pnl_list: Vec<PnlSample>,
    #[serde(rename = "maxDrawdown", deserialize_with = "num::de_opt_finite")]
    pub max_drawdown: Option<f64>,
    pub stats: Option<AddressStats>,
}

/// One named window of a trader's exchange portfolio history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowSeries {
    #[serde(skip_deserializing)]
    pub window: String,
    #[serde(rename = "pnlHistory", deserialize_with = "de_pnl_list")]
    pub pnl_history: Vec<PnlSample>,
    #[serde(rename = "accountValueHistory", deserialize_with = "de_pnl_list")]
    pub account_value_history: Vec<PnlSample>,
}

impl WindowSeries {
    /// Map an exchange window name to the lookback period it covers.
    pub fn period_days(&self) -> Option<u32> {
        match self.window.as_str() {
            "day" => Some(1),
            "week" => Some(7),
            "month" => Some(30),
            _ => None,
        }
    }
}
