use std::time::Duration;

use anyhow::Result;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;

use crate::types::{AddressStats, RawLeaderboardEntry, Sort, WindowSeries};

/// Failure bucket for an upstream call.
///
/// IMPORTANT: keep this set small — the kinds end up as metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Http,
    Decode,
    Timeout,
    Network,
}

impl UpstreamErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Decode => "decode",
            Self::Timeout => "timeout",
            Self::Network => "network",
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub url: String,
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "upstream {} ({status}) for {}", self.kind.as_str(), self.url),
            None => write!(f, "upstream {} for {}", self.kind.as_str(), self.url),
        }
    }
}

impl std::error::Error for UpstreamError {}

/// Walk an error chain and label it with one upstream failure kind.
pub fn classify_upstream_error(err: &anyhow::Error) -> UpstreamErrorKind {
    for cause in err.chain() {
        if let Some(u) = cause.downcast_ref::<UpstreamError>() {
            return u.kind;
        }
        if let Some(r) = cause.downcast_ref::<reqwest::Error>() {
            if r.is_timeout() {
                return UpstreamErrorKind::Timeout;
            }
            if r.is_decode() {
                return UpstreamErrorKind::Decode;
            }
            return UpstreamErrorKind::Network;
        }
        if cause.downcast_ref::<serde_json::Error>().is_some() {
            return UpstreamErrorKind::Decode;
        }
    }
    UpstreamErrorKind::Network
}

/// Typed fetcher for the three upstream endpoints: the leaderboard page API,
/// the per-address stats API, and the exchange portfolio-history API.
///
/// One reqwest client is shared across all calls; the per-request timeout is
/// enforced by the client itself, so a timed-out attempt surfaces as a
/// retryable transport error.
pub struct UpstreamClient {
    leaderboard_url: String,
    stats_url: String,
    info_url: String,
    client: Client,
    stats_retries: u32,
    series_retries: u32,
    backoff_base: Duration,
}

impl UpstreamClient {
    pub fn new(leaderboard_url: &str, stats_url: &str, info_url: &str) -> Self {
        Self::new_with_settings(
            leaderboard_url,
            stats_url,
            info_url,
            Duration::from_secs(8),
            2,
            1,
            Duration::from_millis(200),
        )
    }

    pub fn new_with_settings(
        leaderboard_url: &str,
        stats_url: &str,
        info_url: &str,
        timeout: Duration,
        stats_retries: u32,
        series_retries: u32,
        backoff_base: Duration,
    ) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client build failed");

        Self {
            leaderboard_url: leaderboard_url.trim_end_matches('/').to_string(),
            stats_url: stats_url.trim_end_matches('/').to_string(),
            info_url: info_url.to_string(),
            client,
            stats_retries,
            series_retries,
            backoff_base,
        }
    }

    pub fn page_url(&self, period: u32, page_num: u32, page_size: u32, sort: Sort) -> String {
        let mut url = Url::parse(&self.leaderboard_url)
            .expect("leaderboard_url must be a valid absolute URL");
        {
            let mut qp = url.query_pairs_mut();
            qp.append_pair("pageNum", &page_num.to_string());
            qp.append_pair("pageSize", &page_size.to_string());
            qp.append_pair("period", &period.to_string());
            qp.append_pair("sort", &sort.as_i64().to_string());
        }
        url.to_string()
    }

    pub fn addr_stat_url(&self, address: &str, period: u32) -> String {
        format!("{}/query-addr-stat/{address}?period={period}", self.stats_url)
    }

    /// Fetch one leaderboard page. `has_more` is true when the page came back
    /// full. No retries: page boundaries matter more for throughput than the
    /// success of any single page.
    pub async fn fetch_page(
        &self,
        period: u32,
        page_num: u32,
        page_size: u32,
        sort: Sort,
    ) -> Result<(Vec<RawLeaderboardEntry>, bool)> {
        let url = Url::parse(&self.page_url(period, page_num, page_size, sort))?;
        let body = self.get_with_retry(url.clone(), 0).await?;
        let entries = parse_page_body(&body, url.as_str())?;
        let has_more = entries.len() == page_size as usize;
        Ok((entries, has_more))
    }

    /// Fetch enrichment stats for one address. A well-formed "no data"
    /// response is `Ok(None)`, never an error.
    pub async fn fetch_address_stat(
        &self,
        address: &str,
        period: u32,
    ) -> Result<Option<AddressStats>> {
        let url = Url::parse(&self.addr_stat_url(address, period))?;
        let body = self.get_with_retry(url, self.stats_retries).await?;
        Ok(parse_stat_body(&body))
    }

    /// Fetch the exchange-native portfolio history for one address as a list
    /// of named windows. Structurally invalid payloads are `Ok(None)`.
    pub async fn fetch_portfolio_series(&self, address: &str) -> Result<Option<Vec<WindowSeries>>> {
        let url = Url::parse(&self.info_url)?;
        let payload = serde_json::json!({ "type": "portfolio", "user": address });
        let body = self
            .post_json_with_retry(url, &payload, self.series_retries)
            .await?;
        Ok(parse_portfolio_body(&body))
    }

    async fn get_with_retry(&self, url: Url, retries: u32) -> Result<Vec<u8>> {
        let mut attempt = 0_u32;
        loop {
            attempt += 1;
            let outcome = match self.client.get(url.clone()).send().await {
                Ok(resp) => self.read_response(resp, &url).await,
                Err(e) => Err(RequestFailure::Transport(e)),
            };
            match self.settle(outcome, &url, attempt, retries).await? {
                Some(body) => return Ok(body),
                None => continue,
            }
        }
    }

    async fn post_json_with_retry(
        &self,
        url: Url,
        payload: &Value,
        retries: u32,
    ) -> Result<Vec<u8>> {
        let mut attempt = 0_u32;
        loop {
            attempt += 1;
            let outcome = match self.client.post(url.clone()).json(payload).send().await {
                Ok(resp) => self.read_response(resp, &url).await,
                Err(e) => Err(RequestFailure::Transport(e)),
            };
            match self.settle(outcome, &url, attempt, retries).await? {
                Some(body) => return Ok(body),
                None => continue,
            }
        }
    }

    async fn read_response(
        &self,
        resp: reqwest::Response,
        _url: &Url,
    ) -> std::result::Result<Vec<u8>, RequestFailure> {
        let status = resp.status();
        if status.is_success() {
            return match resp.bytes().await {
                Ok(b) => Ok(b.to_vec()),
                Err(e) => Err(RequestFailure::Transport(e)),
            };
        }
        Err(RequestFailure::Status(status))
    }

    /// Decide between returning, retrying (linear backoff), and failing.
    /// `Ok(Some(body))` = done, `Ok(None)` = retry.
    async fn settle(
        &self,
        outcome: std::result::Result<Vec<u8>, RequestFailure>,
        url: &Url,
        attempt: u32,
        retries: u32,
    ) -> Result<Option<Vec<u8>>> {
        match outcome {
            Ok(body) => Ok(Some(body)),
            Err(RequestFailure::Status(status)) => {
                let retryable = status == StatusCode::TOO_MANY_REQUESTS
                    || status == StatusCode::REQUEST_TIMEOUT
                    || status.is_server_error();
                if retryable && attempt <= retries {
                    tokio::time::sleep(self.backoff_base * attempt).await;
                    return Ok(None);
                }
                Err(anyhow::Error::new(UpstreamError {
                    kind: UpstreamErrorKind::Http,
                    status: Some(status),
                    url: url.to_string(),
                }))
            }
            Err(RequestFailure::Transport(e)) => {
                if attempt <= retries {
                    tokio::time::sleep(self.backoff_base * attempt).await;
                    return Ok(None);
                }
                let kind = if e.is_timeout() {
                    UpstreamErrorKind::Timeout
                } else {
                    UpstreamErrorKind::Network
                };
                Err(anyhow::Error::new(e).context(UpstreamError {
                    kind,
                    status: None,
                    url: url.to_string(),
                }))
            }
        }
    }
}

enum RequestFailure {
    Status(StatusCode),
    Transport(reqwest::Error),
}

fn decode_error(url: &str) -> anyhow::Error {
    anyhow::Error::new(UpstreamError {
        kind: UpstreamErrorKind::Decode,
        status: None,
        url: url.to_string(),
    })
}

fn body_snippet(body: &[u8]) -> String {
    String::from_utf8_lossy(&body[..body.len().min(200)]).into_owned()
}

/// Page body must be an object with `data: array`; entries that are not
/// objects are dropped with a warning rather than failing the page.
fn parse_page_body(body: &[u8], url: &str) -> Result<Vec<RawLeaderboardEntry>> {
    let v: Value = serde_json::from_slice(body).map_err(|e| {
        tracing::warn!(url, snippet = %body_snippet(body), "leaderboard body is not JSON");
        anyhow::Error::new(e).context(UpstreamError {
            kind: UpstreamErrorKind::Decode,
            status: None,
            url: url.to_string(),
        })
    })?;

    let Some(data) = v.get("data").and_then(Value::as_array) else {
        tracing::warn!(url, snippet = %body_snippet(body), "leaderboard body missing data array");
        return Err(decode_error(url));
    };

    let mut entries = Vec::with_capacity(data.len());
    let mut dropped = 0_usize;
    for item in data {
        match serde_json::from_value::<RawLeaderboardEntry>(item.clone()) {
            Ok(e) if !e.address.is_empty() => entries.push(e),
            _ => dropped += 1,
        }
    }
    if dropped > 0 {
        tracing::warn!(url, dropped, "dropped malformed leaderboard entries");
    }
    Ok(entries)
}

fn parse_stat_body(body: &[u8]) -> Option<AddressStats> {
    let v: Value = serde_json::from_slice(body).ok()?;
    let data = v.get("data")?;
    if !data.is_object() {
        return None;
    }
    serde_json::from_value(data.clone()).ok()
}

/// Portfolio body is a list of `[windowName, {pnlHistory, accountValueHistory}]`
/// tuples. Malformed windows are skipped; malformed points inside a window are
/// already dropped by the series deserializer.
fn parse_portfolio_body(body: &[u8]) -> Option<Vec<WindowSeries>> {
    let v: Value = serde_json::from_slice(body).ok()?;
    let items = v.as_array()?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let Some(pair) = item.as_array() else {
            continue;
        };
        let (Some(name), Some(window_body)) = (pair.first(), pair.get(1)) else {
            continue;
        };
        let Some(name) = name.as_str() else {
            continue;
        };
        let Ok(mut series) = serde_json::from_value::<WindowSeries>(window_body.clone()) else {
            continue;
        };
        series.window = name.to_string();
        out.push(series);
    }
    Some(out)
}
