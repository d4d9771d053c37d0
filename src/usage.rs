use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime};
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::config::DEFAULT_RATE_WINDOW_MINUTES;

#[derive(Debug, Clone, Serialize, Default, PartialEq, Eq)]
pub struct TokenCounts {
    pub input: u64,
    pub output: u64,
    pub reasoning: u64,
    pub cached: u64,
    /// As reported upstream; zero when absent.
    pub total: u64,
}

impl TokenCounts {
    /// Reported total when positive, else input + output + reasoning (cached is part of input).
    pub fn effective_total(&self) -> u64 {
        if self.total > 0 {
            return self.total;
        }
        self.input
            .saturating_add(self.output)
            .saturating_add(self.reasoning)
    }
}

/// One historical API call as reported by the management `/usage` endpoint.
#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct UsageDetail {
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Raw value; see [`normalize_auth_index`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_index: Option<JsonValue>,
    pub failed: bool,
    pub tokens: TokenCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AccountLoadStats {
    pub id: String,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_requests: u64,
    /// Percentage, two decimals.
    pub success_rate: f64,
    /// Share of all observed requests, percentage, two decimals.
    pub load_rate: f64,
}

#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct UsageAggregate {
    pub total_requests: u64,
    pub by_source: BTreeMap<String, AccountLoadStats>,
    pub by_auth_index: BTreeMap<String, AccountLoadStats>,
}

#[derive(Debug, Clone, Copy, Serialize, Default, PartialEq)]
pub struct RecentRates {
    pub window_minutes: u64,
    pub request_count: u64,
    pub token_count: u64,
    pub requests_per_minute: f64,
    pub tokens_per_minute: f64,
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// `success / (success + failure) * 100`; an empty bucket counts as fully successful.
pub fn success_rate(success: u64, failure: u64) -> f64 {
    let total = success.saturating_add(failure);
    if total == 0 {
        return 100.0;
    }
    round2(success as f64 / total as f64 * 100.0)
}

/// `bucket / total * 100`; zero when nothing was observed.
pub fn load_rate(bucket_total: u64, global_total: u64) -> f64 {
    if global_total == 0 {
        return 0.0;
    }
    round2(bucket_total as f64 / global_total as f64 * 100.0)
}

/// Numbers become their decimal form, strings are trimmed; anything else (or blank) is excluded.
pub fn normalize_auth_index(raw: &JsonValue) -> Option<String> {
    match raw {
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else if let Some(u) = n.as_u64() {
                Some(u.to_string())
            } else {
                let f = n.as_f64()?;
                if !f.is_finite() {
                    None
                } else if f.fract() == 0.0 && f.abs() < 1e15 {
                    Some(format!("{}", f as i64))
                } else {
                    Some(f.to_string())
                }
            }
        }
        JsonValue::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                None
            } else {
                Some(s.to_string())
            }
        }
        _ => None,
    }
}

#[derive(Default)]
struct Counter {
    success: u64,
    failure: u64,
}

impl Counter {
    fn record(&mut self, failed: bool) {
        if failed {
            self.failure = self.failure.saturating_add(1);
        } else {
            self.success = self.success.saturating_add(1);
        }
    }
}

fn finish(buckets: BTreeMap<String, Counter>, total: u64) -> BTreeMap<String, AccountLoadStats> {
    buckets
        .into_iter()
        .map(|(id, c)| {
            let bucket_total = c.success.saturating_add(c.failure);
            let stats = AccountLoadStats {
                id: id.clone(),
                success_count: c.success,
                failure_count: c.failure,
                total_requests: bucket_total,
                success_rate: success_rate(c.success, c.failure),
                load_rate: load_rate(bucket_total, total),
            };
            (id, stats)
        })
        .collect()
}

/// Fold usage records into per-source and per-auth-index statistics.
///
/// The two maps are independent views: a record lands in each bucket whose key it carries.
pub fn aggregate(details: &[UsageDetail]) -> UsageAggregate {
    let mut total = 0u64;
    let mut by_source: BTreeMap<String, Counter> = BTreeMap::new();
    let mut by_auth_index: BTreeMap<String, Counter> = BTreeMap::new();

    for detail in details {
        total = total.saturating_add(1);
        if let Some(source) = detail.source.as_deref().map(str::trim)
            && !source.is_empty()
        {
            by_source
                .entry(source.to_string())
                .or_default()
                .record(detail.failed);
        }
        if let Some(key) = detail.auth_index.as_ref().and_then(normalize_auth_index) {
            by_auth_index.entry(key).or_default().record(detail.failed);
        }
    }

    UsageAggregate {
        total_requests: total,
        by_source: finish(by_source, total),
        by_auth_index: finish(by_auth_index, total),
    }
}

/// Parse an RFC 3339 timestamp (or a naive `YYYY-MM-DD HH:MM:SS`, read as UTC) into unix ms.
pub fn parse_timestamp_ms(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp_millis());
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|dt| dt.and_utc().timestamp_millis())
}

/// Requests and tokens per minute over `[now - window, now]`. Unparseable timestamps are skipped.
pub fn calculate_recent_per_minute_rates(
    details: &[UsageDetail],
    window_minutes: u64,
    now_ms: u64,
) -> RecentRates {
    let mut rates = RecentRates {
        window_minutes,
        ..Default::default()
    };
    if window_minutes == 0 {
        return rates;
    }

    let now = i64::try_from(now_ms).unwrap_or(i64::MAX);
    let window_ms = i64::try_from(window_minutes)
        .unwrap_or(i64::MAX)
        .saturating_mul(60_000);
    let start = now.saturating_sub(window_ms);
    for detail in details {
        let Some(ts) = parse_timestamp_ms(&detail.timestamp) else {
            continue;
        };
        if ts < start || ts > now {
            continue;
        }
        rates.request_count = rates.request_count.saturating_add(1);
        rates.token_count = rates
            .token_count
            .saturating_add(detail.tokens.effective_total());
    }

    let minutes = window_minutes as f64;
    rates.requests_per_minute = rates.request_count as f64 / minutes;
    rates.tokens_per_minute = rates.token_count as f64 / minutes;
    rates
}

/// Same as [`calculate_recent_per_minute_rates`] with the default 30 minute window.
pub fn recent_per_minute_rates(details: &[UsageDetail], now_ms: u64) -> RecentRates {
    calculate_recent_per_minute_rates(details, DEFAULT_RATE_WINDOW_MINUTES, now_ms)
}

fn to_u64(v: &JsonValue) -> u64 {
    match v {
        JsonValue::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f > 0.0).map(|f| f as u64))
            .unwrap_or(0),
        JsonValue::String(s) => s.trim().parse::<f64>().ok().map(|f| f.max(0.0) as u64).unwrap_or(0),
        _ => 0,
    }
}

fn tokens_from_value(tokens: &JsonValue) -> TokenCounts {
    let field = |key: &str| tokens.get(key).map(to_u64).unwrap_or(0);
    TokenCounts {
        input: field("input_tokens"),
        output: field("output_tokens"),
        reasoning: field("reasoning_tokens"),
        cached: field("cached_tokens"),
        total: field("total_tokens"),
    }
}

fn detail_from_value(api: &str, model: &str, v: &JsonValue) -> Option<UsageDetail> {
    let obj = v.as_object()?;
    let source = obj
        .get("source")
        .and_then(|s| s.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let auth_index = obj.get("auth_index").filter(|v| !v.is_null()).cloned();
    Some(UsageDetail {
        timestamp: obj
            .get("timestamp")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string(),
        source,
        auth_index,
        failed: obj.get("failed").and_then(|f| f.as_bool()).unwrap_or(false),
        tokens: obj.get("tokens").map(tokens_from_value).unwrap_or_default(),
        api: Some(api.to_string()),
        model: Some(model.to_string()),
    })
}

/// Flatten `usage.apis.<api>.models.<model>.details[]` from a `/usage` payload.
///
/// Accepts the payload with or without the outer `usage` wrapper; entries that are not
/// objects are skipped.
pub fn collect_usage_details(payload: &JsonValue) -> Vec<UsageDetail> {
    let root = payload.get("usage").unwrap_or(payload);
    let Some(apis) = root.get("apis").and_then(|v| v.as_object()) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for (api, api_data) in apis {
        let Some(models) = api_data.get("models").and_then(|v| v.as_object()) else {
            continue;
        };
        for (model, model_data) in models {
            let Some(details) = model_data.get("details").and_then(|v| v.as_array()) else {
                continue;
            };
            out.extend(
                details
                    .iter()
                    .filter_map(|d| detail_from_value(api, model, d)),
            );
        }
    }
    out
}
