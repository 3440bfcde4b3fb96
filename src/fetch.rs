use chrono::TimeZone;
use futures_util::future::join_all;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::keys::KeyRecord;
use crate::usage::{KeyFailure, KeyUsage, UsageResult};

/// Extra attempts granted to a 401 before it becomes a per-key failure.
/// Covers transient credential propagation upstream, not genuine invalidity.
const AUTH_RETRY_LIMIT: u32 = 2;

#[derive(Clone, Debug)]
pub struct FetchOptions {
    pub batch_size: usize,
    pub batch_pause: Duration,
    pub auth_retry_delay: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_pause: Duration::from_millis(100),
            auth_retry_delay: Duration::from_secs(1),
        }
    }
}

/// Client for the external metering API. Every input record yields exactly
/// one [`UsageResult`]; errors never escape the pipeline boundary.
#[derive(Clone)]
pub struct UsageClient {
    http: Client,
    endpoint: String,
    options: FetchOptions,
}

impl UsageClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration, options: FetchOptions) -> Self {
        Self {
            http: Client::builder()
                .timeout(timeout)
                .build()
                .expect("client build"),
            endpoint: endpoint.into(),
            options,
        }
    }

    /// Fetch the usage window for a single key.
    pub async fn fetch_one(&self, record: &KeyRecord) -> UsageResult {
        let mut attempt = 0u32;
        loop {
            let response = match self
                .http
                .get(&self.endpoint)
                .bearer_auth(&record.secret)
                .send()
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    debug!(?err, key = %record.id, "metering request failed in transit");
                    return failure(record, "Failed to fetch");
                }
            };

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED && attempt < AUTH_RETRY_LIMIT {
                attempt += 1;
                tokio::time::sleep(self.options.auth_retry_delay * attempt).await;
                continue;
            }
            if !status.is_success() {
                return failure(record, &format!("HTTP {}", status.as_u16()));
            }

            return match response.json::<UsageEnvelope>().await {
                Ok(envelope) => success(record, envelope),
                Err(err) => {
                    debug!(?err, key = %record.id, "metering payload did not parse");
                    failure(record, "Invalid API response")
                }
            };
        }
    }

    /// Fetch all records in fixed-size concurrent batches with a pause
    /// between batches. Output order matches input order; the snapshot
    /// builder re-sorts.
    pub async fn fetch_all(&self, records: &[KeyRecord]) -> Vec<UsageResult> {
        let mut results = Vec::with_capacity(records.len());
        let mut batches = records.chunks(self.options.batch_size.max(1)).peekable();
        while let Some(batch) = batches.next() {
            results.extend(join_all(batch.iter().map(|record| self.fetch_one(record))).await);
            if batches.peek().is_some() && !self.options.batch_pause.is_zero() {
                tokio::time::sleep(self.options.batch_pause).await;
            }
        }
        results
    }
}

#[derive(Deserialize)]
struct UsageEnvelope {
    usage: UsageWindow,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageWindow {
    start_date: i64,
    end_date: i64,
    standard: StandardUsage,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StandardUsage {
    org_total_tokens_used: f64,
    total_allowance: f64,
    used_ratio: f64,
}

fn success(record: &KeyRecord, envelope: UsageEnvelope) -> UsageResult {
    let window = envelope.usage;
    let (Some(window_start), Some(window_end)) = (
        epoch_ms_to_date(window.start_date),
        epoch_ms_to_date(window.end_date),
    ) else {
        return failure(record, "Invalid API response");
    };
    UsageResult::Ok(KeyUsage {
        id: record.id,
        masked_secret: record.masked_secret(),
        secret: record.secret.clone(),
        window_start,
        window_end,
        used: window.standard.org_total_tokens_used,
        allowance: window.standard.total_allowance,
        used_ratio: window.standard.used_ratio,
        imported_at: record.imported_at,
    })
}

fn failure(record: &KeyRecord, error: &str) -> UsageResult {
    UsageResult::Error(KeyFailure {
        id: record.id,
        masked_secret: record.masked_secret(),
        secret: record.secret.clone(),
        error: error.to_string(),
        imported_at: record.imported_at,
    })
}

fn epoch_ms_to_date(ms: i64) -> Option<String> {
    chrono::Utc
        .timestamp_millis_opt(ms)
        .single()
        .map(|at| at.format("%Y-%m-%d").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_milliseconds_render_as_dates() {
        assert_eq!(epoch_ms_to_date(0).as_deref(), Some("1970-01-01"));
        assert_eq!(
            epoch_ms_to_date(1_754_352_000_000).as_deref(),
            Some("2025-08-05")
        );
        assert_eq!(epoch_ms_to_date(i64::MAX), None);
    }
}
