use once_cell::sync::Lazy;
use url::Url;

/// Shared secret gating every dashboard API route. Must be set via `DASHBOARD_SECRET`.
pub static DASHBOARD_SECRET: Lazy<String> =
    Lazy::new(|| std::env::var("DASHBOARD_SECRET").expect("DASHBOARD_SECRET must be set"));

/// Metering API endpoint queried once per key. Must be set via `USAGE_API_URL`.
pub static USAGE_API_URL: Lazy<String> = Lazy::new(|| {
    let raw = std::env::var("USAGE_API_URL").expect("USAGE_API_URL must be set");
    let trimmed = raw.trim().trim_end_matches('/').to_string();
    Url::parse(&trimmed).unwrap_or_else(|err| panic!("USAGE_API_URL is not a valid URL: {err}"));
    trimmed
});

/// Durable store backend. `postgres` (default) or `memory` for single-node deployments.
pub static STORE_BACKEND: Lazy<String> =
    Lazy::new(|| std::env::var("STORE_BACKEND").unwrap_or_else(|_| "postgres".to_string()));

/// Address the HTTP server should bind to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP server should listen on. Defaults to `3000`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(3000)
});

/// When set to a truthy value, allows the application to continue running even if database
/// migrations fail. Defaults to `false`.
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| {
    std::env::var("ALLOW_MIGRATION_FAILURE")
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes")
        })
        .unwrap_or(false)
});

/// key: refresh-config -> background refresh cadence
pub static REFRESH_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("REFRESH_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(60)
});

/// key: refresh-config -> tombstone retention window
///
/// Scales with the refresh cadence so a retention shorter than an in-flight
/// refresh cycle cannot resurrect a deleted key.
pub static TOMBSTONE_RETENTION_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("TOMBSTONE_RETENTION_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or_else(|| *REFRESH_INTERVAL_SECS * 2)
});

/// key: refresh-config -> cross-process refresh lock lease
pub static REFRESH_LOCK_TTL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("REFRESH_LOCK_TTL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(30)
});

/// Number of keys fetched concurrently per batch.
pub static FETCH_BATCH_SIZE: Lazy<usize> = Lazy::new(|| {
    std::env::var("FETCH_BATCH_SIZE")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(10)
});

/// Pause between fetch batches, in milliseconds. Keeps the pipeline under
/// upstream rate limits.
pub static FETCH_BATCH_PAUSE_MS: Lazy<u64> = Lazy::new(|| {
    std::env::var("FETCH_BATCH_PAUSE_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(100)
});

/// Per-request timeout for metering API calls, in seconds.
pub static FETCH_TIMEOUT_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("FETCH_TIMEOUT_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(30)
});
