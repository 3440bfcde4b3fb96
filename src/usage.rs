use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use uuid::Uuid;

/// Usage window reported by the metering API for one key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyUsage {
    pub id: Uuid,
    pub masked_secret: String,
    pub secret: String,
    pub window_start: String,
    pub window_end: String,
    pub used: f64,
    pub allowance: f64,
    pub used_ratio: f64,
    pub imported_at: DateTime<Utc>,
}

impl KeyUsage {
    pub fn remaining(&self) -> f64 {
        (self.allowance - self.used).max(0.0)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyFailure {
    pub id: Uuid,
    pub masked_secret: String,
    pub secret: String,
    pub error: String,
    pub imported_at: DateTime<Utc>,
}

/// Outcome of fetching one key. Exactly one variant exists per id per
/// snapshot; numeric fields are only meaningful on `Ok`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UsageResult {
    Ok(KeyUsage),
    Error(KeyFailure),
}

impl UsageResult {
    pub fn id(&self) -> Uuid {
        match self {
            UsageResult::Ok(usage) => usage.id,
            UsageResult::Error(failure) => failure.id,
        }
    }

    pub fn as_usage(&self) -> Option<&KeyUsage> {
        match self {
            UsageResult::Ok(usage) => Some(usage),
            UsageResult::Error(_) => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub total_used: f64,
    pub total_allowance: f64,
    pub total_remaining: f64,
}

/// One complete, internally consistent aggregation. Produced wholesale by a
/// refresh, read-only afterwards; `totals` and `total_count` are always
/// derivable from `items`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AggregatedSnapshot {
    pub generated_at: String,
    pub total_count: usize,
    pub totals: UsageTotals,
    pub items: Vec<UsageResult>,
}

impl AggregatedSnapshot {
    /// Combine raw fetch results: successful keys first by descending
    /// remaining allowance, failures after them in fetch order.
    pub fn build(results: Vec<UsageResult>) -> Self {
        let mut ok_items = Vec::new();
        let mut failed_items = Vec::new();
        for result in results {
            match result {
                UsageResult::Ok(_) => ok_items.push(result),
                UsageResult::Error(_) => failed_items.push(result),
            }
        }
        ok_items.sort_by(|a, b| {
            let left = a.as_usage().map(KeyUsage::remaining).unwrap_or(0.0);
            let right = b.as_usage().map(KeyUsage::remaining).unwrap_or(0.0);
            right.partial_cmp(&left).unwrap_or(Ordering::Equal)
        });
        ok_items.extend(failed_items);
        Self::from_items(Utc::now().to_rfc3339(), ok_items)
    }

    /// Copy with only the items accepted by `keep`, totals recomputed. The
    /// original is left untouched.
    pub fn filtered<F>(&self, keep: F) -> Self
    where
        F: Fn(&Uuid) -> bool,
    {
        let items: Vec<UsageResult> = self
            .items
            .iter()
            .filter(|item| keep(&item.id()))
            .cloned()
            .collect();
        Self::from_items(self.generated_at.clone(), items)
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.items.iter().any(|item| item.id() == id)
    }

    fn from_items(generated_at: String, items: Vec<UsageResult>) -> Self {
        let totals = compute_totals(&items);
        Self {
            generated_at,
            total_count: items.len(),
            totals,
            items,
        }
    }
}

fn compute_totals(items: &[UsageResult]) -> UsageTotals {
    let mut totals = UsageTotals::default();
    for usage in items.iter().filter_map(UsageResult::as_usage) {
        totals.total_used += usage.used;
        totals.total_allowance += usage.allowance;
        totals.total_remaining += usage.remaining();
    }
    totals
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(allowance: f64, used: f64) -> UsageResult {
        UsageResult::Ok(KeyUsage {
            id: Uuid::new_v4(),
            masked_secret: "sk-…1234".to_string(),
            secret: "sk-test".to_string(),
            window_start: "2026-08-01".to_string(),
            window_end: "2026-08-31".to_string(),
            used,
            allowance,
            used_ratio: if allowance > 0.0 { used / allowance } else { 0.0 },
            imported_at: Utc::now(),
        })
    }

    fn failure(error: &str) -> UsageResult {
        UsageResult::Error(KeyFailure {
            id: Uuid::new_v4(),
            masked_secret: "sk-…5678".to_string(),
            secret: "sk-broken".to_string(),
            error: error.to_string(),
            imported_at: Utc::now(),
        })
    }

    #[test]
    fn totals_sum_successes_only() {
        let snapshot = AggregatedSnapshot::build(vec![
            usage(1000.0, 400.0),
            usage(500.0, 500.0),
            failure("HTTP 500"),
        ]);

        assert_eq!(snapshot.total_count, 3);
        assert_eq!(snapshot.totals.total_used, 400.0);
        assert_eq!(snapshot.totals.total_allowance, 1500.0);
        assert_eq!(snapshot.totals.total_remaining, 600.0);
    }

    #[test]
    fn successes_sort_by_descending_remaining_with_failures_last() {
        let exhausted = usage(500.0, 500.0);
        let healthy = usage(1000.0, 400.0);
        let broken = failure("Failed to fetch");
        let snapshot =
            AggregatedSnapshot::build(vec![exhausted.clone(), broken.clone(), healthy.clone()]);

        let ids: Vec<Uuid> = snapshot.items.iter().map(UsageResult::id).collect();
        assert_eq!(ids, vec![healthy.id(), exhausted.id(), broken.id()]);
    }

    #[test]
    fn remaining_never_goes_negative() {
        let overdrawn = usage(100.0, 250.0);
        assert_eq!(overdrawn.as_usage().unwrap().remaining(), 0.0);

        let snapshot = AggregatedSnapshot::build(vec![overdrawn]);
        assert_eq!(snapshot.totals.total_remaining, 0.0);
    }

    #[test]
    fn filtered_copy_recomputes_totals_without_touching_the_original() {
        let keep = usage(1000.0, 400.0);
        let drop = usage(500.0, 100.0);
        let dropped_id = drop.id();
        let snapshot = AggregatedSnapshot::build(vec![keep, drop]);

        let filtered = snapshot.filtered(|id| *id != dropped_id);
        assert_eq!(filtered.total_count, 1);
        assert_eq!(filtered.totals.total_allowance, 1000.0);
        assert_eq!(filtered.generated_at, snapshot.generated_at);

        assert_eq!(snapshot.total_count, 2);
        assert_eq!(snapshot.totals.total_allowance, 1500.0);
    }

    #[test]
    fn tagged_serialization_keeps_one_variant_per_item() {
        let snapshot = AggregatedSnapshot::build(vec![usage(10.0, 1.0), failure("HTTP 401")]);
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["items"][0]["status"], "ok");
        assert_eq!(value["items"][1]["status"], "error");
        assert_eq!(value["items"][1]["error"], "HTTP 401");

        let back: AggregatedSnapshot = serde_json::from_value(value).unwrap();
        assert_eq!(back.total_count, 2);
    }
}
