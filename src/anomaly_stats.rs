//! Per-(route,status,hour) response counters and the dense hourly series
//! derived from them.

use std::collections::HashSet;

use crate::error::MonitorError;
use crate::store::{keys, Store};

pub struct AnomalyStats {
    ttl_secs: i64,
}

impl AnomalyStats {
    pub fn new(ttl_secs: i64) -> Self {
        Self { ttl_secs }
    }

    pub async fn record_request(
        &self,
        store: &dyn Store,
        log_hour: &str,
        status: i32,
        route: &str,
        num_seen: i64,
    ) -> Result<(), MonitorError> {
        let status = status.to_string();
        let key = keys::route_status_hour(route, &status, log_hour);
        store.set_with_ttl(&key, &num_seen.to_string(), self.ttl_secs).await?;

        store.set_add(keys::SEEN_ROUTES, route).await?;
        store.set_add(keys::SEEN_STATUSES, &status).await?;

        if store.zscore(keys::AVAILABLE_LOGS, log_hour).await?.is_none() {
            let seq = store.hash_incr("available_logs:seq", "n", 1).await?;
            store.zadd(keys::AVAILABLE_LOGS, log_hour, seq as f64).await?;
        }
        Ok(())
    }

    /// After an hour's requests query has been recorded, write explicit 0s
    /// for every previously-seen (route,status) pair absent from this
    /// hour's results, so a disappearance reads as a true drop rather than
    /// a gap.
    pub async fn backfill_missing(
        &self,
        store: &dyn Store,
        log_hour: &str,
        observed: &HashSet<(String, String)>,
    ) -> Result<(), MonitorError> {
        let routes = store.set_members(keys::SEEN_ROUTES).await?;
        let statuses = store.set_members(keys::SEEN_STATUSES).await?;
        for route in &routes {
            for status in &statuses {
                if observed.contains(&(route.clone(), status.clone())) {
                    continue;
                }
                let key = keys::route_status_hour(route, status, log_hour);
                if store.get(&key).await?.is_none() {
                    store.set_with_ttl(&key, "0", self.ttl_secs).await?;
                }
            }
        }
        Ok(())
    }

    pub async fn response_count(&self, store: &dyn Store, route: &str, status: i32, log_hour: &str) -> Result<i64, MonitorError> {
        let key = keys::route_status_hour(route, &status.to_string(), log_hour);
        Ok(store.get(&key).await?.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    /// Dense, chronological (hours, counts) for a (route, status), skipping
    /// only leading zeros — a later drop to zero is preserved.
    pub async fn hourly_series(&self, store: &dyn Store, route: &str, status: i32) -> Result<(Vec<String>, Vec<i64>), MonitorError> {
        let ordered_hours = store.zrange_by_score(keys::AVAILABLE_LOGS, f64::MIN, f64::MAX).await?;
        let mut hours = Vec::with_capacity(ordered_hours.len());
        let mut counts = Vec::with_capacity(ordered_hours.len());
        let mut started = false;
        for (hour, _) in ordered_hours {
            let count = self.response_count(store, route, status, &hour).await?;
            if !started && count == 0 {
                continue;
            }
            started = true;
            hours.push(hour);
            counts.push(count);
        }
        Ok((hours, counts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fake::FakeStore;

    #[tokio::test]
    async fn hourly_series_skips_leading_zeros_only() {
        let store = FakeStore::new();
        let stats = AnomalyStats::new(3600 * 24 * 7);
        stats.record_request(&store, "2024010100", 200, "/r", 0).await.unwrap();
        stats.record_request(&store, "2024010101", 200, "/r", 0).await.unwrap();
        stats.record_request(&store, "2024010102", 200, "/r", 5).await.unwrap();
        stats.record_request(&store, "2024010103", 200, "/r", 0).await.unwrap();

        let (hours, counts) = stats.hourly_series(&store, "/r", 200).await.unwrap();
        assert_eq!(hours, vec!["2024010102", "2024010103"]);
        assert_eq!(counts, vec![5, 0]);
    }

    #[tokio::test]
    async fn response_count_defaults_to_zero() {
        let store = FakeStore::new();
        let stats = AnomalyStats::new(3600);
        let count = stats.response_count(&store, "/missing", 200, "2024010100").await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn backfill_writes_zero_for_missing_pairs_only() {
        let store = FakeStore::new();
        let stats = AnomalyStats::new(3600);
        stats.record_request(&store, "2024010100", 200, "/a", 9).await.unwrap();
        stats.record_request(&store, "2024010100", 200, "/b", 3).await.unwrap();

        let mut observed = HashSet::new();
        observed.insert(("/a".to_string(), "200".to_string()));
        stats.backfill_missing(&store, "2024010101", &observed).await.unwrap();

        let a = stats.response_count(&store, "/a", 200, "2024010101").await.unwrap();
        let b = stats.response_count(&store, "/b", 200, "2024010101").await.unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 0);
    }
}
