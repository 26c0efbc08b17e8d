//! Records a parsed occurrence into the Store under the agreed key layout,
//! refreshing TTLs on every write. Two public entry points —
//! `record_during_monitoring` and `record_from_errors` — share the private
//! `update_error_details` step.

use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;

use crate::error::MonitorError;
use crate::error_grouper::ErrorGrouperCache;
use crate::error_parser::parse_message;
use crate::store::{keys, Store};

fn cache_bust_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"_=\d+").unwrap())
}

/// `regex` has no lookbehind, so `(?<=[?&])_=\d+` is reimplemented by
/// scanning matches of `_=\d+` and only dropping the ones immediately
/// preceded by `?` or `&`.
fn strip_cache_bust_params(resource: &str) -> String {
    let re = cache_bust_re();
    let mut out = String::with_capacity(resource.len());
    let mut cursor = 0;
    for m in re.find_iter(resource) {
        let preceded_by_delim = m
            .start()
            .checked_sub(1)
            .and_then(|i| resource.as_bytes().get(i))
            .map(|b| *b == b'?' || *b == b'&')
            .unwrap_or(false);
        if preceded_by_delim {
            out.push_str(&resource[cursor..m.start()]);
            cursor = m.end();
        }
    }
    out.push_str(&resource[cursor..]);
    out
}

/// Parses `"YYYYMMDD_HH"` into the integer score `YYYYMMDDHH` used to order
/// the `first_seen` sorted set.
fn log_hour_score(log_hour: &str) -> f64 {
    log_hour.replace('_', "").parse::<f64>().unwrap_or(0.0)
}

pub struct OccurrenceRecorder {
    grouper: ErrorGrouperCache,
    uri_blacklist: Vec<String>,
    ttl_secs: i64,
}

impl OccurrenceRecorder {
    pub fn new(uri_blacklist: Vec<String>, ttl_secs: i64) -> Self {
        Self {
            grouper: ErrorGrouperCache::new(),
            uri_blacklist,
            ttl_secs,
        }
    }

    pub fn grouper(&self) -> &ErrorGrouperCache {
        &self.grouper
    }

    #[allow(clippy::too_many_arguments)]
    async fn update_error_details(
        &self,
        store: &dyn Store,
        version: &str,
        status: i32,
        level: i32,
        resource: &str,
        ip: &str,
        route: &str,
        module: &str,
        message: &str,
    ) -> Result<Option<String>, MonitorError> {
        if self.uri_blacklist.iter().any(|prefix| resource.starts_with(prefix.as_str())) {
            return Ok(None);
        }

        let (def, stack, stack_key) = parse_message(message, &status.to_string(), &level.to_string());
        let error_key = self.grouper.lookup_or_create(store, self.ttl_secs, def).await?;
        let resource = strip_cache_bust_params(resource);

        let p = keys::ver_error_prefix(version, &error_key);
        let ttl = self.ttl_secs;

        let ips_key = format!("{p}:ips");
        store.zincr(&ips_key, ip, 1.0).await?;
        store.expire(&ips_key, ttl).await?;

        let stacks_msgs_key = format!("{p}:stacks:msgs");
        let stack_json = serde_json::to_string(&stack).map_err(|e| MonitorError::BadRequest(e.to_string()))?;
        store.hash_set(&stacks_msgs_key, &stack_key, &stack_json).await?;
        store.expire(&stacks_msgs_key, ttl).await?;

        let stacks_counts_key = format!("{p}:stacks:{route}:counts");
        store.zincr(&stacks_counts_key, &stack_key, 1.0).await?;
        store.expire(&stacks_counts_key, ttl).await?;

        let routes_key = format!("{p}:routes");
        store.zincr(&routes_key, route, 1.0).await?;
        store.expire(&routes_key, ttl).await?;

        let uris_key = format!("{p}:uris:{route}");
        store.zincr(&uris_key, &resource, 1.0).await?;
        store.expire(&uris_key, ttl).await?;

        let modules_key = format!("{p}:modules");
        store.zincr(&modules_key, module, 1.0).await?;
        store.expire(&modules_key, ttl).await?;

        let ver_errors_key = keys::ver_errors(version);
        store.zincr(&ver_errors_key, &error_key, 1.0).await?;
        store.expire(&ver_errors_key, ttl).await?;

        let error_versions_key = keys::error_versions(&error_key);
        store.zincr(&error_versions_key, version, 1.0).await?;
        store.expire(&error_versions_key, ttl).await?;

        Ok(Some(error_key))
    }

    /// Records one log line from a `/monitor` POST. `version` is the raw
    /// candidate version; internally isolated under a `MON_` prefix so
    /// monitoring traffic never mixes with warehouse-scraped counts.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_during_monitoring(
        &self,
        store: &dyn Store,
        version: &str,
        minute: i64,
        status: i32,
        level: i32,
        resource: &str,
        ip: &str,
        route: &str,
        module: &str,
        message: &str,
    ) -> Result<Option<String>, MonitorError> {
        let mon_version = format!("MON_{version}");
        let ttl = self.ttl_secs;

        let Some(error_key) = self
            .update_error_details(store, &mon_version, status, level, resource, ip, route, module, message)
            .await?
        else {
            return Ok(None);
        };

        let ebm_key = keys::ver_errors_by_minute(&mon_version, minute);
        store.zincr(&ebm_key, &error_key, 1.0).await?;
        store.expire(&ebm_key, ttl).await?;

        let per_ip_key = keys::ver_ip_minute_errors(&mon_version, ip, minute);
        let already_counted = store.zscore(&per_ip_key, &error_key).await?.is_some();
        store.zincr(&per_ip_key, &error_key, 1.0).await?;
        store.expire(&per_ip_key, 3600).await?;

        if !already_counted {
            let unique_key = keys::ver_unique_errors_by_minute(&mon_version, minute);
            store.zincr(&unique_key, &error_key, 1.0).await?;
            store.expire(&unique_key, ttl).await?;
        }

        Ok(Some(error_key))
    }

    /// Marks a monitoring minute as having received data, after a batch of
    /// log lines from the same `/monitor` POST has been recorded.
    pub async fn mark_minute_seen(&self, store: &dyn Store, version: &str, minute: i64) -> Result<(), MonitorError> {
        let mon_version = format!("MON_{version}");
        let seen_key = keys::ver_seen(&mon_version);
        store.hash_set(&seen_key, &minute.to_string(), "1").await?;
        store.expire(&seen_key, self.ttl_secs).await?;
        Ok(())
    }

    /// Records one row from a warehouse errors query. `version` is the raw
    /// version (no `MON_` prefix). Returns `(error_key, is_new)` where
    /// `is_new` is true iff this error key had no `first_seen` entries
    /// before this write.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_from_errors(
        &self,
        store: &dyn Store,
        version: &str,
        log_hour: &str,
        status: i32,
        level: i32,
        resource: &str,
        ip: &str,
        route: &str,
        module: &str,
        message: &str,
    ) -> Result<(Option<String>, bool), MonitorError> {
        let ttl = self.ttl_secs;

        let Some(error_key) = self
            .update_error_details(store, version, status, level, resource, ip, route, module, message)
            .await?
        else {
            return Ok((None, false));
        };

        let hours_seen_key = keys::hours_seen(version, &error_key);
        store.hash_incr(&hours_seen_key, log_hour, 1).await?;
        store.expire(&hours_seen_key, ttl).await?;

        let first_seen_key = keys::first_seen(&error_key);
        let before = store.zrange_by_score(&first_seen_key, f64::MIN, f64::MAX).await?;
        let is_new = before.is_empty();

        store.zadd(&first_seen_key, log_hour, log_hour_score(log_hour)).await?;
        let cutoff = log_hour_score(&cutoff_log_hour(ttl));
        store.zrem_range_by_score(&first_seen_key, f64::MIN, cutoff).await?;
        store.expire(&first_seen_key, ttl).await?;

        let last_seen_key = keys::last_seen(&error_key);
        let current_last = store.get(&last_seen_key).await?;
        if current_last.as_deref().map(|c| log_hour > c).unwrap_or(true) {
            store.set_with_ttl(&last_seen_key, log_hour, ttl).await?;
        } else {
            store.expire(&last_seen_key, ttl).await?;
        }

        Ok((Some(error_key), is_new))
    }
}

fn cutoff_log_hour(ttl_secs: i64) -> String {
    let cutoff = Utc::now() - chrono::Duration::seconds(ttl_secs);
    format!("{}_{}", cutoff.format("%Y%m%d"), cutoff.format("%H"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fake::FakeStore;

    #[test]
    fn cache_bust_only_stripped_after_delimiter() {
        assert_eq!(strip_cache_bust_params("/x?a=1&_=123"), "/x?a=1&");
        assert_eq!(strip_cache_bust_params("/x?_=999"), "/x?");
        assert_eq!(strip_cache_bust_params("/x?a=_=5"), "/x?a=_=5");
        assert_eq!(strip_cache_bust_params("/x?foo=_=5&bar=1"), "/x?foo=_=5&bar=1");
    }

    #[tokio::test]
    async fn blacklisted_uri_returns_none_and_writes_nothing() {
        let store = FakeStore::new();
        let recorder = OccurrenceRecorder::new(vec!["/api/internal/translate/lint_poentry".to_string()], 3600);
        let result = recorder
            .record_from_errors(
                &store,
                "v1",
                "20240101_00",
                500,
                3,
                "/api/internal/translate/lint_poentry?x=1",
                "1.2.3.4",
                "/route",
                "mod",
                "boom",
            )
            .await
            .unwrap();
        assert_eq!(result, (None, false));
        assert!(store.scan("ver:*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn repeated_occurrences_accumulate_one_key() {
        let store = FakeStore::new();
        let recorder = OccurrenceRecorder::new(vec![], 3600);
        for i in 0..3 {
            recorder
                .record_from_errors(
                    &store,
                    "v1",
                    "20240101_00",
                    500,
                    3,
                    "/route",
                    "1.2.3.4",
                    "/route",
                    "mod",
                    &format!("Error while parsing directive {i}"),
                )
                .await
                .unwrap();
        }
        let errors = store.zrange_by_score(&keys::ver_errors("v1"), f64::MIN, f64::MAX).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].1, 3.0);
    }

    #[tokio::test]
    async fn first_seen_and_last_seen_track_warehouse_ingest() {
        let store = FakeStore::new();
        let recorder = OccurrenceRecorder::new(vec![], 3600 * 24 * 30);
        let version = "000000-0000-0123456789ab";
        let mut key = None;
        for _ in 0..5 {
            let (k, _) = recorder
                .record_from_errors(&store, version, "20141110_04", 500, 3, "/r", "ip", "/r", "m", "same error")
                .await
                .unwrap();
            key = k;
        }
        for _ in 0..7 {
            recorder
                .record_from_errors(&store, version, "20141110_05", 500, 3, "/r", "ip", "/r", "m", "same error")
                .await
                .unwrap();
        }
        let key = key.unwrap();
        let first = store
            .zrange_by_score(&keys::first_seen(&key), f64::MIN, f64::MAX)
            .await
            .unwrap();
        assert_eq!(first[0].0, "20141110_04");
        let last = store.get(&keys::last_seen(&key)).await.unwrap();
        assert_eq!(last.as_deref(), Some("20141110_05"));
        let total = store.zscore(&keys::ver_errors(version), &key).await.unwrap();
        assert_eq!(total, Some(12.0));
    }
}
