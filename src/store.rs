//! Typed wrapper over a Redis-compatible key/value server.
//!
//! Exposes exactly the primitive set the rest of the crate needs: string
//! get/set with TTL, hash get/set/getall/incr, set add/members, sorted-set
//! add/incr/score/range-by-score/remove-by-score/range-rev-with-scores/rank,
//! key-pattern scan, TTL refresh, delete, and ping. Everything above this
//! layer (`ErrorGrouper`, `OccurrenceRecorder`, `AnomalyStats`, ...) talks to
//! the `Store` trait only, never to a concrete client, so a `FakeStore` can
//! stand in for tests without a live Redis instance.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::MonitorError;

#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, MonitorError>;
    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: i64) -> Result<(), MonitorError>;
    async fn del(&self, key: &str) -> Result<(), MonitorError>;
    async fn expire(&self, key: &str, ttl_secs: i64) -> Result<(), MonitorError>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, MonitorError>;
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), MonitorError>;
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, MonitorError>;
    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64, MonitorError>;

    async fn set_add(&self, key: &str, member: &str) -> Result<(), MonitorError>;
    async fn set_members(&self, key: &str) -> Result<Vec<String>, MonitorError>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), MonitorError>;
    async fn zincr(&self, key: &str, member: &str, delta: f64) -> Result<f64, MonitorError>;
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, MonitorError>;
    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>, MonitorError>;
    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<(), MonitorError>;
    async fn zrevrange_with_scores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>, MonitorError>;
    async fn zrank(&self, key: &str, member: &str) -> Result<Option<u64>, MonitorError>;

    /// May return duplicate keys; callers must dedup.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, MonitorError>;

    async fn ping(&self) -> Result<(), MonitorError>;
}

/// `Store` implementation backed by a real Redis-compatible server.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, MonitorError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: i64) -> Result<(), MonitorError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl_secs.max(1) as u64).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), MonitorError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl_secs: i64) -> Result<(), MonitorError> {
        let mut conn = self.conn.clone();
        let _: () = conn.expire(key, ttl_secs.max(1)).await?;
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, MonitorError> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(key, field).await?)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), MonitorError> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(key, field, value).await?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, MonitorError> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(key).await?)
    }

    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64, MonitorError> {
        let mut conn = self.conn.clone();
        Ok(conn.hincr(key, field, delta).await?)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), MonitorError> {
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(key, member).await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, MonitorError> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(key).await?)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), MonitorError> {
        let mut conn = self.conn.clone();
        let _: () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zincr(&self, key: &str, member: &str, delta: f64) -> Result<f64, MonitorError> {
        let mut conn = self.conn.clone();
        Ok(conn.zincr(key, member, delta).await?)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, MonitorError> {
        let mut conn = self.conn.clone();
        Ok(conn.zscore(key, member).await?)
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>, MonitorError> {
        let mut conn = self.conn.clone();
        Ok(conn.zrangebyscore_withscores(key, min, max).await?)
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<(), MonitorError> {
        let mut conn = self.conn.clone();
        let _: () = conn.zrembyscore(key, min, max).await?;
        Ok(())
    }

    async fn zrevrange_with_scores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>, MonitorError> {
        let mut conn = self.conn.clone();
        Ok(conn.zrevrange_withscores(key, start, stop).await?)
    }

    async fn zrank(&self, key: &str, member: &str) -> Result<Option<u64>, MonitorError> {
        let mut conn = self.conn.clone();
        Ok(conn.zrank(key, member).await?)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, MonitorError> {
        let mut conn = self.conn.clone();
        let mut iter: redis::AsyncIter<String> = conn.scan_match(pattern).await?;
        let mut out = Vec::new();
        use futures_util::StreamExt;
        while let Some(key) = iter.next().await {
            out.push(key);
        }
        Ok(out)
    }

    async fn ping(&self) -> Result<(), MonitorError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// All key names in the agreed layout (spec §6.2), kept in one place so the
/// scheme lives in exactly one file.
pub mod keys {
    pub fn error_def(key: &str) -> String {
        format!("error:{key}")
    }

    pub fn error_id_index(id_slot: &str) -> String {
        format!("errordef:{id_slot}")
    }

    pub fn ver_errors(version: &str) -> String {
        format!("ver:{version}:errors")
    }

    pub fn ver_error_prefix(version: &str, error_key: &str) -> String {
        format!("ver:{version}:error:{error_key}")
    }

    pub fn ver_errors_by_minute(version: &str, minute: i64) -> String {
        format!("ver:{version}:errors_by_minute:{minute}")
    }

    pub fn ver_unique_errors_by_minute(version: &str, minute: i64) -> String {
        format!("ver:{version}:unique_errors_by_minute:{minute}")
    }

    pub fn ver_seen(version: &str) -> String {
        format!("ver:{version}:seen")
    }

    pub fn ver_ip_minute_errors(version: &str, ip: &str, minute: i64) -> String {
        format!("ver:{version}:ip:{ip}:minute:{minute}:errors")
    }

    pub fn error_versions(error_key: &str) -> String {
        format!("{error_key}:versions")
    }

    pub fn first_seen(error_key: &str) -> String {
        format!("first_seen:{error_key}")
    }

    pub fn last_seen(error_key: &str) -> String {
        format!("last_seen:{error_key}")
    }

    pub const AVAILABLE_LOGS: &str = "available_logs";
    pub const SEEN_ROUTES: &str = "seen_routes";
    pub const SEEN_STATUSES: &str = "seen_statuses";

    pub fn route_status_hour(route: &str, status: &str, log_hour: &str) -> String {
        format!("route:{route}:status:{status}:log_hour:{log_hour}:num_seen")
    }

    pub fn hours_seen(version: &str, error_key: &str) -> String {
        format!("ver:{version}:error:{error_key}:hours_seen")
    }

    pub fn log_hour_received(log_hour: &str) -> String {
        format!("ingest:log_hour:{log_hour}:received")
    }
}

/// In-memory `Store` used by unit and scenario tests. TTLs are tracked but
/// never actively expire entries in the background; callers that want to
/// observe expiry call `FakeStore::expire_all_past` to force a sweep, the
/// same way a real Redis instance would lazily evict on access.
#[cfg(any(test, feature = "testing"))]
pub mod fake {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Inner {
        strings: HashMap<String, String>,
        hashes: HashMap<String, HashMap<String, String>>,
        sets: HashMap<String, std::collections::HashSet<String>>,
        zsets: HashMap<String, BTreeMap<String, f64>>,
        ttls: HashMap<String, i64>,
    }

    #[derive(Default)]
    pub struct FakeStore {
        inner: Mutex<Inner>,
    }

    impl FakeStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Remove every key whose TTL was set to a non-positive value by a
        /// prior `expire` call, simulating passage of time past expiry.
        pub fn expire_all_past(&self) {
            let mut inner = self.inner.lock().unwrap();
            let expired: Vec<String> = inner
                .ttls
                .iter()
                .filter(|(_, ttl)| **ttl <= 0)
                .map(|(k, _)| k.clone())
                .collect();
            for key in expired {
                inner.strings.remove(&key);
                inner.hashes.remove(&key);
                inner.sets.remove(&key);
                inner.zsets.remove(&key);
                inner.ttls.remove(&key);
            }
        }

        /// Force a key to look expired on the next `expire_all_past` sweep.
        pub fn force_expire(&self, key: &str) {
            let mut inner = self.inner.lock().unwrap();
            inner.ttls.insert(key.to_string(), 0);
        }
    }

    #[async_trait]
    impl Store for FakeStore {
        async fn get(&self, key: &str) -> Result<Option<String>, MonitorError> {
            Ok(self.inner.lock().unwrap().strings.get(key).cloned())
        }

        async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: i64) -> Result<(), MonitorError> {
            let mut inner = self.inner.lock().unwrap();
            inner.strings.insert(key.to_string(), value.to_string());
            inner.ttls.insert(key.to_string(), ttl_secs);
            Ok(())
        }

        async fn del(&self, key: &str) -> Result<(), MonitorError> {
            let mut inner = self.inner.lock().unwrap();
            inner.strings.remove(key);
            inner.hashes.remove(key);
            inner.sets.remove(key);
            inner.zsets.remove(key);
            inner.ttls.remove(key);
            Ok(())
        }

        async fn expire(&self, key: &str, ttl_secs: i64) -> Result<(), MonitorError> {
            self.inner.lock().unwrap().ttls.insert(key.to_string(), ttl_secs);
            Ok(())
        }

        async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, MonitorError> {
            Ok(self
                .inner
                .lock()
                .unwrap()
                .hashes
                .get(key)
                .and_then(|h| h.get(field).cloned()))
        }

        async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), MonitorError> {
            let mut inner = self.inner.lock().unwrap();
            inner
                .hashes
                .entry(key.to_string())
                .or_default()
                .insert(field.to_string(), value.to_string());
            Ok(())
        }

        async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, MonitorError> {
            Ok(self.inner.lock().unwrap().hashes.get(key).cloned().unwrap_or_default())
        }

        async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64, MonitorError> {
            let mut inner = self.inner.lock().unwrap();
            let hash = inner.hashes.entry(key.to_string()).or_default();
            let entry = hash.entry(field.to_string()).or_insert_with(|| "0".to_string());
            let current: i64 = entry.parse().unwrap_or(0);
            let updated = current + delta;
            *entry = updated.to_string();
            Ok(updated)
        }

        async fn set_add(&self, key: &str, member: &str) -> Result<(), MonitorError> {
            let mut inner = self.inner.lock().unwrap();
            inner.sets.entry(key.to_string()).or_default().insert(member.to_string());
            Ok(())
        }

        async fn set_members(&self, key: &str) -> Result<Vec<String>, MonitorError> {
            Ok(self
                .inner
                .lock()
                .unwrap()
                .sets
                .get(key)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default())
        }

        async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), MonitorError> {
            let mut inner = self.inner.lock().unwrap();
            inner.zsets.entry(key.to_string()).or_default().insert(member.to_string(), score);
            Ok(())
        }

        async fn zincr(&self, key: &str, member: &str, delta: f64) -> Result<f64, MonitorError> {
            let mut inner = self.inner.lock().unwrap();
            let zset = inner.zsets.entry(key.to_string()).or_default();
            let score = zset.entry(member.to_string()).or_insert(0.0);
            *score += delta;
            Ok(*score)
        }

        async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, MonitorError> {
            Ok(self
                .inner
                .lock()
                .unwrap()
                .zsets
                .get(key)
                .and_then(|z| z.get(member).copied()))
        }

        async fn zrange_by_score(
            &self,
            key: &str,
            min: f64,
            max: f64,
        ) -> Result<Vec<(String, f64)>, MonitorError> {
            let inner = self.inner.lock().unwrap();
            let mut entries: Vec<(String, f64)> = inner
                .zsets
                .get(key)
                .map(|z| {
                    z.iter()
                        .filter(|(_, score)| **score >= min && **score <= max)
                        .map(|(m, s)| (m.clone(), *s))
                        .collect()
                })
                .unwrap_or_default();
            entries.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            Ok(entries)
        }

        async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<(), MonitorError> {
            let mut inner = self.inner.lock().unwrap();
            if let Some(z) = inner.zsets.get_mut(key) {
                z.retain(|_, score| !(*score >= min && *score <= max));
            }
            Ok(())
        }

        async fn zrevrange_with_scores(
            &self,
            key: &str,
            start: isize,
            stop: isize,
        ) -> Result<Vec<(String, f64)>, MonitorError> {
            let inner = self.inner.lock().unwrap();
            let mut entries: Vec<(String, f64)> = inner
                .zsets
                .get(key)
                .map(|z| z.iter().map(|(m, s)| (m.clone(), *s)).collect())
                .unwrap_or_default();
            entries.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            let len = entries.len() as isize;
            let start = start.max(0);
            let stop = if stop < 0 { len + stop } else { stop }.min(len - 1);
            if start > stop || start >= len {
                return Ok(vec![]);
            }
            Ok(entries[start as usize..=(stop.max(0) as usize)].to_vec())
        }

        async fn zrank(&self, key: &str, member: &str) -> Result<Option<u64>, MonitorError> {
            let inner = self.inner.lock().unwrap();
            let Some(z) = inner.zsets.get(key) else { return Ok(None) };
            let mut sorted: Vec<(&String, &f64)> = z.iter().collect();
            sorted.sort_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal));
            Ok(sorted.iter().position(|(m, _)| m.as_str() == member).map(|p| p as u64))
        }

        async fn scan(&self, pattern: &str) -> Result<Vec<String>, MonitorError> {
            let inner = self.inner.lock().unwrap();
            let prefix = pattern.trim_end_matches('*');
            let mut out = Vec::new();
            for k in inner.strings.keys().chain(inner.hashes.keys()).chain(inner.zsets.keys()).chain(inner.sets.keys()) {
                if k.starts_with(prefix) {
                    out.push(k.clone());
                }
            }
            Ok(out)
        }

        async fn ping(&self) -> Result<(), MonitorError> {
            Ok(())
        }
    }
}
