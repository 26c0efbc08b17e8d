//! Hourly puller from the warehouse that drives `OccurrenceRecorder` and
//! `AnomalyStats`. Runs as its own binary (`src/bin/ingest.rs`); skips
//! hours already marked received and hours the warehouse hasn't finished
//! writing yet.

use std::collections::HashSet;
use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;

use crate::anomaly_stats::AnomalyStats;
use crate::config::IngestorConfig;
use crate::models::monitor::{WarehouseErrorRow, WarehouseRequestRow};
use crate::occurrence_recorder::OccurrenceRecorder;
use crate::store::{keys, Store};

#[derive(Debug, Error, Clone)]
pub enum WarehouseError {
    #[error("warehouse table not yet present")]
    TableAbsent,
    #[error("transient warehouse error: {0}")]
    Transient(String),
    #[error("fatal warehouse error: {0}")]
    Fatal(String),
    #[error("warehouse credentials invalid: {0}")]
    CredentialsInvalid(String),
}

impl WarehouseError {
    /// Classifies a raw warehouse client error message the way the retry
    /// loop needs it: 5xx / "try again" / "rate limit" wording is
    /// retryable, "not found" ends the day, everything else is fatal.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("notfound") || lower.contains("not found") {
            WarehouseError::TableAbsent
        } else if lower.contains("try again")
            || lower.contains("rate limit")
            || lower.contains("500")
            || lower.contains("502")
            || lower.contains("503")
            || lower.contains("504")
        {
            WarehouseError::Transient(message.to_string())
        } else {
            WarehouseError::Fatal(message.to_string())
        }
    }
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn log_hour_complete(&self, log_hour: &str) -> Result<bool, WarehouseError>;
    async fn query_requests(&self, log_hour: &str) -> Result<Vec<WarehouseRequestRow>, WarehouseError>;
    async fn query_errors(&self, log_hour: &str) -> Result<Vec<WarehouseErrorRow>, WarehouseError>;
}

/// `Warehouse` backed by the ClickHouse tables the rest of the crate
/// already treats as the event warehouse.
pub struct ClickHouseWarehouse {
    client: clickhouse::Client,
}

impl ClickHouseWarehouse {
    pub fn new(client: clickhouse::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Warehouse for ClickHouseWarehouse {
    async fn log_hour_complete(&self, log_hour: &str) -> Result<bool, WarehouseError> {
        let count: u64 = self
            .client
            .query("SELECT count() FROM wide_log_hours WHERE log_hour = ? AND complete = 1")
            .bind(log_hour)
            .fetch_one()
            .await
            .map_err(|e| WarehouseError::classify(&e.to_string()))?;
        Ok(count > 0)
    }

    async fn query_requests(&self, log_hour: &str) -> Result<Vec<WarehouseRequestRow>, WarehouseError> {
        self.client
            .query("SELECT route, status, count() AS num_seen FROM wide_events WHERE log_hour = ? GROUP BY route, status")
            .bind(log_hour)
            .fetch_all::<WarehouseRequestRow>()
            .await
            .map_err(|e| WarehouseError::classify(&e.to_string()))
    }

    async fn query_errors(&self, log_hour: &str) -> Result<Vec<WarehouseErrorRow>, WarehouseError> {
        self.client
            .query(
                "SELECT version, status, level, resource, ip, route, module_id, message \
                 FROM wide_events WHERE log_hour = ? AND level >= 3",
            )
            .bind(log_hour)
            .fetch_all::<WarehouseErrorRow>()
            .await
            .map_err(|e| WarehouseError::classify(&e.to_string()))
    }
}

async fn with_retry<T, F, Fut>(mut attempt_fn: F, attempts: u32, pause: Duration) -> Result<T, WarehouseError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, WarehouseError>>,
{
    let attempts = attempts.max(1);
    let mut last_err = None;
    for attempt in 0..attempts {
        match attempt_fn().await {
            Ok(value) => return Ok(value),
            Err(WarehouseError::Transient(msg)) => {
                tracing::warn!(attempt, %msg, "transient warehouse error, retrying");
                last_err = Some(WarehouseError::Transient(msg));
                if attempt + 1 < attempts {
                    tokio::time::sleep(pause).await;
                }
            }
            Err(other) => return Err(other),
        }
    }
    Err(last_err.unwrap_or_else(|| WarehouseError::Fatal("retry budget exhausted".to_string())))
}

fn version_regex(legacy: bool) -> &'static Regex {
    static CURRENT: OnceLock<Regex> = OnceLock::new();
    static LEGACY: OnceLock<Regex> = OnceLock::new();
    if legacy {
        LEGACY.get_or_init(|| Regex::new(r"^\d{4}-\d{4}-[0-9a-f]{12}$").unwrap())
    } else {
        CURRENT.get_or_init(|| Regex::new(r"^\d{6}-\d{4}-[0-9a-f]{12}$").unwrap())
    }
}

pub struct Ingestor<W: Warehouse> {
    warehouse: W,
    recorder: OccurrenceRecorder,
    stats: AnomalyStats,
    config: IngestorConfig,
}

impl<W: Warehouse> Ingestor<W> {
    pub fn new(warehouse: W, recorder: OccurrenceRecorder, stats: AnomalyStats, config: IngestorConfig) -> Self {
        Self { warehouse, recorder, stats, config }
    }

    pub async fn ingest_hour(&self, store: &dyn Store, log_hour: &str) -> Result<(), WarehouseError> {
        if self.already_received(store, log_hour).await {
            tracing::info!(log_hour, "hour already received, skipping");
            return Ok(());
        }

        if !self.complete_with_retry(log_hour).await? {
            tracing::info!(log_hour, "log hour not complete yet, will retry next run");
            return Ok(());
        }

        let pause = Duration::from_secs(self.config.retry_pause_secs);
        let attempts = self.config.retry_attempts;

        let requests = with_retry(|| self.warehouse.query_requests(log_hour), attempts, pause).await?;
        let mut observed = HashSet::new();
        for row in &requests {
            self.stats
                .record_request(store, log_hour, row.status, &row.route, row.num_seen)
                .await
                .map_err(|e| WarehouseError::Fatal(e.to_string()))?;
            observed.insert((row.route.clone(), row.status.to_string()));
        }
        self.stats
            .backfill_missing(store, log_hour, &observed)
            .await
            .map_err(|e| WarehouseError::Fatal(e.to_string()))?;

        let errors = with_retry(|| self.warehouse.query_errors(log_hour), attempts, pause).await?;
        let re = version_regex(self.config.legacy_version_format);
        for row in errors {
            if !re.is_match(&row.version) {
                tracing::warn!(version = %row.version, "skipping error row with unrecognized version format");
                continue;
            }
            if let Err(err) = self
                .recorder
                .record_from_errors(
                    store,
                    &row.version,
                    log_hour,
                    row.status,
                    row.level,
                    &row.resource,
                    &row.ip,
                    &row.route,
                    &row.module_id,
                    &row.message,
                )
                .await
            {
                tracing::warn!(error = %err, "skipping malformed error row");
            }
        }

        self.mark_received(store, log_hour).await;
        Ok(())
    }

    async fn complete_with_retry(&self, log_hour: &str) -> Result<bool, WarehouseError> {
        let pause = Duration::from_secs(self.config.retry_pause_secs);
        match with_retry(|| self.warehouse.log_hour_complete(log_hour), self.config.retry_attempts, pause).await {
            Ok(complete) => Ok(complete),
            Err(WarehouseError::TableAbsent) => Ok(false),
            Err(other) => Err(other),
        }
    }

    async fn already_received(&self, store: &dyn Store, log_hour: &str) -> bool {
        matches!(store.get(&keys::log_hour_received(log_hour)).await, Ok(Some(_)))
    }

    async fn mark_received(&self, store: &dyn Store, log_hour: &str) {
        if let Err(err) = store.set_with_ttl(&keys::log_hour_received(log_hour), "1", 3600 * 24 * 30).await {
            tracing::error!(error = %err, log_hour, "failed to mark log hour received");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fake::FakeStore;
    use std::sync::Mutex;

    struct FakeWarehouse {
        requests: Vec<WarehouseRequestRow>,
        errors: Vec<WarehouseErrorRow>,
        complete: bool,
        transient_then_ok: Mutex<u32>,
    }

    #[async_trait]
    impl Warehouse for FakeWarehouse {
        async fn log_hour_complete(&self, _log_hour: &str) -> Result<bool, WarehouseError> {
            Ok(self.complete)
        }

        async fn query_requests(&self, _log_hour: &str) -> Result<Vec<WarehouseRequestRow>, WarehouseError> {
            let mut remaining = self.transient_then_ok.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(WarehouseError::Transient("try again".to_string()));
            }
            Ok(self.requests.clone())
        }

        async fn query_errors(&self, _log_hour: &str) -> Result<Vec<WarehouseErrorRow>, WarehouseError> {
            Ok(self.errors.clone())
        }
    }

    fn default_config() -> IngestorConfig {
        IngestorConfig {
            uri_blacklist: vec![],
            legacy_version_format: false,
            retry_attempts: 3,
            retry_pause_secs: 0,
        }
    }

    #[tokio::test]
    async fn ingests_requests_and_errors_for_a_complete_hour() {
        let store = FakeStore::new();
        let warehouse = FakeWarehouse {
            requests: vec![WarehouseRequestRow { route: "/r".to_string(), status: 200, num_seen: 10 }],
            errors: vec![WarehouseErrorRow {
                version: "000000-0000-0123456789ab".to_string(),
                status: 500,
                level: 3,
                resource: "/r".to_string(),
                ip: "1.2.3.4".to_string(),
                route: "/r".to_string(),
                module_id: "m".to_string(),
                message: "boom".to_string(),
            }],
            complete: true,
            transient_then_ok: Mutex::new(0),
        };
        let ingestor = Ingestor::new(
            warehouse,
            OccurrenceRecorder::new(vec![], 3600 * 24 * 7),
            AnomalyStats::new(3600 * 24 * 7),
            default_config(),
        );

        ingestor.ingest_hour(&store, "2024010100").await.unwrap();

        let count = store.get(&keys::route_status_hour("/r", "200", "2024010100")).await.unwrap();
        assert_eq!(count.as_deref(), Some("10"));
        let received = store.get(&keys::log_hour_received("2024010100")).await.unwrap();
        assert!(received.is_some());
    }

    #[tokio::test]
    async fn incomplete_hour_is_skipped_without_error() {
        let store = FakeStore::new();
        let warehouse = FakeWarehouse { requests: vec![], errors: vec![], complete: false, transient_then_ok: Mutex::new(0) };
        let ingestor = Ingestor::new(
            warehouse,
            OccurrenceRecorder::new(vec![], 3600),
            AnomalyStats::new(3600),
            default_config(),
        );
        ingestor.ingest_hour(&store, "2024010100").await.unwrap();
        assert!(store.get(&keys::log_hour_received("2024010100")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let store = FakeStore::new();
        let warehouse = FakeWarehouse {
            requests: vec![WarehouseRequestRow { route: "/r".to_string(), status: 200, num_seen: 1 }],
            errors: vec![],
            complete: true,
            transient_then_ok: Mutex::new(2),
        };
        let ingestor = Ingestor::new(
            warehouse,
            OccurrenceRecorder::new(vec![], 3600),
            AnomalyStats::new(3600),
            default_config(),
        );
        ingestor.ingest_hour(&store, "2024010100").await.unwrap();
        let count = store.get(&keys::route_status_hour("/r", "200", "2024010100")).await.unwrap();
        assert_eq!(count.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn unrecognized_version_format_is_skipped() {
        let store = FakeStore::new();
        let warehouse = FakeWarehouse {
            requests: vec![],
            errors: vec![WarehouseErrorRow {
                version: "not-a-version".to_string(),
                status: 500,
                level: 3,
                resource: "/r".to_string(),
                ip: "1.2.3.4".to_string(),
                route: "/r".to_string(),
                module_id: "m".to_string(),
                message: "boom".to_string(),
            }],
            complete: true,
            transient_then_ok: Mutex::new(0),
        };
        let ingestor = Ingestor::new(
            warehouse,
            OccurrenceRecorder::new(vec![], 3600),
            AnomalyStats::new(3600),
            default_config(),
        );
        ingestor.ingest_hour(&store, "2024010100").await.unwrap();
        assert!(store.scan("error:*").await.unwrap().is_empty());
    }
}
