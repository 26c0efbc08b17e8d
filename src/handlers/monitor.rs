use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use crate::baseline_analyzer;
use crate::config::BlacklistEntry;
use crate::error::MonitorError;
use crate::handlers::errors::load_error_def;
use crate::models::monitor::{MonitorErrorEntry, MonitorErrorsResponse, MonitorRequest};
use crate::store::{keys, Store};
use crate::AppState;

pub async fn post_monitor(State(state): State<AppState>, Json(body): Json<MonitorRequest>) -> Result<&'static str, MonitorError> {
    if body.version.trim().is_empty() {
        return Err(MonitorError::BadRequest("version is required".to_string()));
    }

    for log in &body.logs {
        if let Err(err) = state
            .recorder
            .record_during_monitoring(
                &*state.store,
                &body.version,
                body.minute,
                log.status,
                log.level,
                &log.resource,
                &log.ip,
                &log.route,
                &log.module_id,
                &log.message,
            )
            .await
        {
            tracing::warn!(error = %err, route = %log.route, "failed to record monitoring occurrence, skipping");
        }
    }

    state.recorder.mark_minute_seen(&*state.store, &body.version, body.minute).await?;
    Ok("OK")
}

#[derive(Debug, Deserialize)]
pub struct VerifyVersionsQuery {
    verify_versions: Option<String>,
}

pub async fn get_monitor_results(
    State(state): State<AppState>,
    Path((version, minute)): Path<(String, i64)>,
    Query(query): Query<VerifyVersionsQuery>,
) -> Result<Json<MonitorErrorsResponse>, MonitorError> {
    let verify_versions: Vec<String> = query
        .verify_versions
        .as_deref()
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect();

    if verify_versions.is_empty() {
        return Err(MonitorError::BadRequest("verify_versions must not be empty".to_string()));
    }

    let mon_version = format!("MON_{version}");
    let candidates = state
        .store
        .zrange_by_score(&keys::ver_errors_by_minute(&mon_version, minute), f64::MIN, f64::MAX)
        .await?;

    let mut entries = Vec::new();
    for (error_key, monitor_count_score) in candidates {
        let monitor_count = monitor_count_score as i64;

        let (historical, never_seen_under_reference) =
            reference_history(&*state.store, &verify_versions, minute, &error_key).await?;
        let (expected, probability) = baseline_analyzer::analyze(&historical, monitor_count);

        if !baseline_analyzer::is_significant(probability, monitor_count, never_seen_under_reference) {
            continue;
        }

        let Some(def) = load_error_def(&*state.store, &error_key).await? else {
            continue;
        };

        if matches_blacklist(&def.title, monitor_count, &state.config.monitor.blacklisted_titles) {
            continue;
        }

        entries.push(MonitorErrorEntry {
            key: error_key,
            status: def.status,
            level: def.level_readable().to_string(),
            message: def.title,
            minute,
            monitor_count,
            expected_count: expected,
            probability,
        });
    }

    Ok(Json(MonitorErrorsResponse { errors: entries }))
}

/// Known-noisy errors are suppressed from the results unless they spike
/// past their configured per-minute threshold, so chronic, already-triaged
/// errors don't retrigger a deploy alert every time they recur at their
/// usual rate.
fn matches_blacklist(title: &str, monitor_count: i64, entries: &[BlacklistEntry]) -> bool {
    entries
        .iter()
        .any(|entry| title.contains(&entry.contains) && monitor_count <= entry.threshold as i64)
}

/// Gathers this error's count at `minute`, in the same window as the
/// candidate, under each reference version (both the raw and
/// `MON_`-prefixed namespace), skipping reference versions that have never
/// received any monitoring data. A reference version/namespace that never
/// saw this particular error at `minute` still contributes a `0` — the
/// error's absence there is itself baseline signal, not a missing sample.
/// Also reports whether the error was ever seen (in either namespace)
/// under any of the reference versions at all.
async fn reference_history(
    store: &dyn Store,
    verify_versions: &[String],
    minute: i64,
    error_key: &str,
) -> Result<(Vec<i64>, bool), MonitorError> {
    let mut historical = Vec::new();
    let mut never_seen_under_reference = true;

    for ref_version in verify_versions {
        let mon_ref = format!("MON_{ref_version}");
        let plain_seen = !store.hash_get_all(&keys::ver_seen(ref_version)).await?.is_empty();
        let mon_seen = !store.hash_get_all(&keys::ver_seen(&mon_ref)).await?.is_empty();

        if !plain_seen && !mon_seen {
            tracing::warn!(version = %ref_version, "reference version has no recorded monitoring data, skipping");
            continue;
        }

        for namespace in [ref_version.as_str(), mon_ref.as_str()] {
            historical.push(minute_count(store, namespace, minute, error_key).await?);
            if store.zscore(&keys::error_versions(error_key), namespace).await?.is_some() {
                never_seen_under_reference = false;
            }
        }
    }

    Ok((historical, never_seen_under_reference))
}

/// This error's count under `version_namespace` at `minute`, the same
/// window the candidate count was read from, defaulting to `0` when the
/// error didn't occur there at all.
async fn minute_count(store: &dyn Store, version_namespace: &str, minute: i64, error_key: &str) -> Result<i64, MonitorError> {
    let key = keys::ver_errors_by_minute(version_namespace, minute);
    Ok(store.zscore(&key, error_key).await?.map(|score| score as i64).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fake::FakeStore;

    fn entries() -> Vec<BlacklistEntry> {
        vec![BlacklistEntry { contains: "ConnectionResetError".to_string(), threshold: 50 }]
    }

    #[test]
    fn blacklisted_error_under_threshold_is_suppressed() {
        assert!(matches_blacklist("ConnectionResetError: [Errno 104]", 10, &entries()));
    }

    #[test]
    fn blacklisted_error_over_threshold_still_reports() {
        assert!(!matches_blacklist("ConnectionResetError: [Errno 104]", 500, &entries()));
    }

    #[test]
    fn non_matching_title_is_never_suppressed() {
        assert!(!matches_blacklist("KeyError: 'user_id'", 1, &entries()));
    }

    #[tokio::test]
    async fn reference_history_only_reads_the_requested_minute() {
        let store = FakeStore::new();
        store.hash_set(&keys::ver_seen("v000"), "42", "1").await.unwrap();
        // v000 saw this error at an earlier minute, but not at minute 42 —
        // that earlier count must not leak into the same-window comparison.
        store.zadd(&keys::ver_errors_by_minute("v000", 41), "err1", 9.0).await.unwrap();

        let (historical, _) = reference_history(&store, &["v000".to_string()], 42, "err1").await.unwrap();
        assert!(historical.iter().all(|&c| c == 0), "{historical:?}");
    }

    #[tokio::test]
    async fn reference_version_with_no_occurrence_contributes_a_zero() {
        // Scenario: v000 is a clean reference (0 occurrences of this error),
        // v001 saw it 6 times at the candidate minute. The zero from v000
        // must still land in `historical` so the baseline isn't empty.
        let store = FakeStore::new();
        store.hash_set(&keys::ver_seen("v000"), "5", "1").await.unwrap();
        store.hash_set(&keys::ver_seen("v001"), "5", "1").await.unwrap();
        store.zadd(&keys::ver_errors_by_minute("v001", 5), "err1", 6.0).await.unwrap();

        let (historical, never_seen_under_reference) =
            reference_history(&store, &["v000".to_string(), "v001".to_string()], 5, "err1").await.unwrap();
        assert!(historical.iter().any(|&c| c == 6), "{historical:?}");
        assert!(historical.iter().filter(|&&c| c == 0).count() >= 3, "{historical:?}");

        let (expected, probability) = baseline_analyzer::analyze(&historical, 6);
        assert!(baseline_analyzer::is_significant(probability, 6, never_seen_under_reference), "expected={expected} p={probability}");
    }
}
