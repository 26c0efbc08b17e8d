use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::Json;

use crate::error::MonitorError;
use crate::models::error_def::{ErrorDefinition, StackFrame};
use crate::models::monitor::{
    ByHourAndVersion, ErrorSummary, ErrorSummaryDef, RecentErrorsResponse, RouteSummary, StackSummary,
};
use crate::store::{keys, Store};
use crate::AppState;

pub(crate) async fn load_error_def(store: &dyn Store, key: &str) -> Result<Option<ErrorDefinition>, MonitorError> {
    let Some(raw) = store.get(&keys::error_def(key)).await? else {
        return Ok(None);
    };
    Ok(serde_json::from_str(&raw).ok())
}

pub(crate) async fn build_error_summary(
    store: &dyn Store,
    key: &str,
    include_routes: bool,
) -> Result<Option<ErrorSummary>, MonitorError> {
    let Some(def) = load_error_def(store, key).await? else {
        return Ok(None);
    };

    let versions_raw = store.zrange_by_score(&keys::error_versions(key), f64::MIN, f64::MAX).await?;
    let versions: HashMap<String, i64> = versions_raw.iter().map(|(v, c)| (v.clone(), *c as i64)).collect();
    let count: i64 = versions.values().sum();

    let first_seen_entries = store.zrange_by_score(&keys::first_seen(key), f64::MIN, f64::MAX).await?;
    let first_seen = first_seen_entries.into_iter().next().map(|(hour, _)| hour);
    let last_seen = store.get(&keys::last_seen(key)).await?;

    let mut by_hour_and_version = Vec::new();
    for version in versions.keys() {
        let hours_seen = store.hash_get_all(&keys::hours_seen(version, key)).await?;
        for (hour, count_str) in hours_seen {
            let count = count_str.parse().unwrap_or(0);
            by_hour_and_version.push(ByHourAndVersion { hour, version: version.clone(), count });
        }
    }
    by_hour_and_version.sort_by(|a, b| a.hour.cmp(&b.hour).then_with(|| a.version.cmp(&b.version)));

    let routes = if include_routes {
        Some(aggregate_routes(store, &versions, key).await?)
    } else {
        None
    };

    Ok(Some(ErrorSummary {
        error_def: ErrorSummaryDef {
            key: def.key.clone(),
            title: def.title.clone(),
            status: def.status.clone(),
            level: def.level.clone(),
            id0: def.id0.clone(),
            id1: def.id1.clone(),
            id2: def.id2.clone(),
            id3: def.id3.clone(),
            level_readable: def.level_readable().to_string(),
        },
        versions,
        first_seen,
        last_seen,
        by_hour_and_version,
        count,
        routes,
    }))
}

async fn aggregate_routes(
    store: &dyn Store,
    versions: &HashMap<String, i64>,
    key: &str,
) -> Result<Vec<RouteSummary>, MonitorError> {
    let mut by_route: HashMap<String, RouteSummary> = HashMap::new();

    for version in versions.keys() {
        let prefix = keys::ver_error_prefix(version, key);
        let routes = store.zrange_by_score(&format!("{prefix}:routes"), f64::MIN, f64::MAX).await?;
        for (route, hits) in routes {
            let entry = by_route.entry(route.clone()).or_insert_with(|| RouteSummary {
                route: route.clone(),
                count: 0,
                urls: Vec::new(),
                stacks: Vec::new(),
            });
            entry.count += hits as i64;

            let uris = store.zrange_by_score(&format!("{prefix}:uris:{route}"), f64::MIN, f64::MAX).await?;
            for (uri, count) in uris {
                entry.urls.push((uri, count as i64));
            }

            let stack_counts = store.zrange_by_score(&format!("{prefix}:stacks:{route}:counts"), f64::MIN, f64::MAX).await?;
            let stack_msgs = store.hash_get_all(&format!("{prefix}:stacks:msgs")).await?;
            for (stack_key, count) in stack_counts {
                let Some(raw) = stack_msgs.get(&stack_key) else { continue };
                let frames: Vec<StackFrame> = serde_json::from_str::<crate::models::error_def::StackTrace>(raw)
                    .map(|s| s.0)
                    .unwrap_or_default();
                entry.stacks.push(StackSummary { count: count as i64, stack: frames });
            }
        }
    }

    Ok(by_route.into_values().collect())
}

pub async fn get_error(State(state): State<AppState>, Path(key): Path<String>) -> Result<Json<ErrorSummary>, MonitorError> {
    match build_error_summary(&*state.store, &key, true).await? {
        Some(summary) => Ok(Json(summary)),
        None => Err(MonitorError::NotFound(format!("no error with key {key}"))),
    }
}

pub async fn get_recent_errors(State(state): State<AppState>) -> Result<Json<RecentErrorsResponse>, MonitorError> {
    let mut keys_seen = std::collections::HashSet::new();
    let mut summaries = Vec::new();
    for raw_key in state.store.scan("error:*").await? {
        let Some(key) = raw_key.strip_prefix("error:") else { continue };
        if !keys_seen.insert(key.to_string()) {
            continue;
        }
        if let Some(summary) = build_error_summary(&*state.store, key, false).await? {
            summaries.push(summary);
        }
    }
    summaries.sort_by(|a, b| b.count.cmp(&a.count));
    Ok(Json(RecentErrorsResponse { errors: summaries }))
}

pub async fn get_version_errors(
    State(state): State<AppState>,
    Path(version): Path<String>,
) -> Result<Json<RecentErrorsResponse>, MonitorError> {
    let members = state.store.zrange_by_score(&keys::ver_errors(&version), f64::MIN, f64::MAX).await?;
    let mut summaries = Vec::new();
    for (key, _) in members {
        if let Some(summary) = build_error_summary(&*state.store, &key, false).await? {
            summaries.push(summary);
        }
    }
    summaries.sort_by(|a, b| b.count.cmp(&a.count));
    Ok(Json(RecentErrorsResponse { errors: summaries }))
}
