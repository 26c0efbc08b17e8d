use axum::extract::{Path, State};
use axum::Json;

use crate::anomaly_stats::AnomalyStats;
use crate::error::MonitorError;
use crate::models::monitor::{AnomaliesResponse, AnomalyEntry};
use crate::seasonal_anomaly;
use crate::store::{keys, Store};
use crate::AppState;

const OK_STATUS: i32 = 200;

/// Fans out per-route anomaly detection across tokio tasks, one per route
/// with recorded 200-response history, and gathers whichever ones report a
/// drop at `log_hour`.
pub async fn get_anomalies(State(state): State<AppState>, Path(log_hour): Path<String>) -> Result<Json<AnomaliesResponse>, MonitorError> {
    let routes = state.store.set_members(keys::SEEN_ROUTES).await?;

    let mut handles = Vec::with_capacity(routes.len());
    for route in routes {
        let store = state.store.clone();
        let stats = state.stats.clone();
        let log_hour = log_hour.clone();
        handles.push(tokio::spawn(async move { detect_route_anomaly(&*store, &stats, &route, &log_hour).await }));
    }

    let mut anomalies = Vec::new();
    for handle in futures_util::future::join_all(handles).await {
        match handle {
            Ok(Ok(Some(entry))) => anomalies.push(entry),
            Ok(Ok(None)) => {}
            Ok(Err(err)) => tracing::warn!(error = %err, "anomaly detection failed for a route, skipping"),
            Err(join_err) => tracing::error!(error = %join_err, "anomaly detection task panicked"),
        }
    }

    Ok(Json(AnomaliesResponse { anomalies }))
}

async fn detect_route_anomaly(
    store: &dyn Store,
    stats: &AnomalyStats,
    route: &str,
    log_hour: &str,
) -> Result<Option<AnomalyEntry>, MonitorError> {
    let (hours, counts) = stats.hourly_series(store, route, OK_STATUS).await?;
    let Some(index) = hours.iter().position(|h| h == log_hour) else {
        return Ok(None);
    };

    // Only residuals strictly before the inspected hour feed the decomposition.
    let truncated = &counts[..=index];
    let scores = seasonal_anomaly::detect_weekly(truncated);
    let score = *scores.last().unwrap_or(&0.0);

    if score < -10.0 {
        Ok(Some(AnomalyEntry {
            route: route.to_string(),
            status: OK_STATUS,
            count: counts[index],
            anomaly_score: score,
        }))
    } else {
        Ok(None)
    }
}
