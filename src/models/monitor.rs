use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Body of `POST /monitor`.
#[derive(Debug, Deserialize)]
pub struct MonitorRequest {
    pub version: String,
    pub minute: i64,
    pub logs: Vec<LogEntry>,
}

#[derive(Debug, Deserialize)]
pub struct LogEntry {
    pub status: i32,
    pub level: i32,
    pub resource: String,
    pub ip: String,
    pub route: String,
    pub module_id: String,
    pub message: String,
}

/// One row of a warehouse errors query, fed into `OccurrenceRecorder::record_from_errors`.
#[derive(Debug, Deserialize, Clone, clickhouse::Row)]
pub struct WarehouseErrorRow {
    pub version: String,
    pub status: i32,
    pub level: i32,
    pub resource: String,
    pub ip: String,
    pub route: String,
    pub module_id: String,
    pub message: String,
}

/// One row of a warehouse requests query, fed into `AnomalyStats::record_request`.
#[derive(Debug, Deserialize, Clone, clickhouse::Row)]
pub struct WarehouseRequestRow {
    pub route: String,
    pub status: i32,
    pub num_seen: i64,
}

#[derive(Debug, Serialize)]
pub struct MonitorErrorsResponse {
    pub errors: Vec<MonitorErrorEntry>,
}

/// One entry of `GET /errors/{version}/monitor/{minute}`.
#[derive(Debug, Serialize)]
pub struct MonitorErrorEntry {
    pub key: String,
    pub status: String,
    pub level: String,
    pub message: String,
    pub minute: i64,
    pub monitor_count: i64,
    pub expected_count: f64,
    pub probability: f64,
}

#[derive(Debug, Serialize)]
pub struct ErrorSummaryDef {
    pub key: String,
    pub title: String,
    pub status: String,
    pub level: String,
    pub id0: String,
    pub id1: Option<String>,
    pub id2: Option<String>,
    pub id3: Option<String>,
    pub level_readable: String,
}

#[derive(Debug, Serialize)]
pub struct ByHourAndVersion {
    pub hour: String,
    pub version: String,
    pub count: i64,
}

#[derive(Debug, Serialize, Default)]
pub struct RouteSummary {
    pub route: String,
    pub count: i64,
    pub urls: Vec<(String, i64)>,
    pub stacks: Vec<StackSummary>,
}

#[derive(Debug, Serialize)]
pub struct StackSummary {
    pub count: i64,
    pub stack: Vec<crate::models::error_def::StackFrame>,
}

/// Full shape returned by `/error/{key}`, `/recent_errors`, `/version_errors/{version}`.
/// `routes` is populated only on the single-error endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorSummary {
    pub error_def: ErrorSummaryDef,
    pub versions: HashMap<String, i64>,
    pub first_seen: Option<String>,
    pub last_seen: Option<String>,
    pub by_hour_and_version: Vec<ByHourAndVersion>,
    pub count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routes: Option<Vec<RouteSummary>>,
}

#[derive(Debug, Serialize)]
pub struct RecentErrorsResponse {
    pub errors: Vec<ErrorSummary>,
}

#[derive(Debug, Serialize)]
pub struct AnomaliesResponse {
    pub anomalies: Vec<AnomalyEntry>,
}

#[derive(Debug, Serialize)]
pub struct AnomalyEntry {
    pub route: String,
    pub status: i32,
    pub count: i64,
    pub anomaly_score: f64,
}
