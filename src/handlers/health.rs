use axum::extract::State;
use serde_json::{json, Value};
use axum::Json;

use crate::error::MonitorError;
use crate::AppState;

pub async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// `GET /ping` — `pong` on a reachable Store, 500 via `MonitorError::StoreUnavailable` otherwise.
pub async fn ping(State(state): State<AppState>) -> Result<&'static str, MonitorError> {
    state.store.ping().await?;
    Ok("pong")
}
