use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use wide_error_monitor::anomaly_stats::AnomalyStats;
use wide_error_monitor::config::WideConfig;
use wide_error_monitor::occurrence_recorder::OccurrenceRecorder;
use wide_error_monitor::store::RedisStore;
use wide_error_monitor::{handlers, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wide_monitor_server=debug,tower_http=debug")))
        .init();

    let config = WideConfig::load("wide.toml")?;

    let store = RedisStore::connect(&config.store.url).await?;
    tracing::info!(url = %config.store.url, "connected to store");

    let recorder = OccurrenceRecorder::new(config.ingestor.uri_blacklist.clone(), config.store.key_expiry_secs);
    let stats = AnomalyStats::new(config.store.key_expiry_secs);

    let state = AppState {
        store: Arc::new(store),
        recorder: Arc::new(recorder),
        stats: Arc::new(stats),
        config: Arc::new(config),
    };

    let app = Router::new()
        .route("/monitor", axum::routing::post(handlers::monitor::post_monitor))
        .route("/errors/{version}/monitor/{minute}", get(handlers::monitor::get_monitor_results))
        .route("/error/{error_key}", get(handlers::errors::get_error))
        .route("/recent_errors", get(handlers::errors::get_recent_errors))
        .route("/version_errors/{version}", get(handlers::errors::get_version_errors))
        .route("/anomalies/{log_hour}", get(handlers::anomalies::get_anomalies))
        .route("/healthz", get(handlers::health::healthz))
        .route("/ping", get(handlers::health::ping))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], 8080));
    tracing::info!("wide-monitor-server listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
