pub mod anomaly_stats;
pub mod baseline_analyzer;
pub mod config;
pub mod error;
pub mod error_grouper;
pub mod error_parser;
pub mod handlers;
pub mod ingestor;
pub mod models;
pub mod occurrence_recorder;
pub mod reporter;
pub mod seasonal_anomaly;
pub mod store;

use std::sync::Arc;

use anomaly_stats::AnomalyStats;
use config::WideConfig;
use occurrence_recorder::OccurrenceRecorder;
use store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub recorder: Arc<OccurrenceRecorder>,
    pub stats: Arc<AnomalyStats>,
    pub config: Arc<WideConfig>,
}
