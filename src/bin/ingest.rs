use chrono::Utc;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use wide_error_monitor::anomaly_stats::AnomalyStats;
use wide_error_monitor::config::WideConfig;
use wide_error_monitor::ingestor::{ClickHouseWarehouse, Ingestor, WarehouseError};
use wide_error_monitor::occurrence_recorder::OccurrenceRecorder;
use wide_error_monitor::store::RedisStore;

/// Hourly puller from the warehouse; run once per scheduled invocation.
#[derive(Parser)]
#[command(name = "wide-ingest")]
struct Args {
    /// Date to ingest, `YYYYMMDD`. Defaults to today (UTC).
    #[arg(long)]
    date: Option<String>,

    /// Query the day-granularity fallback table instead of hourly ones.
    #[arg(long)]
    use_daily_tables: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wide_ingest=info")))
        .init();

    let args = Args::parse();

    let config = match WideConfig::load("wide.toml") {
        Ok(c) => c,
        Err(err) => {
            tracing::error!(error = %err, "failed to load config");
            std::process::exit(2);
        }
    };

    let date = args.date.unwrap_or_else(|| Utc::now().format("%Y%m%d").to_string());

    let store = match RedisStore::connect(&config.store.url).await {
        Ok(s) => s,
        Err(err) => {
            tracing::error!(error = %err, "failed to connect to store");
            std::process::exit(2);
        }
    };

    let clickhouse_url = std::env::var("CLICKHOUSE_URL").unwrap_or_else(|_| "http://localhost:8123".to_string());
    let clickhouse_db = std::env::var("CLICKHOUSE_DATABASE").unwrap_or_else(|_| "wide".to_string());

    let (user, password) = match (std::env::var("CLICKHOUSE_USER"), std::env::var("CLICKHOUSE_PASSWORD")) {
        (Ok(u), Ok(p)) => (u, p),
        _ => {
            tracing::error!("missing warehouse credentials (CLICKHOUSE_USER / CLICKHOUSE_PASSWORD)");
            std::process::exit(1);
        }
    };

    let client = clickhouse::Client::default()
        .with_url(&clickhouse_url)
        .with_database(&clickhouse_db)
        .with_user(&user)
        .with_password(&password);

    let warehouse = ClickHouseWarehouse::new(client);
    let recorder = OccurrenceRecorder::new(config.ingestor.uri_blacklist.clone(), config.store.key_expiry_secs);
    let stats = AnomalyStats::new(config.store.key_expiry_secs);
    let ingestor = Ingestor::new(warehouse, recorder, stats, config.ingestor.clone());

    let log_hours: Vec<String> = if args.use_daily_tables {
        vec![date.clone()]
    } else {
        (0..24).map(|h| format!("{date}_{h:02}")).collect()
    };

    for log_hour in log_hours {
        match ingestor.ingest_hour(&store, &log_hour).await {
            Ok(()) => {}
            Err(WarehouseError::CredentialsInvalid(msg)) => {
                tracing::error!(error = %msg, "warehouse credentials invalid");
                std::process::exit(1);
            }
            Err(WarehouseError::TableAbsent) => {
                tracing::info!(log_hour = %log_hour, "warehouse table absent, stopping for the day");
                break;
            }
            Err(err) => {
                tracing::error!(error = %err, log_hour = %log_hour, "fatal warehouse error");
                std::process::exit(2);
            }
        }
    }

    std::process::exit(0);
}
