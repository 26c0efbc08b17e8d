use chrono::NaiveDateTime;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use wide_error_monitor::reporter::Reporter;

/// Reads `MonitorService` summaries over a date range and pushes them to
/// an external alert channel.
#[derive(Parser)]
#[command(name = "wide-report")]
struct Args {
    #[arg(long = "start-date")]
    start_date: String,

    #[arg(long = "end-date")]
    end_date: String,

    #[arg(long)]
    host: String,

    #[arg(long = "num-errors-to-highlight", default_value_t = 10)]
    num_errors_to_highlight: usize,

    #[arg(long = "new-only")]
    new_only: bool,

    #[arg(long)]
    slack: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wide_report=info")))
        .init();

    let args = Args::parse();

    let start = match NaiveDateTime::parse_from_str(&args.start_date, "%Y%m%d_%H") {
        Ok(v) => v,
        Err(err) => {
            tracing::error!(error = %err, "invalid --start-date, expected YYYYMMDD_HH");
            std::process::exit(2);
        }
    };
    let end = match NaiveDateTime::parse_from_str(&args.end_date, "%Y%m%d_%H") {
        Ok(v) => v,
        Err(err) => {
            tracing::error!(error = %err, "invalid --end-date, expected YYYYMMDD_HH");
            std::process::exit(2);
        }
    };

    let webhook = std::env::var("WIDE_SLACK_WEBHOOK_URL").ok();
    let reporter = Reporter::new(args.host.clone(), webhook);

    let mut cursor = start;
    while cursor <= end {
        let log_hour = cursor.format("%Y%m%d_%H").to_string();
        match reporter.fetch_anomalies(&log_hour).await {
            Ok(resp) => {
                let message = Reporter::format_anomaly_summary(&log_hour, &resp.anomalies);
                deliver(&reporter, &args, &message).await;
            }
            Err(err) => tracing::warn!(error = %err, log_hour = %log_hour, "failed to fetch anomalies"),
        }
        cursor += chrono::Duration::hours(1);
    }

    match reporter.fetch_recent_errors().await {
        Ok(resp) => {
            let message = Reporter::format_error_summary(args.num_errors_to_highlight, &resp.errors, args.new_only);
            deliver(&reporter, &args, &message).await;
        }
        Err(err) => {
            tracing::error!(error = %err, "failed to fetch recent errors");
            std::process::exit(2);
        }
    }

    std::process::exit(0);
}

async fn deliver(reporter: &Reporter, args: &Args, message: &str) {
    match &args.slack {
        Some(channel) => {
            if let Err(err) = reporter.push_to_slack(channel, message).await {
                tracing::error!(error = %err, channel = %channel, "failed to push summary to slack");
            }
        }
        None => println!("{message}"),
    }
}
