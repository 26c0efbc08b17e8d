//! Read-only client that polls `MonitorService` and formats/pushes
//! summaries to an external chat channel. `alertlib`-style delivery is out
//! of scope; this only builds the payload and POSTs to a configured
//! incoming webhook, the same shape the teacher's anomaly engine uses to
//! push Slack notifications.

use crate::models::monitor::{AnomalyEntry, AnomaliesResponse, ErrorSummary, RecentErrorsResponse};

pub struct Reporter {
    http: reqwest::Client,
    host: String,
    webhook_url: Option<String>,
}

impl Reporter {
    pub fn new(host: String, webhook_url: Option<String>) -> Self {
        Self { http: reqwest::Client::new(), host, webhook_url }
    }

    pub async fn fetch_anomalies(&self, log_hour: &str) -> anyhow::Result<AnomaliesResponse> {
        let url = format!("http://{}/anomalies/{log_hour}", self.host);
        let resp = self.http.get(&url).send().await?.error_for_status()?;
        Ok(resp.json().await?)
    }

    pub async fn fetch_recent_errors(&self) -> anyhow::Result<RecentErrorsResponse> {
        let url = format!("http://{}/recent_errors", self.host);
        let resp = self.http.get(&url).send().await?.error_for_status()?;
        Ok(resp.json().await?)
    }

    pub async fn fetch_version_errors(&self, version: &str) -> anyhow::Result<RecentErrorsResponse> {
        let url = format!("http://{}/version_errors/{version}", self.host);
        let resp = self.http.get(&url).send().await?.error_for_status()?;
        Ok(resp.json().await?)
    }

    pub fn format_anomaly_summary(hour: &str, anomalies: &[AnomalyEntry]) -> String {
        if anomalies.is_empty() {
            return format!("No request-volume anomalies for {hour}.");
        }
        let mut lines = vec![format!("{} request-volume anomalies for {hour}:", anomalies.len())];
        for a in anomalies {
            lines.push(format!("  {} [{}] count={} score={:.1}", a.route, a.status, a.count, a.anomaly_score));
        }
        lines.join("\n")
    }

    pub fn format_error_summary(num_to_highlight: usize, errors: &[ErrorSummary], new_only: bool) -> String {
        let mut filtered: Vec<&ErrorSummary> = if new_only {
            errors.iter().filter(|e| e.first_seen.is_some()).collect()
        } else {
            errors.iter().collect()
        };
        filtered.sort_by(|a, b| b.count.cmp(&a.count));
        filtered.truncate(num_to_highlight);

        if filtered.is_empty() {
            return "No errors to report.".to_string();
        }
        let mut lines = vec![format!("Top {} errors:", filtered.len())];
        for e in filtered {
            lines.push(format!(
                "  [{}] {} — {} occurrences (first seen {})",
                e.error_def.level_readable,
                e.error_def.title,
                e.count,
                e.first_seen.as_deref().unwrap_or("unknown"),
            ));
        }
        lines.join("\n")
    }

    pub async fn push_to_slack(&self, channel: &str, text: &str) -> anyhow::Result<()> {
        let Some(webhook) = &self.webhook_url else {
            anyhow::bail!("no slack webhook configured");
        };
        let payload = serde_json::json!({ "channel": channel, "text": text });
        self.http.post(webhook).json(&payload).send().await?.error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::error_def::ErrorDefinition;
    use crate::models::monitor::ErrorSummaryDef;
    use std::collections::HashMap;

    #[test]
    fn empty_anomalies_formats_a_clean_message() {
        let msg = Reporter::format_anomaly_summary("2024010100", &[]);
        assert!(msg.contains("No request-volume anomalies"));
    }

    #[test]
    fn anomaly_summary_lists_each_entry() {
        let anomalies = vec![AnomalyEntry { route: "/a".to_string(), status: 200, count: 1, anomaly_score: -42.0 }];
        let msg = Reporter::format_anomaly_summary("2024010100", &anomalies);
        assert!(msg.contains("/a"));
        assert!(msg.contains("-42"));
    }

    fn sample_summary(title: &str, count: i64, first_seen: Option<&str>) -> ErrorSummary {
        let _ = ErrorDefinition {
            key: "abc".to_string(),
            title: title.to_string(),
            status: "500".to_string(),
            level: "3".to_string(),
            id0: "x".to_string(),
            id1: None,
            id2: None,
            id3: None,
        };
        ErrorSummary {
            error_def: ErrorSummaryDef {
                key: "abc".to_string(),
                title: title.to_string(),
                status: "500".to_string(),
                level: "3".to_string(),
                id0: "x".to_string(),
                id1: None,
                id2: None,
                id3: None,
                level_readable: "ERROR".to_string(),
            },
            versions: HashMap::new(),
            first_seen: first_seen.map(str::to_string),
            last_seen: None,
            by_hour_and_version: vec![],
            count,
            routes: None,
        }
    }

    #[test]
    fn error_summary_respects_highlight_limit() {
        let errors = vec![
            sample_summary("a", 10, Some("h1")),
            sample_summary("b", 5, Some("h2")),
            sample_summary("c", 1, Some("h3")),
        ];
        let msg = Reporter::format_error_summary(2, &errors, false);
        assert!(msg.contains("a"));
        assert!(msg.contains("b"));
        assert!(!msg.contains(" c "));
    }
}
