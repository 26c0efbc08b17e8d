use serde::Deserialize;
use std::path::Path;

/// Top-level config loaded from `wide.toml`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct WideConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub ingestor: IngestorConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Default TTL applied to every error/occurrence key, in seconds.
    /// Spec default is one week.
    #[serde(default = "default_key_expiry_secs")]
    pub key_expiry_secs: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_expiry_secs: default_key_expiry_secs(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_expiry_secs() -> i64 {
    60 * 60 * 24 * 7
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestorConfig {
    /// Resource prefixes to silently drop occurrences for.
    #[serde(default = "default_uri_blacklist")]
    pub uri_blacklist: Vec<String>,
    /// Validate versions against the older `DDDD-DDDD-hex12` format instead
    /// of the current `DDDDDD-DDDD-hex12` one.
    #[serde(default)]
    pub legacy_version_format: bool,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_pause_secs")]
    pub retry_pause_secs: u64,
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self {
            uri_blacklist: default_uri_blacklist(),
            legacy_version_format: false,
            retry_attempts: default_retry_attempts(),
            retry_pause_secs: default_retry_pause_secs(),
        }
    }
}

fn default_uri_blacklist() -> Vec<String> {
    vec!["/api/internal/translate/lint_poentry".to_string()]
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_pause_secs() -> u64 {
    60
}

/// Known-noisy errors that shouldn't trip a deploy alert unless they spike far
/// beyond their usual rate. Empty by default; operators fill this in for
/// their own deployment's chronic, already-triaged errors.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MonitorConfig {
    #[serde(default)]
    pub blacklisted_titles: Vec<BlacklistEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlacklistEntry {
    /// Substring match against the error title.
    pub contains: String,
    /// The error is still reported if the per-minute count exceeds this.
    pub threshold: u64,
}

impl WideConfig {
    /// Load config from a TOML file. Returns defaults if the file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: WideConfig = toml::from_str(&contents)?;
        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }
}
