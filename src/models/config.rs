//! Application configuration structures.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::{MirrorMode, MirrorTarget};

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Catalog lookup and scan behavior
    #[serde(default)]
    pub crawler: CrawlerConfig,

    /// Persisted state locations and lock policy
    #[serde(default)]
    pub state: StateConfig,

    /// Mirror destinations and commit settings
    #[serde(default)]
    pub mirror: MirrorConfig,

    /// Status notifications
    #[serde(default)]
    pub notify: NotifyConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration, or return defaults if the file does not exist.
    /// A file that exists but does not parse is an error.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(content) => Ok(toml::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("Config file {:?} not found. Using defaults.", path);
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.crawler.api_base.trim().is_empty() {
            return Err(AppError::validation("crawler.api_base is empty"));
        }
        url::Url::parse(&self.crawler.api_base)?;
        if self.crawler.user_agent.trim().is_empty() {
            return Err(AppError::validation("crawler.user_agent is empty"));
        }
        if self.crawler.timeout_secs == 0 {
            return Err(AppError::validation("crawler.timeout_secs must be > 0"));
        }
        if self.crawler.max_concurrent == 0 {
            return Err(AppError::validation("crawler.max_concurrent must be > 0"));
        }
        if self.crawler.batch_size == 0 {
            return Err(AppError::validation("crawler.batch_size must be > 0"));
        }
        if !self.crawler.rate_limit.is_finite() || self.crawler.rate_limit < 0.0 {
            return Err(AppError::validation("crawler.rate_limit must be >= 0"));
        }
        if !self.crawler.max_runtime_hours.is_finite() || self.crawler.max_runtime_hours <= 0.0 {
            return Err(AppError::validation(
                "crawler.max_runtime_hours must be > 0",
            ));
        }
        if self.crawler.start_id >= self.crawler.end_id {
            return Err(AppError::validation(
                "crawler.start_id must be below crawler.end_id",
            ));
        }
        if self.state.lock_stale_secs == 0 {
            return Err(AppError::validation("state.lock_stale_secs must be > 0"));
        }
        // A live scan must never look abandoned to the next run.
        if self.state.lock_stale_after() <= self.crawler.budget() {
            return Err(AppError::validation(format!(
                "state.lock_stale_secs ({}) must exceed crawler.max_runtime_hours ({}h)",
                self.state.lock_stale_secs, self.crawler.max_runtime_hours
            )));
        }
        if self.mirror.branch.trim().is_empty() {
            return Err(AppError::validation("mirror.branch is empty"));
        }

        let mut seen = std::collections::HashSet::new();
        for target in &self.mirror.targets {
            if target.id.trim().is_empty() || target.url.trim().is_empty() {
                return Err(AppError::validation(
                    "mirror.targets entries need both id and url",
                ));
            }
            if !seen.insert(target.id.as_str()) {
                return Err(AppError::validation(format!(
                    "duplicate mirror target id '{}'",
                    target.id
                )));
            }
        }
        Ok(())
    }
}

/// Catalog lookup and scan behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    /// Base URL of the catalog API
    #[serde(default = "defaults::api_base")]
    pub api_base: String,

    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Request timeout in seconds
    #[serde(default = "defaults::timeout")]
    pub timeout_secs: u64,

    /// Maximum lookups per second across all workers (0 disables limiting)
    #[serde(default = "defaults::rate_limit")]
    pub rate_limit: f64,

    /// Maximum concurrent lookups
    #[serde(default = "defaults::max_concurrent")]
    pub max_concurrent: usize,

    /// Retries per lookup after a transient failure
    #[serde(default = "defaults::max_wait_attempts")]
    pub max_wait_attempts: u32,

    /// First retry delay in milliseconds (doubles per retry)
    #[serde(default = "defaults::retry_delay")]
    pub retry_delay_ms: u64,

    /// Retry delay ceiling in milliseconds
    #[serde(default = "defaults::max_retry_delay")]
    pub max_retry_delay_ms: u64,

    /// Identifiers processed between persisted checkpoints
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,

    /// Consecutive unresolved lookups before the scan stops dispatching
    #[serde(default = "defaults::max_api_failures")]
    pub max_api_failures: u32,

    /// Wall-clock budget for a scan run
    #[serde(default = "defaults::max_runtime_hours")]
    pub max_runtime_hours: f64,

    /// Expand matches to related identifiers and match names partially
    #[serde(default)]
    pub aggressive_matching: bool,

    /// Default scan range start (inclusive)
    #[serde(default = "defaults::start_id")]
    pub start_id: u64,

    /// Default scan range end (exclusive)
    #[serde(default = "defaults::end_id")]
    pub end_id: u64,
}

impl CrawlerConfig {
    /// The wall-clock budget as a duration.
    pub fn budget(&self) -> Duration {
        Duration::from_secs_f64(self.max_runtime_hours.max(0.0) * 3600.0)
    }
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            api_base: defaults::api_base(),
            user_agent: defaults::user_agent(),
            timeout_secs: defaults::timeout(),
            rate_limit: defaults::rate_limit(),
            max_concurrent: defaults::max_concurrent(),
            max_wait_attempts: defaults::max_wait_attempts(),
            retry_delay_ms: defaults::retry_delay(),
            max_retry_delay_ms: defaults::max_retry_delay(),
            batch_size: defaults::batch_size(),
            max_api_failures: defaults::max_api_failures(),
            max_runtime_hours: defaults::max_runtime_hours(),
            aggressive_matching: false,
            start_id: defaults::start_id(),
            end_id: defaults::end_id(),
        }
    }
}

/// Persisted state settings. File names are relative to the base directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Age after which a run lock counts as abandoned
    #[serde(default = "defaults::lock_stale_secs")]
    pub lock_stale_secs: u64,

    #[serde(default = "defaults::cursor_file")]
    pub cursor_file: String,

    #[serde(default = "defaults::lock_file")]
    pub lock_file: String,

    #[serde(default = "defaults::policy_file")]
    pub policy_file: String,
}

impl StateConfig {
    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_secs)
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            lock_stale_secs: defaults::lock_stale_secs(),
            cursor_file: defaults::cursor_file(),
            lock_file: defaults::lock_file(),
            policy_file: defaults::policy_file(),
        }
    }
}

/// Mirror destination settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Branch pushed on every destination
    #[serde(default = "defaults::branch")]
    pub branch: String,

    #[serde(default = "defaults::author_name")]
    pub author_name: String,

    #[serde(default = "defaults::author_email")]
    pub author_email: String,

    /// Configured destinations
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            branch: defaults::branch(),
            author_name: defaults::author_name(),
            author_email: defaults::author_email(),
            targets: Vec::new(),
        }
    }
}

/// A destination as written in the config file. The token itself never lives here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub mode: MirrorMode,
    /// Environment variable holding this destination's token
    #[serde(default)]
    pub token_env: Option<String>,
}

impl TargetConfig {
    /// Resolve into a runtime target, reading the token from the environment.
    pub fn resolve(&self, fallback_token: Option<&str>) -> MirrorTarget {
        let token = self
            .token_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .or_else(|| fallback_token.map(str::to_string));
        MirrorTarget::new(self.id.clone(), self.url.clone(), self.mode, token)
    }
}

/// Notification endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Base URL of the push endpoint; notifications are disabled when unset
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "defaults::notify_timeout")]
    pub timeout_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: defaults::notify_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "defaults::log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::log_level(),
        }
    }
}

mod defaults {
    // Crawler defaults
    pub fn api_base() -> String {
        "https://api.anitabi.cn".into()
    }
    pub fn user_agent() -> String {
        "Mozilla/5.0 (compatible; pilgrim/0.1)".into()
    }
    pub fn timeout() -> u64 {
        10
    }
    pub fn rate_limit() -> f64 {
        5.0
    }
    pub fn max_concurrent() -> usize {
        8
    }
    pub fn max_wait_attempts() -> u32 {
        3
    }
    pub fn retry_delay() -> u64 {
        1_000
    }
    pub fn max_retry_delay() -> u64 {
        10_000
    }
    pub fn batch_size() -> usize {
        100
    }
    pub fn max_api_failures() -> u32 {
        10
    }
    pub fn max_runtime_hours() -> f64 {
        5.5
    }
    pub fn start_id() -> u64 {
        100_000
    }
    pub fn end_id() -> u64 {
        2_000_000
    }

    // State defaults
    pub fn lock_stale_secs() -> u64 {
        6 * 3600
    }
    pub fn cursor_file() -> String {
        "scan_state.json".into()
    }
    pub fn lock_file() -> String {
        "store.lock".into()
    }
    pub fn policy_file() -> String {
        "mirror_policy.json".into()
    }

    // Mirror defaults
    pub fn branch() -> String {
        "main".into()
    }
    pub fn author_name() -> String {
        "pilgrim-sync".into()
    }
    pub fn author_email() -> String {
        "pilgrim-sync@users.noreply.github.com".into()
    }

    pub fn notify_timeout() -> u64 {
        10
    }
    pub fn log_level() -> String {
        "info".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_default_config_ok() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let mut config = Config::default();
        config.crawler.max_concurrent = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_inverted_default_range() {
        let mut config = Config::default();
        config.crawler.start_id = 10;
        config.crawler.end_id = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_targets() {
        let mut config = Config::default();
        let target = TargetConfig {
            id: "cdn1".into(),
            url: "https://example.com/cdn1.git".into(),
            mode: MirrorMode::Partitioned,
            token_env: None,
        };
        config.mirror.targets = vec![target.clone(), target];
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let config: Config = toml::from_str(
            r#"
            [crawler]
            rate_limit = 2.5
            aggressive_matching = true

            [[mirror.targets]]
            id = "full"
            url = "https://example.com/full.git"
            mode = "full"

            [[mirror.targets]]
            id = "cdn1"
            url = "https://example.com/cdn1.git"
            mode = "partitioned"
            token_env = "CDN1_TOKEN"
            "#,
        )
        .unwrap();

        assert_eq!(config.crawler.rate_limit, 2.5);
        assert!(config.crawler.aggressive_matching);
        assert_eq!(config.crawler.max_concurrent, 8);
        assert_eq!(config.mirror.targets.len(), 2);
        assert_eq!(config.mirror.targets[0].mode, MirrorMode::Full);
        assert_eq!(config.mirror.targets[1].mode, MirrorMode::Partitioned);
        assert_eq!(config.state.lock_file, "store.lock");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load_or_default("/nonexistent/pilgrim.toml").unwrap();
        assert_eq!(config.crawler.batch_size, CrawlerConfig::default().batch_size);
        assert!(Config::load("/nonexistent/pilgrim.toml").is_err());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("pilgrim.toml");
        fs::write(&path, "[[mirror.targets]\nid = \"cdn1\"\n").unwrap();

        let err = Config::load_or_default(&path).unwrap_err();
        assert!(matches!(err, AppError::Toml(_)));
        assert!(err.is_fatal_setup());
    }

    #[test]
    fn validate_rejects_lock_shorter_than_budget() {
        let mut config = Config::default();
        config.crawler.max_runtime_hours = 7.0;
        assert!(config.validate().is_err());

        config.state.lock_stale_secs = 8 * 3600;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn budget_converts_hours() {
        let mut crawler = CrawlerConfig::default();
        crawler.max_runtime_hours = 0.5;
        assert_eq!(crawler.budget(), Duration::from_secs(1800));
    }
}
