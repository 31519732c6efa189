//! Manager configuration: JSON files plus environment overrides.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::queue::QueueConfig;
use crate::types::BackoffStrategy;

/// Path of a JSON config file.
pub const CONFIG_PATH_ENV: &str = "DROPQUEUE_CONFIG";
pub const TICK_MS_ENV: &str = "DROPQUEUE_TICK_MS";
pub const RETENTION_SECS_ENV: &str = "DROPQUEUE_RETENTION_SECS";
pub const AUTO_START_ENV: &str = "DROPQUEUE_AUTO_START";

/// How many jobs a queue may admit per dispatch tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionPolicy {
    /// At most one promotion per queue per tick
    #[default]
    OnePerTick,
    /// Fill every free concurrency slot each tick
    FillAvailable,
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Job queue manager configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Dispatch loop period
    pub tick_interval_ms: u64,
    /// How long terminal jobs stay in memory
    pub retention_secs: u64,
    pub promotion: PromotionPolicy,
    /// Start the dispatch loop on first submission
    pub auto_start: bool,
    pub queues: Vec<QueueConfig>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            retention_secs: 24 * 60 * 60,
            promotion: PromotionPolicy::OnePerTick,
            auto_start: true,
            queues: Vec::new(),
        }
    }
}

impl ManagerConfig {
    /// Queues used by the dashboard.
    ///
    /// Retry counts and delays follow the worker task definitions: imports
    /// and AI enrichment retry twice, supplier syncs three times a minute
    /// apart, order fulfilment three times two minutes apart, scrapes twice
    /// thirty seconds apart.
    pub fn with_default_queues(mut self) -> Self {
        self.queues = vec![
            QueueConfig::new("imports", 3).with_retry(2, Duration::from_secs(60)),
            QueueConfig::new("sync", 2).with_retry(3, Duration::from_secs(60)),
            QueueConfig::new("orders", 2).with_retry(3, Duration::from_secs(120)),
            QueueConfig::new("scraping", 4)
                .with_retry(2, Duration::from_secs(30))
                .with_backoff(BackoffStrategy::Linear),
            QueueConfig::new("ai", 2).with_retry(2, Duration::from_secs(60)),
        ];
        self
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    /// Retention window, capped at ten years so deadlines never overflow.
    pub fn retention(&self) -> chrono::Duration {
        const MAX_RETENTION_SECS: u64 = 10 * 365 * 24 * 60 * 60;
        let secs = self.retention_secs.min(MAX_RETENTION_SECS) as i64;
        chrono::Duration::seconds(secs)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Load from `DROPQUEUE_CONFIG` (or defaults with the dashboard queues)
    /// and apply environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_path(path)?,
            Err(_) => {
                warn!("{CONFIG_PATH_ENV} not set; using default queues");
                Self::default().with_default_queues()
            }
        };
        base.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a key lookup (the process environment in
    /// [`from_env`](Self::from_env)).
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(value) = lookup(TICK_MS_ENV) {
            self.tick_interval_ms = parse_u64(TICK_MS_ENV, &value)?;
        }
        if let Some(value) = lookup(RETENTION_SECS_ENV) {
            self.retention_secs = parse_u64(RETENTION_SECS_ENV, &value)?;
        }
        if let Some(value) = lookup(AUTO_START_ENV) {
            self.auto_start = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: AUTO_START_ENV,
                        value,
                    });
                }
            };
        }
        Ok(self)
    }
}

fn parse_u64(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn parses_partial_json_with_defaults() {
        let config = ManagerConfig::from_json_str(
            r#"{
                "tick_interval_ms": 250,
                "promotion": "fill_available",
                "queues": [
                    { "name": "imports", "concurrency": 3, "retry_attempts": 2 },
                    { "name": "orders", "backoff": "fixed", "is_active": false }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.tick_interval(), Duration::from_millis(250));
        assert_eq!(config.retention_secs, 86_400);
        assert_eq!(config.promotion, PromotionPolicy::FillAvailable);
        assert!(config.auto_start);
        assert_eq!(config.queues[0].concurrency, 3);
        assert_eq!(config.queues[0].retry_attempts, 2);
        assert_eq!(config.queues[1].concurrency, 1);
        assert_eq!(config.queues[1].backoff, BackoffStrategy::Fixed);
        assert!(!config.queues[1].is_active);
    }

    #[test]
    fn overrides_replace_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            (TICK_MS_ENV, "50"),
            (RETENTION_SECS_ENV, "3600"),
            (AUTO_START_ENV, "off"),
        ]);

        let config = ManagerConfig::default()
            .with_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.tick_interval_ms, 50);
        assert_eq!(config.retention(), chrono::Duration::hours(1));
        assert!(!config.auto_start);
    }

    #[test]
    fn malformed_override_is_reported() {
        let err = ManagerConfig::default()
            .with_overrides(|k| (k == TICK_MS_ENV).then(|| "soon".to_string()))
            .unwrap_err();

        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: TICK_MS_ENV,
                ..
            }
        ));
    }

    #[test]
    fn default_queues_are_valid() {
        let config = ManagerConfig::default().with_default_queues();
        let names: Vec<_> = config.queues.iter().map(|q| q.name.as_str()).collect();

        assert_eq!(names, vec!["imports", "sync", "orders", "scraping", "ai"]);
        assert!(config.queues.iter().all(|q| q.validate().is_ok()));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = ManagerConfig::from_path("/nonexistent/dropqueue.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
