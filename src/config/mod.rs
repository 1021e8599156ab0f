//! `CoreConfig` — TOML-file-plus-defaults configuration, following the
//! teacher's `DaemonConfig`/`TomlConfig` layering (`toml::from_str` against
//! `{data_dir}/config.toml`, struct defaults filling in anything absent).
//!
//! Recognizes every key in spec.md §6.4: per-provider rate limiter buckets,
//! queue class caps, the prioritization flag, and the lease/heartbeat/
//! reservation timing knobs C5 validates at construction.

use crate::queue::QueueCaps;
use crate::ratelimit::BucketConfig;
use crate::scheduler::SchedulerConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::error;

#[derive(Debug, Clone, Deserialize, Default)]
struct TomlRateLimit {
    capacity: Option<f64>,
    refill_rate: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct TomlQueueCaps {
    high: Option<usize>,
    medium: Option<usize>,
    low: Option<usize>,
}

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: TOML > built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// Log level filter string, e.g. "debug", "info,beadbroker=trace" (default: "info").
    log: Option<String>,
    enable_prioritization: Option<bool>,
    lease_ttl_ms: Option<i64>,
    heartbeat_interval_ms: Option<i64>,
    renewal_interval_ms: Option<i64>,
    reservation_retry_budget: Option<u32>,
    attempts_ceiling: Option<i64>,
    #[serde(default)]
    queue_caps: TomlQueueCaps,
    #[serde(default)]
    rate_limits: HashMap<String, TomlRateLimit>,
}

/// Reads `{data_dir}/config.toml`, if present. A missing file is the normal
/// case (defaults apply); a malformed one is logged and treated the same way.
fn load_toml(data_dir: &Path) -> TomlConfig {
    let path = data_dir.join("config.toml");
    let Ok(contents) = std::fs::read_to_string(&path) else {
        return TomlConfig::default();
    };
    match toml::from_str(&contents) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            TomlConfig::default()
        }
    }
}

/// Fully resolved configuration: `config.toml` overlaid on built-in defaults.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub data_dir: PathBuf,
    pub log: String,
    pub enable_prioritization: bool,
    pub queue_caps: QueueCaps,
    pub rate_limits: HashMap<String, BucketConfig>,
    pub scheduler: SchedulerConfig,
}

impl CoreConfig {
    /// Loads `{data_dir}/config.toml`, if any, and layers it over defaults.
    pub fn load(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let toml = load_toml(&data_dir);

        let default_scheduler = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            lease_ttl_ms: toml.lease_ttl_ms.unwrap_or(default_scheduler.lease_ttl_ms),
            heartbeat_interval_ms: toml
                .heartbeat_interval_ms
                .unwrap_or(default_scheduler.heartbeat_interval_ms),
            renewal_interval_ms: toml
                .renewal_interval_ms
                .unwrap_or(default_scheduler.renewal_interval_ms),
            reservation_retry_budget: toml
                .reservation_retry_budget
                .unwrap_or(default_scheduler.reservation_retry_budget),
            attempts_ceiling: toml.attempts_ceiling.or(default_scheduler.attempts_ceiling),
        };

        let default_caps = QueueCaps::default();
        let queue_caps = QueueCaps {
            high: toml.queue_caps.high.unwrap_or(default_caps.high),
            medium: toml.queue_caps.medium.unwrap_or(default_caps.medium),
            low: toml.queue_caps.low.unwrap_or(default_caps.low),
        };

        let default_bucket = BucketConfig::default();
        let rate_limits = toml
            .rate_limits
            .into_iter()
            .map(|(provider, cfg)| {
                (
                    provider,
                    BucketConfig {
                        capacity: cfg.capacity.unwrap_or(default_bucket.capacity),
                        refill_rate: cfg.refill_rate.unwrap_or(default_bucket.refill_rate),
                    },
                )
            })
            .collect();

        Self {
            data_dir,
            log: toml.log.unwrap_or_else(|| "info".to_string()),
            enable_prioritization: toml.enable_prioritization.unwrap_or(true),
            queue_caps,
            rate_limits,
            scheduler,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CoreConfig::load(dir.path());
        assert_eq!(config.log, "info");
        assert!(config.enable_prioritization);
        assert_eq!(config.scheduler.lease_ttl_ms, 30_000);
    }

    #[test]
    fn toml_overrides_layer_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            r#"
            log = "debug"
            enable_prioritization = false
            lease_ttl_ms = 60000

            [queue_caps]
            high = 10

            [rate_limits.anthropic]
            capacity = 120.0
            refill_rate = 2.0
            "#,
        )
        .unwrap();

        let config = CoreConfig::load(dir.path());
        assert_eq!(config.log, "debug");
        assert!(!config.enable_prioritization);
        assert_eq!(config.scheduler.lease_ttl_ms, 60_000);
        assert_eq!(config.queue_caps.high, 10);
        assert_eq!(config.queue_caps.medium, QueueCaps::default().medium);
        let anthropic = config.rate_limits.get("anthropic").unwrap();
        assert_eq!(anthropic.capacity, 120.0);
        assert_eq!(anthropic.refill_rate, 2.0);
    }

    #[test]
    fn malformed_toml_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "not valid toml {{{").unwrap();
        let config = CoreConfig::load(dir.path());
        assert_eq!(config.log, "info");
    }
}
