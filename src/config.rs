use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::balancer::BalancerConfig;
use crate::coordination::{LifecycleConfig, SyncConfig};
use crate::persistence::BufferConfig;
use crate::platform::RouterConfig;
use crate::supervisor::FailsafeConfig;

/// Upper bound for staleness and retention windows (30 days)
pub const MAX_WINDOW_SECS: u64 = 30 * 24 * 3600;

/// Seconds as a chrono duration, saturating instead of panicking on overflow
pub(crate) fn window_duration(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub balancer: BalancerConfig,
    #[serde(default)]
    pub failsafe: FailsafeConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Directory for the daily rolling log file
    #[serde(default = "default_log_dir")]
    pub dir: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: default_log_dir(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("router.max_queue", 100)?
            .set_default("buffer.max_size", 1000)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("SWITCHBOARD_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (SWITCHBOARD_ROUTER__MAX_QUEUE, etc.)
            .add_source(
                Environment::with_prefix("SWITCHBOARD")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.router.max_queue == 0 {
            errors.push("router.max_queue must be positive".to_string());
        }
        if self.router.command_timeout_ms == 0 {
            errors.push("router.command_timeout_ms must be positive".to_string());
        }
        if self.balancer.task_timeout_ms == 0 {
            errors.push("balancer.task_timeout_ms must be positive".to_string());
        }
        if self.balancer.max_concurrent_tasks == 0 {
            errors.push("balancer.max_concurrent_tasks must be positive".to_string());
        }
        if self.balancer.strategy.parse::<crate::balancer::Strategy>().is_err() {
            errors.push(format!(
                "balancer.strategy '{}' is not a known strategy",
                self.balancer.strategy
            ));
        }
        if self.balancer.stale_worker_secs > MAX_WINDOW_SECS {
            errors.push(format!(
                "balancer.stale_worker_secs must be at most {}",
                MAX_WINDOW_SECS
            ));
        }
        if self.failsafe.counter_retention_secs > MAX_WINDOW_SECS {
            errors.push(format!(
                "failsafe.counter_retention_secs must be at most {}",
                MAX_WINDOW_SECS
            ));
        }
        if self.buffer.max_size == 0 {
            errors.push("buffer.max_size must be positive".to_string());
        }
        if self.buffer.flush_interval_secs == 0 {
            errors.push("buffer.flush_interval_secs must be positive".to_string());
        }
        if self.failsafe.check_interval_secs == 0 {
            errors.push("failsafe.check_interval_secs must be positive".to_string());
        }
        if self.sync.tolerance_secs <= 0.0 {
            errors.push("sync.tolerance_secs must be positive".to_string());
        }
        if self.sync.heartbeat_interval_secs == 0 {
            errors.push("sync.heartbeat_interval_secs must be positive".to_string());
        }
        if self.sync.heartbeat_timeout_secs <= self.sync.heartbeat_interval_secs {
            errors.push(
                "sync.heartbeat_timeout_secs must be greater than sync.heartbeat_interval_secs"
                    .to_string(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.router.max_queue, 100);
        assert_eq!(config.router.command_timeout_ms, 60_000);
        assert_eq!(config.buffer.max_size, 1000);
        assert_eq!(config.failsafe.check_interval_secs, 10);
        assert_eq!(config.sync.tolerance_secs, 5.0);
    }

    #[test]
    fn test_heartbeat_timeout_must_exceed_interval() {
        let mut config = AppConfig::default();
        config.sync.heartbeat_timeout_secs = config.sync.heartbeat_interval_secs;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("heartbeat_timeout_secs"));
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let mut config = AppConfig::default();
        config.balancer.strategy = "fastest".to_string();
        config.router.max_queue = 0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_oversized_windows_rejected() {
        let mut config = AppConfig::default();
        config.balancer.stale_worker_secs = u64::MAX;
        config.failsafe.counter_retention_secs = MAX_WINDOW_SECS + 1;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("stale_worker_secs"));
        assert!(errors[1].contains("counter_retention_secs"));
    }

    #[test]
    fn test_window_duration_saturates() {
        assert_eq!(window_duration(90), chrono::Duration::seconds(90));
        assert_eq!(window_duration(u64::MAX), chrono::Duration::MAX);
    }

    #[test]
    fn test_load_from_missing_dir_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_from(dir.path()).unwrap();
        assert_eq!(config.router.max_queue, 100);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_from_toml_overrides() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("default.toml"),
            "[router]\nmax_queue = 7\n\n[balancer]\nstrategy = \"round_robin\"\n",
        )
        .unwrap();

        let config = AppConfig::load_from(dir.path()).unwrap();
        assert_eq!(config.router.max_queue, 7);
        assert_eq!(config.balancer.strategy, "round_robin");
        assert_eq!(config.buffer.max_size, 1000);
    }
}
