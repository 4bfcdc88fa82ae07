//! 运行配置加载（`NETOPS_*` 环境变量）。

use std::env;
use std::time::Duration;

/// 配置加载错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
}

/// 应用运行配置。
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub pool_max_per_device: usize,
    pub pool_max_total: usize,
    pub pool_max_idle_seconds: u64,
    pub pool_max_lifetime_seconds: u64,
    pub pool_health_check_interval_seconds: u64,
    pub pool_cleanup_interval_seconds: u64,
    pub pool_acquire_timeout_ms: u64,
    pub session_connect_timeout_seconds: u64,
    pub session_command_timeout_seconds: u64,
    pub concurrency_initial: usize,
    pub concurrency_min: usize,
    pub concurrency_max: usize,
    pub concurrency_retune_seconds: u64,
    pub batch_max_retries: u32,
    pub batch_timeout_per_device_seconds: u64,
    pub batch_retention_seconds: u64,
    pub batch_backoff_base_ms: u64,
    pub monitor_history_size: usize,
    pub monitor_alert_capacity: usize,
    pub monitor_interval_seconds: u64,
    pub inventory_path: Option<String>,
    /// 0 表示关闭周期巡检。
    pub probe_interval_seconds: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            pool_max_per_device: 3,
            pool_max_total: 50,
            pool_max_idle_seconds: 300,
            pool_max_lifetime_seconds: 3600,
            pool_health_check_interval_seconds: 60,
            pool_cleanup_interval_seconds: 120,
            pool_acquire_timeout_ms: 0,
            session_connect_timeout_seconds: 30,
            session_command_timeout_seconds: 60,
            concurrency_initial: 20,
            concurrency_min: 5,
            concurrency_max: 100,
            concurrency_retune_seconds: 30,
            batch_max_retries: 3,
            batch_timeout_per_device_seconds: 300,
            batch_retention_seconds: 300,
            batch_backoff_base_ms: 1000,
            monitor_history_size: 10_000,
            monitor_alert_capacity: 1000,
            monitor_interval_seconds: 60,
            inventory_path: None,
            probe_interval_seconds: 300,
        }
    }
}

impl AppConfig {
    /// 从环境变量读取配置，缺省项使用默认值。
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            pool_max_per_device: read_usize_with_default(
                "NETOPS_POOL_MAX_PER_DEVICE",
                defaults.pool_max_per_device,
            )?,
            pool_max_total: read_usize_with_default("NETOPS_POOL_MAX_TOTAL", defaults.pool_max_total)?,
            pool_max_idle_seconds: read_u64_with_default(
                "NETOPS_POOL_MAX_IDLE_SECONDS",
                defaults.pool_max_idle_seconds,
            )?,
            pool_max_lifetime_seconds: read_u64_with_default(
                "NETOPS_POOL_MAX_LIFETIME_SECONDS",
                defaults.pool_max_lifetime_seconds,
            )?,
            pool_health_check_interval_seconds: read_u64_with_default(
                "NETOPS_POOL_HEALTH_CHECK_INTERVAL_SECONDS",
                defaults.pool_health_check_interval_seconds,
            )?,
            pool_cleanup_interval_seconds: read_u64_with_default(
                "NETOPS_POOL_CLEANUP_INTERVAL_SECONDS",
                defaults.pool_cleanup_interval_seconds,
            )?,
            pool_acquire_timeout_ms: read_u64_with_default(
                "NETOPS_POOL_ACQUIRE_TIMEOUT_MS",
                defaults.pool_acquire_timeout_ms,
            )?,
            session_connect_timeout_seconds: read_u64_with_default(
                "NETOPS_SESSION_CONNECT_TIMEOUT_SECONDS",
                defaults.session_connect_timeout_seconds,
            )?,
            session_command_timeout_seconds: read_u64_with_default(
                "NETOPS_SESSION_COMMAND_TIMEOUT_SECONDS",
                defaults.session_command_timeout_seconds,
            )?,
            concurrency_initial: read_usize_with_default(
                "NETOPS_CONCURRENCY_INITIAL",
                defaults.concurrency_initial,
            )?,
            concurrency_min: read_usize_with_default("NETOPS_CONCURRENCY_MIN", defaults.concurrency_min)?,
            concurrency_max: read_usize_with_default("NETOPS_CONCURRENCY_MAX", defaults.concurrency_max)?,
            concurrency_retune_seconds: read_u64_with_default(
                "NETOPS_CONCURRENCY_RETUNE_SECONDS",
                defaults.concurrency_retune_seconds,
            )?,
            batch_max_retries: read_u32_with_default(
                "NETOPS_BATCH_MAX_RETRIES",
                defaults.batch_max_retries,
            )?,
            batch_timeout_per_device_seconds: read_u64_with_default(
                "NETOPS_BATCH_TIMEOUT_PER_DEVICE_SECONDS",
                defaults.batch_timeout_per_device_seconds,
            )?,
            batch_retention_seconds: read_u64_with_default(
                "NETOPS_BATCH_RETENTION_SECONDS",
                defaults.batch_retention_seconds,
            )?,
            batch_backoff_base_ms: read_u64_with_default(
                "NETOPS_BATCH_BACKOFF_BASE_MS",
                defaults.batch_backoff_base_ms,
            )?,
            monitor_history_size: read_usize_with_default(
                "NETOPS_MONITOR_HISTORY_SIZE",
                defaults.monitor_history_size,
            )?,
            monitor_alert_capacity: read_usize_with_default(
                "NETOPS_MONITOR_ALERT_CAPACITY",
                defaults.monitor_alert_capacity,
            )?,
            monitor_interval_seconds: read_u64_with_default(
                "NETOPS_MONITOR_INTERVAL_SECONDS",
                defaults.monitor_interval_seconds,
            )?,
            inventory_path: read_optional("NETOPS_INVENTORY_PATH"),
            probe_interval_seconds: read_u64_with_default(
                "NETOPS_PROBE_INTERVAL_SECONDS",
                defaults.probe_interval_seconds,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// 校验上下限关系与非零上限。
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure_positive("NETOPS_POOL_MAX_PER_DEVICE", self.pool_max_per_device)?;
        ensure_positive("NETOPS_POOL_MAX_TOTAL", self.pool_max_total)?;
        ensure_positive("NETOPS_CONCURRENCY_MIN", self.concurrency_min)?;
        ensure_positive("NETOPS_MONITOR_HISTORY_SIZE", self.monitor_history_size)?;
        ensure_positive("NETOPS_MONITOR_ALERT_CAPACITY", self.monitor_alert_capacity)?;
        if self.pool_max_per_device > self.pool_max_total {
            return Err(ConfigError::Invalid(
                "NETOPS_POOL_MAX_PER_DEVICE".to_string(),
                format!(
                    "{} exceeds NETOPS_POOL_MAX_TOTAL {}",
                    self.pool_max_per_device, self.pool_max_total
                ),
            ));
        }
        if self.concurrency_min > self.concurrency_max {
            return Err(ConfigError::Invalid(
                "NETOPS_CONCURRENCY_MIN".to_string(),
                format!(
                    "{} exceeds NETOPS_CONCURRENCY_MAX {}",
                    self.concurrency_min, self.concurrency_max
                ),
            ));
        }
        if self.concurrency_initial < self.concurrency_min
            || self.concurrency_initial > self.concurrency_max
        {
            return Err(ConfigError::Invalid(
                "NETOPS_CONCURRENCY_INITIAL".to_string(),
                format!(
                    "{} outside [{}, {}]",
                    self.concurrency_initial, self.concurrency_min, self.concurrency_max
                ),
            ));
        }
        Ok(())
    }

    pub fn session_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.session_connect_timeout_seconds)
    }

    pub fn session_command_timeout(&self) -> Duration {
        Duration::from_secs(self.session_command_timeout_seconds)
    }

    /// 巡检周期；关闭时返回 None。
    pub fn probe_interval(&self) -> Option<Duration> {
        (self.probe_interval_seconds > 0).then(|| Duration::from_secs(self.probe_interval_seconds))
    }
}

fn ensure_positive(key: &str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid(key.to_string(), "0".to_string()));
    }
    Ok(())
}

fn read_u64_with_default(key: &str, default: u64) -> Result<u64, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_u32_with_default(key: &str, default: u32) -> Result<u32, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .trim()
        .parse::<u32>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_usize_with_default(key: &str, default: usize) -> Result<usize, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .trim()
        .parse::<usize>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_optional(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.probe_interval(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn min_above_max_is_rejected() {
        let config = AppConfig {
            concurrency_min: 50,
            concurrency_max: 10,
            concurrency_initial: 20,
            ..AppConfig::default()
        };
        match config.validate() {
            Err(ConfigError::Invalid(key, _)) => assert_eq!(key, "NETOPS_CONCURRENCY_MIN"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn zero_caps_are_rejected() {
        let config = AppConfig {
            pool_max_total: 0,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_probe_interval_disables_probe() {
        let config = AppConfig {
            probe_interval_seconds: 0,
            ..AppConfig::default()
        };
        assert_eq!(config.probe_interval(), None);
    }
}
