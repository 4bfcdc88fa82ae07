use crate::executor::DeviceExecutor;
use netops_monitor::DeviceDetails;
use netops_pool::{ConcurrencySnapshot, PoolStats};
use netops_telemetry::{MetricsSnapshot, metrics};
use serde::Serialize;
use tracing::info;

/// 运行时统计快照（连接池、并发闸门、进程计数器）。
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStats {
    pub pool: PoolStats,
    pub concurrency: ConcurrencySnapshot,
    pub counters: MetricsSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
}

/// 运维健康报告。
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub issues: Vec<String>,
    /// 连接池使用率（百分比）。
    pub pool_usage_percent: f64,
    pub failed_connections: u64,
    pub device_health_rate: f64,
    pub recent_critical_alerts: bool,
}

impl DeviceExecutor {
    /// 启动连接池与性能监控的后台任务。
    pub fn start(&self) {
        self.pool.start();
        self.monitor.start();
        info!(target: "netops.batch", "executor_started");
    }

    pub async fn stop(&self) {
        self.pool.stop().await;
        self.monitor.stop().await;
        info!(target: "netops.batch", "executor_stopped");
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            pool: self.pool.stats(),
            concurrency: self.controller.snapshot(),
            counters: metrics().snapshot(),
        }
    }

    /// 手动调整并发上限，返回限定后的生效值。
    pub fn adjust_concurrency(&self, limit: usize) -> usize {
        self.controller.set_limit(limit)
    }

    /// 关闭全部空闲连接，返回数量。
    pub async fn clear_idle_connections(&self) -> usize {
        self.pool.clear_idle().await
    }

    pub async fn restart_pool(&self) {
        self.pool.restart().await;
    }

    pub fn device_performance(&self, device_ip: &str, device_id: Option<&str>) -> Option<DeviceDetails> {
        self.monitor.device_details(device_ip, device_id)
    }

    /// 汇总连接池与设备健康状况，发现问题时状态为 `warning`。
    pub fn health_report(&self) -> HealthReport {
        let pool = self.pool.stats();
        let summary = self.monitor.fleet_summary();
        let recent_critical_alerts = self.monitor.has_recent_critical_alert();

        let pool_usage_percent = if pool.max_total_connections == 0 {
            0.0
        } else {
            pool.total_connections as f64 / pool.max_total_connections as f64 * 100.0
        };

        let mut issues = Vec::new();
        if pool_usage_percent >= 90.0 {
            issues.push(format!("connection pool usage at {:.1}%", pool_usage_percent));
        }
        if pool.failed_connections > 10 {
            issues.push(format!("{} failed connections", pool.failed_connections));
        }
        if summary.device_health.health_rate < 0.8 {
            issues.push(format!(
                "device health rate at {:.1}%",
                summary.device_health.health_rate * 100.0
            ));
        }
        if recent_critical_alerts {
            issues.push("critical performance alerts in the last hour".to_string());
        }

        HealthReport {
            status: if issues.is_empty() {
                HealthStatus::Healthy
            } else {
                HealthStatus::Warning
            },
            issues,
            pool_usage_percent,
            failed_connections: pool.failed_connections,
            device_health_rate: summary.device_health.health_rate,
            recent_critical_alerts,
        }
    }
}
