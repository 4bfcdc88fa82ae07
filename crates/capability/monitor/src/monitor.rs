use crate::model::{
    AlertKind, AlertSeverity, AlertThresholds, DevicePerformanceProfile, LatencyStats,
    OperationMetrics, PerformanceAlert, device_profile_key,
};
use domain::now_epoch_ms;
use netops_telemetry::record_alert_raised;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const HOUR_MS: i64 = 3_600_000;

/// 性能监控参数。
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub history_size: usize,
    pub alert_capacity: usize,
    /// 单设备耗时窗口。
    pub latency_window: usize,
    pub insight_interval: Duration,
    pub thresholds: AlertThresholds,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            history_size: 10_000,
            alert_capacity: 1000,
            latency_window: 100,
            insight_interval: Duration::from_secs(60),
            thresholds: AlertThresholds::default(),
        }
    }
}

/// 全局统计（最近一小时窗口）。
#[derive(Debug, Clone, Default, Serialize)]
pub struct GlobalStats {
    pub total_operations: u64,
    pub recent_operations: usize,
    pub recent_success_rate: f64,
    pub recent_mean_latency_secs: f64,
    pub operations_per_minute: f64,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceHealth {
    pub total_devices: usize,
    pub healthy_devices: usize,
    pub unhealthy_devices: usize,
    /// 健康设备占比，取值 [0, 1]；无设备时为 1。
    pub health_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AlertBreakdown {
    pub total: usize,
    pub critical: usize,
    pub medium: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceTrends {
    pub recent_operations: usize,
    pub success_rate: f64,
    pub mean_latency_secs: f64,
}

/// 全网性能汇总。
#[derive(Debug, Clone, Default, Serialize)]
pub struct FleetSummary {
    pub global: GlobalStats,
    pub device_health: DeviceHealth,
    pub recent_alerts: AlertBreakdown,
    pub trends: PerformanceTrends,
}

/// 单设备详情。
#[derive(Debug, Clone, Serialize)]
pub struct DeviceDetails {
    pub profile: DevicePerformanceProfile,
    pub is_healthy: bool,
    pub success_rate: f64,
    pub latency: LatencyStats,
    pub recommendations: Vec<String>,
}

/// 周期洞察结果。
#[derive(Debug, Clone, Default, Serialize)]
pub struct FleetInsights {
    /// 可靠性最低的 5 台设备。
    pub worst_devices: Vec<DevicePerformanceProfile>,
    /// 可靠性低于 0.5。
    pub unreliable_devices: Vec<String>,
    /// 平均耗时超过 5s 且操作数超过 10。
    pub slow_devices: Vec<String>,
}

struct MonitorState {
    history: VecDeque<OperationMetrics>,
    profiles: HashMap<String, DevicePerformanceProfile>,
    alerts: VecDeque<PerformanceAlert>,
    global: GlobalStats,
}

struct BackgroundTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct MonitorInner {
    config: MonitorConfig,
    state: Mutex<MonitorState>,
    task: Mutex<Option<BackgroundTask>>,
}

impl MonitorInner {
    fn lock_state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 设备操作性能监控器。
#[derive(Clone)]
pub struct PerformanceMonitor {
    inner: Arc<MonitorInner>,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

impl PerformanceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                state: Mutex::new(MonitorState {
                    history: VecDeque::with_capacity(config.history_size.min(1024)),
                    profiles: HashMap::new(),
                    alerts: VecDeque::with_capacity(config.alert_capacity.min(1024)),
                    global: GlobalStats::default(),
                }),
                task: Mutex::new(None),
                config,
            }),
        }
    }

    /// 记录一次操作结果，返回本次触发的告警。
    pub fn record_operation(&self, metrics: OperationMetrics) -> Vec<PerformanceAlert> {
        let config = &self.inner.config;
        let key = device_profile_key(&metrics.device_ip, Some(&metrics.device_id));
        let mut state = self.inner.lock_state();

        let profile = state.profiles.entry(key).or_insert_with(|| {
            DevicePerformanceProfile::new(
                &metrics.device_ip,
                &metrics.device_id,
                config.latency_window,
            )
        });
        profile.apply(&metrics);
        let alerts = evaluate_alerts(&config.thresholds, profile, &metrics);

        state.global.total_operations += 1;
        state.history.push_back(metrics);
        while state.history.len() > config.history_size.max(1) {
            state.history.pop_front();
        }
        for alert in &alerts {
            state.alerts.push_back(alert.clone());
            while state.alerts.len() > config.alert_capacity.max(1) {
                state.alerts.pop_front();
            }
        }
        drop(state);

        for alert in &alerts {
            record_alert_raised();
            warn!(
                target: "netops.monitor",
                kind = ?alert.kind,
                severity = %alert.severity,
                device_ip = %alert.device_ip,
                device_id = %alert.device_id,
                message = %alert.message,
                "performance_alert"
            );
        }
        alerts
    }

    /// 按最近一小时的历史刷新全局统计。
    pub fn refresh_global_stats(&self) -> GlobalStats {
        let now = now_epoch_ms();
        let mut state = self.inner.lock_state();
        let trends = recent_trends(&state.history, now);
        let oldest = state
            .history
            .iter()
            .filter(|op| now - op.finished_at_ms <= HOUR_MS)
            .map(|op| op.finished_at_ms)
            .min();
        let span_minutes = oldest
            .map(|oldest| ((now - oldest) as f64 / 60_000.0).max(1.0))
            .unwrap_or(1.0);
        state.global.recent_operations = trends.recent_operations;
        state.global.recent_success_rate = trends.success_rate;
        state.global.recent_mean_latency_secs = trends.mean_latency_secs;
        state.global.operations_per_minute = trends.recent_operations as f64 / span_minutes;
        state.global.updated_at_ms = now;
        state.global.clone()
    }

    pub fn fleet_summary(&self) -> FleetSummary {
        let now = now_epoch_ms();
        let state = self.inner.lock_state();

        let total_devices = state.profiles.len();
        let healthy_devices = state
            .profiles
            .values()
            .filter(|profile| profile.is_healthy())
            .count();
        let device_health = DeviceHealth {
            total_devices,
            healthy_devices,
            unhealthy_devices: total_devices - healthy_devices,
            health_rate: if total_devices == 0 {
                1.0
            } else {
                healthy_devices as f64 / total_devices as f64
            },
        };

        let mut recent_alerts = AlertBreakdown::default();
        for alert in state
            .alerts
            .iter()
            .filter(|alert| now - alert.timestamp_ms <= HOUR_MS)
        {
            recent_alerts.total += 1;
            match alert.severity {
                AlertSeverity::Critical => recent_alerts.critical += 1,
                AlertSeverity::Medium => recent_alerts.medium += 1,
            }
        }

        FleetSummary {
            global: state.global.clone(),
            device_health,
            recent_alerts,
            trends: recent_trends(&state.history, now),
        }
    }

    pub fn device_profile(
        &self,
        device_ip: &str,
        device_id: Option<&str>,
    ) -> Option<DevicePerformanceProfile> {
        self.inner
            .lock_state()
            .profiles
            .get(&device_profile_key(device_ip, device_id))
            .cloned()
    }

    pub fn device_details(&self, device_ip: &str, device_id: Option<&str>) -> Option<DeviceDetails> {
        let profile = self.device_profile(device_ip, device_id)?;
        Some(DeviceDetails {
            is_healthy: profile.is_healthy(),
            success_rate: profile.success_rate(),
            latency: profile.latency_stats(),
            recommendations: recommendations_for(Some(&profile)),
            profile,
        })
    }

    /// 基于设备画像给出排查建议。
    pub fn device_recommendations(&self, device_ip: &str, device_id: Option<&str>) -> Vec<String> {
        recommendations_for(self.device_profile(device_ip, device_id).as_ref())
    }

    /// 最近的告警（新的在前）。
    pub fn alerts(&self, limit: usize) -> Vec<PerformanceAlert> {
        self.inner
            .lock_state()
            .alerts
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// 是否在最近一小时内出现过严重告警。
    pub fn has_recent_critical_alert(&self) -> bool {
        let now = now_epoch_ms();
        self.inner.lock_state().alerts.iter().any(|alert| {
            alert.severity == AlertSeverity::Critical && now - alert.timestamp_ms <= HOUR_MS
        })
    }

    pub fn insights(&self) -> FleetInsights {
        let state = self.inner.lock_state();
        let mut ranked: Vec<&DevicePerformanceProfile> = state.profiles.values().collect();
        ranked.sort_by(|a, b| a.reliability_score.total_cmp(&b.reliability_score));
        FleetInsights {
            worst_devices: ranked.iter().take(5).map(|profile| (*profile).clone()).collect(),
            unreliable_devices: ranked
                .iter()
                .filter(|profile| profile.reliability_score < 0.5)
                .map(|profile| device_profile_key(&profile.device_ip, Some(&profile.device_id)))
                .collect(),
            slow_devices: ranked
                .iter()
                .filter(|profile| profile.mean_latency_secs() > 5.0 && profile.total_operations > 10)
                .map(|profile| device_profile_key(&profile.device_ip, Some(&profile.device_id)))
                .collect(),
        }
    }

    /// 刷新全局统计并输出洞察日志。
    pub fn refresh_insights(&self) -> FleetInsights {
        let global = self.refresh_global_stats();
        let insights = self.insights();
        info!(
            target: "netops.monitor",
            recent_operations = global.recent_operations,
            success_rate = global.recent_success_rate,
            mean_latency_secs = global.recent_mean_latency_secs,
            operations_per_minute = global.operations_per_minute,
            "monitor_global_stats"
        );
        if let Some(worst) = insights.worst_devices.first() {
            if worst.reliability_score < 0.5 {
                warn!(
                    target: "netops.monitor",
                    device_ip = %worst.device_ip,
                    device_id = %worst.device_id,
                    reliability_score = worst.reliability_score,
                    consecutive_failures = worst.consecutive_failures,
                    mean_latency_secs = worst.mean_latency_secs(),
                    "monitor_unreliable_device"
                );
            }
        }
        if !insights.slow_devices.is_empty() {
            info!(
                target: "netops.monitor",
                count = insights.slow_devices.len(),
                devices = ?insights.slow_devices.iter().take(3).collect::<Vec<_>>(),
                "monitor_slow_devices"
            );
        }
        insights
    }

    /// 启动周期洞察任务（重复调用无副作用）。
    pub fn start(&self) {
        let mut task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }
        let (shutdown, mut receiver) = watch::channel(false);
        let monitor = Arc::downgrade(&self.inner);
        let period = self.inner.config.insight_interval.max(Duration::from_millis(10));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = receiver.changed() => break,
                }
                let Some(inner) = monitor.upgrade() else {
                    break;
                };
                PerformanceMonitor { inner }.refresh_insights();
            }
        });
        *task = Some(BackgroundTask { shutdown, handle });
        info!(target: "netops.monitor", "monitor_started");
    }

    /// 停止周期任务；返回之前是否在运行。
    pub async fn stop(&self) -> bool {
        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(task) = task else {
            return false;
        };
        let _ = task.shutdown.send(true);
        if let Err(err) = task.handle.await {
            warn!(target: "netops.monitor", error = %err, "monitor_join_failed");
        }
        info!(target: "netops.monitor", "monitor_stopped");
        true
    }
}

fn recent_trends(history: &VecDeque<OperationMetrics>, now: i64) -> PerformanceTrends {
    let mut trends = PerformanceTrends::default();
    let mut successes = 0usize;
    let mut latency_total = 0.0;
    for op in history.iter().filter(|op| now - op.finished_at_ms <= HOUR_MS) {
        trends.recent_operations += 1;
        if op.success {
            successes += 1;
        }
        latency_total += op.duration.as_secs_f64();
    }
    if trends.recent_operations > 0 {
        trends.success_rate = successes as f64 / trends.recent_operations as f64;
        trends.mean_latency_secs = latency_total / trends.recent_operations as f64;
    }
    trends
}

fn evaluate_alerts(
    thresholds: &AlertThresholds,
    profile: &DevicePerformanceProfile,
    metrics: &OperationMetrics,
) -> Vec<PerformanceAlert> {
    let now = now_epoch_ms();
    let alert = |kind, severity, message: String, values: [(&str, f64); 2]| PerformanceAlert {
        kind,
        severity,
        device_ip: metrics.device_ip.clone(),
        device_id: metrics.device_id.clone(),
        message,
        timestamp_ms: now,
        metrics: values
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect::<BTreeMap<_, _>>(),
    };
    let mut alerts = Vec::new();

    let latency = metrics.duration.as_secs_f64();
    let latency_level = if latency > thresholds.latency_critical_secs {
        Some((AlertSeverity::Critical, thresholds.latency_critical_secs))
    } else if latency > thresholds.latency_warning_secs {
        Some((AlertSeverity::Medium, thresholds.latency_warning_secs))
    } else {
        None
    };
    if let Some((severity, threshold)) = latency_level {
        alerts.push(alert(
            AlertKind::Latency,
            severity,
            format!(
                "{} response time {:.2}s exceeds {:.1}s",
                metrics.device_ip, latency, threshold
            ),
            [("response_time", latency), ("threshold", threshold)],
        ));
    }

    let error_rate = profile.error_rate();
    let error_level = if error_rate > thresholds.error_rate_critical {
        Some((AlertSeverity::Critical, thresholds.error_rate_critical))
    } else if error_rate > thresholds.error_rate_warning {
        Some((AlertSeverity::Medium, thresholds.error_rate_warning))
    } else {
        None
    };
    if let Some((severity, threshold)) = error_level {
        alerts.push(alert(
            AlertKind::ErrorRate,
            severity,
            format!(
                "{} error rate {:.1}% exceeds {:.1}%",
                metrics.device_ip,
                error_rate * 100.0,
                threshold * 100.0
            ),
            [("error_rate", error_rate), ("threshold", threshold)],
        ));
    }

    let failures = profile.consecutive_failures;
    let failure_level = if failures >= thresholds.consecutive_failures_critical {
        Some((AlertSeverity::Critical, thresholds.consecutive_failures_critical))
    } else if failures >= thresholds.consecutive_failures_warning {
        Some((AlertSeverity::Medium, thresholds.consecutive_failures_warning))
    } else {
        None
    };
    if let Some((severity, threshold)) = failure_level {
        alerts.push(alert(
            AlertKind::ConsecutiveFailures,
            severity,
            format!("{} failed {} times in a row", metrics.device_ip, failures),
            [
                ("consecutive_failures", failures as f64),
                ("threshold", threshold as f64),
            ],
        ));
    }

    alerts
}

fn recommendations_for(profile: Option<&DevicePerformanceProfile>) -> Vec<String> {
    let Some(profile) = profile else {
        return vec!["no performance data recorded for this device yet".to_string()];
    };
    let mut recommendations = Vec::new();
    let mean_latency = profile.mean_latency_secs();
    if mean_latency > 5.0 {
        recommendations.push(format!(
            "slow responses ({:.2}s on average): check network path and device CPU load",
            mean_latency
        ));
    }
    if profile.reliability_score < 0.7 {
        recommendations.push(format!(
            "low reliability ({:.2}): check device state and link stability",
            profile.reliability_score
        ));
    }
    if let Some((kind, count)) = profile.dominant_error() {
        recommendations.push(format!(
            "most frequent error is {} ({} times): troubleshoot that failure first",
            kind, count
        ));
    }
    if profile.consecutive_failures > 0 {
        recommendations.push(format!(
            "{} consecutive failures: verify device reachability now",
            profile.consecutive_failures
        ));
    }
    if recommendations.is_empty() {
        recommendations.push("device is performing well, no action needed".to_string());
    }
    recommendations
}
