use domain::OperationKind;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::Duration;

/// 设备画像键：`ip:device_id`，无 ID 时仅为 `ip`。
pub fn device_profile_key(device_ip: &str, device_id: Option<&str>) -> String {
    match device_id {
        Some(id) if !id.is_empty() => format!("{}:{}", device_ip, id),
        _ => device_ip.to_string(),
    }
}

/// 单次设备操作的遥测数据。
#[derive(Debug, Clone, Serialize)]
pub struct OperationMetrics {
    pub operation_id: String,
    pub operation: OperationKind,
    pub device_id: String,
    pub device_ip: String,
    pub started_at_ms: i64,
    pub finished_at_ms: i64,
    pub duration: Duration,
    pub success: bool,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

/// 告警阈值。
#[derive(Debug, Clone)]
pub struct AlertThresholds {
    pub latency_warning_secs: f64,
    pub latency_critical_secs: f64,
    pub error_rate_warning: f64,
    pub error_rate_critical: f64,
    pub consecutive_failures_warning: u32,
    pub consecutive_failures_critical: u32,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            latency_warning_secs: 3.0,
            latency_critical_secs: 10.0,
            error_rate_warning: 0.1,
            error_rate_critical: 0.3,
            consecutive_failures_warning: 3,
            consecutive_failures_critical: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Latency,
    ErrorRate,
    ConsecutiveFailures,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Medium,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Medium => "medium",
            AlertSeverity::Critical => "critical",
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 性能告警事件。
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceAlert {
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub device_ip: String,
    pub device_id: String,
    pub message: String,
    pub timestamp_ms: i64,
    pub metrics: BTreeMap<String, f64>,
}

/// 耗时统计（秒）。
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
}

/// 设备滚动画像。
#[derive(Debug, Clone, Serialize)]
pub struct DevicePerformanceProfile {
    pub device_ip: String,
    pub device_id: String,
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub consecutive_failures: u32,
    #[serde(skip)]
    latencies: VecDeque<Duration>,
    #[serde(skip)]
    latency_window: usize,
    pub error_kinds: BTreeMap<String, u64>,
    pub last_success_ms: Option<i64>,
    pub last_failure_ms: Option<i64>,
    pub reliability_score: f64,
}

impl DevicePerformanceProfile {
    pub(crate) fn new(device_ip: &str, device_id: &str, latency_window: usize) -> Self {
        Self {
            device_ip: device_ip.to_string(),
            device_id: device_id.to_string(),
            total_operations: 0,
            successful_operations: 0,
            failed_operations: 0,
            consecutive_failures: 0,
            latencies: VecDeque::with_capacity(latency_window),
            latency_window: latency_window.max(1),
            error_kinds: BTreeMap::new(),
            last_success_ms: None,
            last_failure_ms: None,
            reliability_score: 1.0,
        }
    }

    pub(crate) fn apply(&mut self, metrics: &OperationMetrics) {
        self.total_operations += 1;
        if metrics.success {
            self.successful_operations += 1;
            self.consecutive_failures = 0;
            self.last_success_ms = Some(metrics.finished_at_ms);
        } else {
            self.failed_operations += 1;
            self.consecutive_failures += 1;
            self.last_failure_ms = Some(metrics.finished_at_ms);
            let kind = metrics
                .error_kind
                .clone()
                .unwrap_or_else(|| "Unknown".to_string());
            *self.error_kinds.entry(kind).or_insert(0) += 1;
        }
        self.latencies.push_back(metrics.duration);
        while self.latencies.len() > self.latency_window {
            self.latencies.pop_front();
        }
        self.reliability_score = self.compute_reliability();
    }

    /// 成功率，取值 [0, 1]；无操作时为 1。
    pub fn success_rate(&self) -> f64 {
        if self.total_operations == 0 {
            1.0
        } else {
            self.successful_operations as f64 / self.total_operations as f64
        }
    }

    pub fn error_rate(&self) -> f64 {
        1.0 - self.success_rate()
    }

    pub fn mean_latency_secs(&self) -> f64 {
        if self.latencies.is_empty() {
            return 0.0;
        }
        self.latencies
            .iter()
            .map(Duration::as_secs_f64)
            .sum::<f64>()
            / self.latencies.len() as f64
    }

    pub fn latency_stats(&self) -> LatencyStats {
        if self.latencies.is_empty() {
            return LatencyStats::default();
        }
        let mut samples: Vec<f64> = self.latencies.iter().map(Duration::as_secs_f64).collect();
        samples.sort_by(f64::total_cmp);
        let mid = samples.len() / 2;
        let median = if samples.len() % 2 == 0 {
            (samples[mid - 1] + samples[mid]) / 2.0
        } else {
            samples[mid]
        };
        LatencyStats {
            mean: self.mean_latency_secs(),
            median,
            min: samples[0],
            max: samples[samples.len() - 1],
        }
    }

    /// 出现次数最多的错误类别。
    pub fn dominant_error(&self) -> Option<(&str, u64)> {
        self.error_kinds
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(kind, count)| (kind.as_str(), *count))
    }

    /// `score > 0.7`、连续失败 < 3、平均耗时 < 10s 同时满足。
    pub fn is_healthy(&self) -> bool {
        self.reliability_score > 0.7
            && self.consecutive_failures < 3
            && self.mean_latency_secs() < 10.0
    }

    fn compute_reliability(&self) -> f64 {
        let failure_penalty = (self.consecutive_failures as f64 * 0.1).min(0.5);
        let mean_latency = self.mean_latency_secs();
        let latency_penalty = if mean_latency > 5.0 {
            ((mean_latency - 5.0) * 0.05).min(0.3)
        } else {
            0.0
        };
        (self.success_rate() - failure_penalty - latency_penalty).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(success: bool, secs: f64) -> OperationMetrics {
        OperationMetrics {
            operation_id: "op".to_string(),
            operation: OperationKind::CommandExecution,
            device_id: "sw1".to_string(),
            device_ip: "10.0.0.1".to_string(),
            started_at_ms: 0,
            finished_at_ms: 1,
            duration: Duration::from_secs_f64(secs),
            success,
            error_kind: (!success).then(|| "OperationTimeout".to_string()),
            error_message: None,
        }
    }

    #[test]
    fn profile_key_includes_device_id_when_present() {
        assert_eq!(device_profile_key("10.0.0.1", Some("sw1")), "10.0.0.1:sw1");
        assert_eq!(device_profile_key("10.0.0.1", None), "10.0.0.1");
        assert_eq!(device_profile_key("10.0.0.1", Some("")), "10.0.0.1");
    }

    #[test]
    fn clean_fast_device_scores_one() {
        let mut profile = DevicePerformanceProfile::new("10.0.0.1", "sw1", 100);
        for _ in 0..10 {
            profile.apply(&metrics(true, 1.5));
        }
        assert_eq!(profile.reliability_score, 1.0);
        assert!(profile.is_healthy());
    }

    #[test]
    fn five_consecutive_failures_cost_at_least_half() {
        let mut profile = DevicePerformanceProfile::new("10.0.0.1", "sw1", 100);
        for _ in 0..20 {
            profile.apply(&metrics(true, 1.0));
        }
        let baseline = profile.reliability_score;
        for _ in 0..5 {
            profile.apply(&metrics(false, 1.0));
        }
        assert!(baseline - profile.reliability_score >= 0.5);
        assert!(!profile.is_healthy());
        assert_eq!(profile.dominant_error(), Some(("OperationTimeout", 5)));
    }

    #[test]
    fn slow_device_pays_latency_penalty() {
        let mut profile = DevicePerformanceProfile::new("10.0.0.1", "sw1", 100);
        profile.apply(&metrics(true, 9.0));
        assert!((profile.reliability_score - 0.8).abs() < 1e-9);
        profile.apply(&metrics(true, 30.0));
        assert!((profile.reliability_score - 0.7).abs() < 1e-9);
    }

    #[test]
    fn score_stays_in_unit_interval() {
        let mut profile = DevicePerformanceProfile::new("10.0.0.1", "sw1", 100);
        for round in 0..50 {
            profile.apply(&metrics(round % 3 == 0, (round % 7) as f64 * 4.0));
            assert!((0.0..=1.0).contains(&profile.reliability_score));
        }
    }

    #[test]
    fn latency_window_is_bounded() {
        let mut profile = DevicePerformanceProfile::new("10.0.0.1", "sw1", 3);
        for secs in [10.0, 1.0, 2.0, 3.0] {
            profile.apply(&metrics(true, secs));
        }
        let stats = profile.latency_stats();
        assert_eq!(stats.max, 3.0);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.median, 2.0);
        assert_eq!(profile.total_operations, 4);
    }
}
