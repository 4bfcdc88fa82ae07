use crate::executor::OperationError;
use domain::{DeviceTarget, OperationKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// 批量操作参数。
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub max_retries: u32,
    pub timeout_per_device: Duration,
    /// 批次结束后在登记表中保留的时长。
    pub retention: Duration,
    /// 重试退避基数：第 n 次重试前等待 `backoff_base * 2^n`。
    pub backoff_base: Duration,
    /// 批次错误日志最多保留的条数。
    pub error_log_capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout_per_device: Duration::from_secs(300),
            retention: Duration::from_secs(300),
            backoff_base: Duration::from_secs(1),
            error_log_capacity: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Success | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }
}

/// 批量执行策略。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStrategy {
    #[default]
    Parallel,
    Sequential,
    /// 顺序执行，首个失败后取消其余设备。
    FailFast,
    /// 并行执行且从不提前结束。
    ContinueOnError,
}

impl BatchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStrategy::Parallel => "parallel",
            BatchStrategy::Sequential => "sequential",
            BatchStrategy::FailFast => "fail_fast",
            BatchStrategy::ContinueOnError => "continue_on_error",
        }
    }

    /// 是否严格按输入顺序逐台执行。
    pub fn is_sequential(&self) -> bool {
        matches!(self, BatchStrategy::Sequential | BatchStrategy::FailFast)
    }
}

impl fmt::Display for BatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 操作描述：类型 + 参数。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationRequest {
    CommandExecution { commands: Vec<String> },
    ConfigDeployment { lines: Vec<String> },
    ConfigBackup,
    ConnectivityTest,
    DeviceInfoCollection,
}

impl OperationRequest {
    pub fn command(command: impl Into<String>) -> Self {
        OperationRequest::CommandExecution {
            commands: vec![command.into()],
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            OperationRequest::CommandExecution { .. } => OperationKind::CommandExecution,
            OperationRequest::ConfigDeployment { .. } => OperationKind::ConfigDeployment,
            OperationRequest::ConfigBackup => OperationKind::ConfigBackup,
            OperationRequest::ConnectivityTest => OperationKind::ConnectivityTest,
            OperationRequest::DeviceInfoCollection => OperationKind::DeviceInfoCollection,
        }
    }
}

/// 进度回调；每次计数变化后调用。
pub type ProgressCallback = Arc<dyn Fn(&BatchProgress) + Send + Sync>;

/// 发起批量操作的请求。
#[derive(Clone)]
pub struct BatchRequest {
    pub devices: Vec<DeviceTarget>,
    pub operation: OperationRequest,
    pub strategy: BatchStrategy,
    /// 未设置时使用 [`BatchConfig::max_retries`]。
    pub max_retries: Option<u32>,
    pub timeout_per_device: Option<Duration>,
    pub progress_callback: Option<ProgressCallback>,
}

impl BatchRequest {
    pub fn new(devices: Vec<DeviceTarget>, operation: OperationRequest) -> Self {
        Self {
            devices,
            operation,
            strategy: BatchStrategy::default(),
            max_retries: None,
            timeout_per_device: None,
            progress_callback: None,
        }
    }

    pub fn with_strategy(mut self, strategy: BatchStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_per_device = Some(timeout);
        self
    }

    pub fn with_progress_callback(
        mut self,
        callback: impl Fn(&BatchProgress) + Send + Sync + 'static,
    ) -> Self {
        self.progress_callback = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for BatchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchRequest")
            .field("devices", &self.devices.len())
            .field("operation", &self.operation)
            .field("strategy", &self.strategy)
            .field("max_retries", &self.max_retries)
            .field("timeout_per_device", &self.timeout_per_device)
            .finish()
    }
}

/// 单台设备上的一次批量工作。
#[derive(Debug, Clone, Serialize)]
pub struct DeviceOperation {
    pub operation_id: String,
    pub device_id: String,
    pub device_ip: String,
    pub operation: OperationKind,
    pub status: OperationStatus,
    pub started_at_ms: Option<i64>,
    pub finished_at_ms: Option<i64>,
    pub duration: Option<Duration>,
    /// 已重试次数（首次执行为 0）。
    pub retry_count: u32,
    pub max_retries: u32,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    pub output: Option<serde_json::Value>,
}

impl DeviceOperation {
    pub fn new(
        operation_id: String,
        target: &DeviceTarget,
        operation: OperationKind,
        max_retries: u32,
    ) -> Self {
        Self {
            operation_id,
            device_id: target.device_id.clone(),
            device_ip: target.host.clone(),
            operation,
            status: OperationStatus::Pending,
            started_at_ms: None,
            finished_at_ms: None,
            duration: None,
            retry_count: 0,
            max_retries,
            error: None,
            error_kind: None,
            output: None,
        }
    }
}

/// 批次进度计数。
///
/// 任意时刻 `pending + running + completed == total`，
/// `successful + failed == completed`；取消的设备计入 completed 与 failed，并单独计入 cancelled。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    pub total: usize,
    pub completed: usize,
    pub successful: usize,
    pub failed: usize,
    pub pending: usize,
    pub running: usize,
    pub cancelled: usize,
}

impl BatchProgress {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            pending: total,
            ..Self::default()
        }
    }

    /// 完成百分比。
    pub fn completion_percentage(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.completed as f64 / self.total as f64 * 100.0
        }
    }

    /// 已完成设备中的成功百分比。
    pub fn success_rate(&self) -> f64 {
        if self.completed == 0 {
            0.0
        } else {
            self.successful as f64 / self.completed as f64 * 100.0
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.pending + self.running + self.completed == self.total
            && self.successful + self.failed == self.completed
    }
}

/// 批次错误日志条目。
#[derive(Debug, Clone, Serialize)]
pub struct BatchErrorEntry {
    pub device_id: String,
    pub device_ip: String,
    pub error: String,
    pub error_kind: String,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceTiming {
    pub device_id: String,
    pub device_ip: String,
    pub duration: Duration,
}

/// 批次摘要。
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub total_devices: usize,
    pub successful_devices: usize,
    pub failed_devices: usize,
    pub cancelled_devices: usize,
    pub success_rate: f64,
    pub total_duration: Duration,
    pub average_duration_per_device: Duration,
    pub fastest_device: Option<DeviceTiming>,
    pub slowest_device: Option<DeviceTiming>,
    /// 按错误类别统计失败设备数（含 `Cancelled`）。
    pub error_breakdown: BTreeMap<String, usize>,
}

/// 一次批量运行的完整状态。
#[derive(Debug, Clone, Serialize)]
pub struct BatchOperationResult {
    pub batch_id: String,
    pub trace_id: String,
    pub strategy: BatchStrategy,
    pub operation: OperationKind,
    pub progress: BatchProgress,
    pub operations: Vec<DeviceOperation>,
    /// 结束后生成。
    pub summary: Option<BatchSummary>,
    /// 最近的错误（容量受限）。
    pub errors: Vec<BatchErrorEntry>,
    pub started_at_ms: i64,
    pub finished_at_ms: Option<i64>,
    pub total_duration: Option<Duration>,
}

impl BatchOperationResult {
    pub fn new(
        batch_id: String,
        trace_id: String,
        strategy: BatchStrategy,
        operation: OperationKind,
        operations: Vec<DeviceOperation>,
        started_at_ms: i64,
    ) -> Self {
        Self {
            batch_id,
            trace_id,
            strategy,
            operation,
            progress: BatchProgress::new(operations.len()),
            operations,
            summary: None,
            errors: Vec::new(),
            started_at_ms,
            finished_at_ms: None,
            total_duration: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.finished_at_ms.is_some()
    }

    pub fn is_successful(&self) -> bool {
        self.is_completed() && self.progress.failed == 0
    }

    pub fn status_of(&self, index: usize) -> Option<OperationStatus> {
        self.operations.get(index).map(|op| op.status)
    }

    /// Pending → Running；设备已被取消或不存在时返回 false。
    pub(crate) fn mark_running(&mut self, index: usize, now_ms: i64) -> bool {
        let Some(op) = self.operations.get_mut(index) else {
            return false;
        };
        if op.status != OperationStatus::Pending {
            return false;
        }
        op.status = OperationStatus::Running;
        op.started_at_ms = Some(now_ms);
        self.progress.pending -= 1;
        self.progress.running += 1;
        true
    }

    pub(crate) fn set_attempt(&mut self, index: usize, attempt: u32) {
        if let Some(op) = self.operations.get_mut(index) {
            op.retry_count = attempt;
        }
    }

    /// 记录设备最终结果；已终结的设备不再变化。
    pub(crate) fn mark_finished(
        &mut self,
        index: usize,
        outcome: Result<serde_json::Value, &OperationError>,
        elapsed: Duration,
        now_ms: i64,
        error_capacity: usize,
    ) {
        let Some(op) = self.operations.get_mut(index) else {
            return;
        };
        match op.status {
            OperationStatus::Pending => self.progress.pending -= 1,
            OperationStatus::Running => self.progress.running -= 1,
            _ => return,
        }
        op.finished_at_ms = Some(now_ms);
        op.duration = Some(elapsed);
        self.progress.completed += 1;
        match outcome {
            Ok(output) => {
                op.status = OperationStatus::Success;
                op.output = Some(output);
                op.error = None;
                op.error_kind = None;
                self.progress.successful += 1;
            }
            Err(err) => {
                op.status = OperationStatus::Failed;
                op.error = Some(err.to_string());
                op.error_kind = Some(err.kind().to_string());
                self.progress.failed += 1;
                let entry = BatchErrorEntry {
                    device_id: op.device_id.clone(),
                    device_ip: op.device_ip.clone(),
                    error: err.to_string(),
                    error_kind: err.kind().to_string(),
                    timestamp_ms: now_ms,
                };
                self.errors.push(entry);
                if self.errors.len() > error_capacity.max(1) {
                    let overflow = self.errors.len() - error_capacity.max(1);
                    self.errors.drain(..overflow);
                }
            }
        }
    }

    /// 把所有 Pending 设备标记为 Cancelled，返回数量。
    pub(crate) fn cancel_pending(&mut self, reason: &str, now_ms: i64) -> usize {
        let mut cancelled = 0;
        for op in self
            .operations
            .iter_mut()
            .filter(|op| op.status == OperationStatus::Pending)
        {
            op.status = OperationStatus::Cancelled;
            op.finished_at_ms = Some(now_ms);
            op.error = Some(reason.to_string());
            op.error_kind = Some(OperationError::Cancelled.kind().to_string());
            cancelled += 1;
        }
        self.progress.pending -= cancelled;
        self.progress.completed += cancelled;
        self.progress.failed += cancelled;
        self.progress.cancelled += cancelled;
        cancelled
    }

    pub(crate) fn finalize(&mut self, total_duration: Duration, now_ms: i64) {
        self.finished_at_ms = Some(now_ms);
        self.total_duration = Some(total_duration);
        self.summary = Some(self.build_summary(total_duration));
    }

    fn build_summary(&self, total_duration: Duration) -> BatchSummary {
        let timed: Vec<&DeviceOperation> = self
            .operations
            .iter()
            .filter(|op| op.duration.is_some())
            .collect();
        let timing = |op: &DeviceOperation| DeviceTiming {
            device_id: op.device_id.clone(),
            device_ip: op.device_ip.clone(),
            duration: op.duration.unwrap_or_default(),
        };
        let average_duration_per_device = if timed.is_empty() {
            Duration::ZERO
        } else {
            timed
                .iter()
                .map(|op| op.duration.unwrap_or_default())
                .sum::<Duration>()
                / timed.len() as u32
        };

        let mut error_breakdown = BTreeMap::new();
        for kind in self
            .operations
            .iter()
            .filter(|op| matches!(op.status, OperationStatus::Failed | OperationStatus::Cancelled))
            .map(|op| op.error_kind.as_deref().unwrap_or("Unknown"))
        {
            *error_breakdown.entry(kind.to_string()).or_insert(0) += 1;
        }

        BatchSummary {
            total_devices: self.progress.total,
            successful_devices: self.progress.successful,
            failed_devices: self.progress.failed,
            cancelled_devices: self.progress.cancelled,
            success_rate: self.progress.success_rate(),
            total_duration,
            average_duration_per_device,
            fastest_device: timed
                .iter()
                .min_by_key(|op| op.duration)
                .map(|op| timing(*op)),
            slowest_device: timed
                .iter()
                .max_by_key(|op| op.duration)
                .map(|op| timing(*op)),
            error_breakdown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(devices: usize) -> BatchOperationResult {
        let operations = (0..devices)
            .map(|index| {
                let target = DeviceTarget::new(
                    format!("sw{}", index),
                    format!("10.0.0.{}", index + 1),
                    "admin",
                    "secret",
                );
                DeviceOperation::new(format!("op{}", index), &target, OperationKind::ConfigBackup, 2)
            })
            .collect();
        BatchOperationResult::new(
            "batch".to_string(),
            "trace".to_string(),
            BatchStrategy::Parallel,
            OperationKind::ConfigBackup,
            operations,
            0,
        )
    }

    #[test]
    fn transitions_keep_progress_consistent() {
        let mut result = batch(4);
        assert!(result.progress.is_consistent());

        assert!(result.mark_running(0, 1));
        assert!(!result.mark_running(0, 1));
        assert!(result.progress.is_consistent());
        result.mark_finished(0, Ok(serde_json::json!({})), Duration::from_millis(30), 2, 10);
        assert!(result.progress.is_consistent());

        assert!(result.mark_running(1, 3));
        let err = OperationError::Timeout(Duration::from_secs(1));
        result.mark_finished(1, Err(&err), Duration::from_millis(90), 4, 10);
        // 已终结的设备不再变化
        result.mark_finished(1, Ok(serde_json::json!({})), Duration::ZERO, 5, 10);
        assert_eq!(result.status_of(1), Some(OperationStatus::Failed));

        assert_eq!(result.cancel_pending("stop", 6), 2);
        assert_eq!(result.cancel_pending("stop", 7), 0);
        assert!(!result.mark_running(2, 8));

        let progress = result.progress;
        assert!(progress.is_consistent());
        assert_eq!(progress.completed, 4);
        assert_eq!(progress.successful, 1);
        assert_eq!(progress.failed, 3);
        assert_eq!(progress.cancelled, 2);
        assert_eq!(progress.completion_percentage(), 100.0);
        assert_eq!(progress.success_rate(), 25.0);
    }

    #[test]
    fn summary_reports_breakdown_and_extremes() {
        let mut result = batch(3);
        for index in 0..3 {
            result.mark_running(index, 0);
        }
        result.mark_finished(0, Ok(serde_json::json!({})), Duration::from_millis(100), 1, 10);
        result.mark_finished(1, Ok(serde_json::json!({})), Duration::from_millis(300), 1, 10);
        let err = OperationError::Failed("rejected".to_string());
        result.mark_finished(2, Err(&err), Duration::from_millis(200), 1, 10);
        result.finalize(Duration::from_millis(400), 2);

        let summary = result.summary.as_ref().expect("summary");
        assert_eq!(summary.average_duration_per_device, Duration::from_millis(200));
        assert_eq!(
            summary.fastest_device.as_ref().map(|timing| timing.device_id.as_str()),
            Some("sw0")
        );
        assert_eq!(
            summary.slowest_device.as_ref().map(|timing| timing.device_id.as_str()),
            Some("sw1")
        );
        assert_eq!(summary.error_breakdown.get("OperationFailed"), Some(&1));
        assert!(result.is_completed());
        assert!(!result.is_successful());
    }

    #[test]
    fn error_log_is_capped() {
        let mut result = batch(5);
        let err = OperationError::Failed("rejected".to_string());
        for index in 0..5 {
            result.mark_running(index, 0);
            result.mark_finished(index, Err(&err), Duration::ZERO, index as i64, 2);
        }
        assert_eq!(result.errors.len(), 2);
        assert_eq!(result.errors[0].device_id, "sw3");
        assert_eq!(result.errors[1].device_id, "sw4");
    }

    #[test]
    fn request_serializes_with_type_tag() {
        let request = OperationRequest::command("show clock");
        let json = serde_json::to_value(&request).expect("serialize");
        assert_eq!(json["type"], "command_execution");
        assert_eq!(json["commands"][0], "show clock");
        let backup: OperationRequest =
            serde_json::from_str(r#"{"type":"config_backup"}"#).expect("parse");
        assert_eq!(backup.kind(), OperationKind::ConfigBackup);
    }
}
