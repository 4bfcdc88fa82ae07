//! 追踪初始化、批次标识生成与进程级计数器。

use serde::Serialize;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, fmt};

/// 批次级追踪标识。
#[derive(Debug, Clone)]
pub struct BatchIds {
    pub batch_id: String,
    pub trace_id: String,
}

/// 计数器快照。
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MetricsSnapshot {
    pub sessions_opened: u64,
    pub session_open_failures: u64,
    pub sessions_closed: u64,
    pub pool_hits: u64,
    pub pool_misses: u64,
    pub pool_exhausted: u64,
    pub operations_succeeded: u64,
    pub operations_failed: u64,
    pub operation_latency_ms_total: u64,
    pub operation_latency_ms_count: u64,
    pub device_retries: u64,
    pub batches_started: u64,
    pub batches_completed: u64,
    pub batches_cancelled: u64,
    pub alerts_raised: u64,
    pub concurrency_retunes: u64,
}

impl MetricsSnapshot {
    /// 平均操作耗时（毫秒），无样本时为 0。
    pub fn mean_operation_latency_ms(&self) -> u64 {
        if self.operation_latency_ms_count == 0 {
            0
        } else {
            self.operation_latency_ms_total / self.operation_latency_ms_count
        }
    }
}

/// 进程级计数器。
#[derive(Default)]
pub struct TelemetryMetrics {
    sessions_opened: AtomicU64,
    session_open_failures: AtomicU64,
    sessions_closed: AtomicU64,
    pool_hits: AtomicU64,
    pool_misses: AtomicU64,
    pool_exhausted: AtomicU64,
    operations_succeeded: AtomicU64,
    operations_failed: AtomicU64,
    operation_latency_ms_total: AtomicU64,
    operation_latency_ms_count: AtomicU64,
    device_retries: AtomicU64,
    batches_started: AtomicU64,
    batches_completed: AtomicU64,
    batches_cancelled: AtomicU64,
    alerts_raised: AtomicU64,
    concurrency_retunes: AtomicU64,
}

impl TelemetryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            session_open_failures: self.session_open_failures.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            pool_hits: self.pool_hits.load(Ordering::Relaxed),
            pool_misses: self.pool_misses.load(Ordering::Relaxed),
            pool_exhausted: self.pool_exhausted.load(Ordering::Relaxed),
            operations_succeeded: self.operations_succeeded.load(Ordering::Relaxed),
            operations_failed: self.operations_failed.load(Ordering::Relaxed),
            operation_latency_ms_total: self.operation_latency_ms_total.load(Ordering::Relaxed),
            operation_latency_ms_count: self.operation_latency_ms_count.load(Ordering::Relaxed),
            device_retries: self.device_retries.load(Ordering::Relaxed),
            batches_started: self.batches_started.load(Ordering::Relaxed),
            batches_completed: self.batches_completed.load(Ordering::Relaxed),
            batches_cancelled: self.batches_cancelled.load(Ordering::Relaxed),
            alerts_raised: self.alerts_raised.load(Ordering::Relaxed),
            concurrency_retunes: self.concurrency_retunes.load(Ordering::Relaxed),
        }
    }
}

static METRICS: OnceLock<TelemetryMetrics> = OnceLock::new();

/// 获取全局计数器实例。
pub fn metrics() -> &'static TelemetryMetrics {
    METRICS.get_or_init(TelemetryMetrics::new)
}

/// 初始化 tracing（默认 info），重复调用无副作用。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// 生成新的 batch_id 与 trace_id。
pub fn new_batch_ids() -> BatchIds {
    BatchIds {
        batch_id: uuid::Uuid::new_v4().to_string(),
        trace_id: uuid::Uuid::new_v4().to_string(),
    }
}

/// 生成单设备操作 ID。
pub fn new_operation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn record_session_opened() {
    metrics().sessions_opened.fetch_add(1, Ordering::Relaxed);
}

pub fn record_session_open_failure() {
    metrics()
        .session_open_failures
        .fetch_add(1, Ordering::Relaxed);
}

pub fn record_session_closed() {
    metrics().sessions_closed.fetch_add(1, Ordering::Relaxed);
}

/// 记录连接池命中（复用空闲会话）。
pub fn record_pool_hit() {
    metrics().pool_hits.fetch_add(1, Ordering::Relaxed);
}

/// 记录连接池未命中（新建会话）。
pub fn record_pool_miss() {
    metrics().pool_misses.fetch_add(1, Ordering::Relaxed);
}

pub fn record_pool_exhausted() {
    metrics().pool_exhausted.fetch_add(1, Ordering::Relaxed);
}

/// 记录单次设备操作结果与耗时（毫秒）。
pub fn record_operation(success: bool, latency_ms: u64) {
    let metrics = metrics();
    if success {
        metrics.operations_succeeded.fetch_add(1, Ordering::Relaxed);
    } else {
        metrics.operations_failed.fetch_add(1, Ordering::Relaxed);
    }
    metrics
        .operation_latency_ms_total
        .fetch_add(latency_ms, Ordering::Relaxed);
    metrics
        .operation_latency_ms_count
        .fetch_add(1, Ordering::Relaxed);
}

pub fn record_device_retry() {
    metrics().device_retries.fetch_add(1, Ordering::Relaxed);
}

pub fn record_batch_started() {
    metrics().batches_started.fetch_add(1, Ordering::Relaxed);
}

pub fn record_batch_completed() {
    metrics().batches_completed.fetch_add(1, Ordering::Relaxed);
}

pub fn record_batch_cancelled() {
    metrics().batches_cancelled.fetch_add(1, Ordering::Relaxed);
}

pub fn record_alert_raised() {
    metrics().alerts_raised.fetch_add(1, Ordering::Relaxed);
}

pub fn record_concurrency_retune() {
    metrics()
        .concurrency_retunes
        .fetch_add(1, Ordering::Relaxed);
}
