use crate::executor::{OperationError, OperationExecutor};
use crate::model::{
    BatchConfig, BatchOperationResult, BatchProgress, BatchRequest, BatchStrategy,
    DeviceOperation, OperationRequest, OperationStatus, ProgressCallback,
};
use domain::{DeviceTarget, now_epoch_ms};
use netops_pool::ConcurrencyController;
use netops_telemetry::{
    new_batch_ids, new_operation_id, record_batch_cancelled, record_batch_completed,
    record_batch_started, record_device_retry,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// 批次管理错误。
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("batch {0} not found")]
    NotFound(String),
    #[error("batch {0} already completed")]
    AlreadyCompleted(String),
    #[error("batch driver failed: {0}")]
    Driver(String),
}

impl CoordinatorError {
    pub fn kind(&self) -> &'static str {
        match self {
            CoordinatorError::NotFound(_) => "BatchNotFound",
            CoordinatorError::AlreadyCompleted(_) => "BatchAlreadyCompleted",
            CoordinatorError::Driver(_) => "BatchDriverFailed",
        }
    }
}

/// 已启动批次的句柄：批次 ID、实时进度与完成结果。
pub struct BatchTicket {
    pub batch_id: String,
    pub trace_id: String,
    pub progress: watch::Receiver<BatchProgress>,
    completion: JoinHandle<BatchOperationResult>,
}

impl BatchTicket {
    /// 等待批次结束。
    pub async fn wait(self) -> Result<BatchOperationResult, CoordinatorError> {
        self.completion
            .await
            .map_err(|err| CoordinatorError::Driver(err.to_string()))
    }
}

struct BatchRun {
    batch_id: String,
    trace_id: String,
    strategy: BatchStrategy,
    request: OperationRequest,
    targets: Vec<DeviceTarget>,
    max_retries: u32,
    timeout: Duration,
    started: Instant,
    state: Mutex<BatchOperationResult>,
    progress: watch::Sender<BatchProgress>,
    /// 进度快照在状态锁内入队，由单独的任务按序交给回调。
    callback_queue: Mutex<Option<mpsc::UnboundedSender<BatchProgress>>>,
    callback_task: Mutex<Option<JoinHandle<()>>>,
    cancelled: AtomicBool,
}

impl BatchRun {
    fn lock(&self) -> MutexGuard<'_, BatchOperationResult> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 在锁内修改批次状态；进度有变化时发布快照，并按变化顺序排入回调队列。
    fn update<T>(&self, change: impl FnOnce(&mut BatchOperationResult) -> T) -> T {
        let mut state = self.lock();
        let before = state.progress;
        let value = change(&mut state);
        let after = state.progress;
        if after != before {
            self.progress.send_replace(after);
            let queue = self.callback_queue.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(queue) = queue.as_ref() {
                // 回调任务已退出（回调 panic）时丢弃
                let _ = queue.send(after);
            }
        }
        value
    }

    /// 关闭回调队列，等待回调任务处理完剩余快照。
    async fn flush_callbacks(&self) {
        self.callback_queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let task = self
            .callback_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(task) = task else {
            return;
        };
        if let Err(err) = task.await {
            warn!(
                target: "netops.batch",
                batch_id = %self.batch_id,
                error = %err,
                "batch_progress_callback_failed"
            );
        }
    }

    fn status_of(&self, index: usize) -> Option<OperationStatus> {
        self.lock().status_of(index)
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct CoordinatorInner {
    executor: Arc<dyn OperationExecutor>,
    controller: ConcurrencyController,
    config: BatchConfig,
    batches: Mutex<HashMap<String, Arc<BatchRun>>>,
}

impl CoordinatorInner {
    fn lock_batches(&self) -> MutexGuard<'_, HashMap<String, Arc<BatchRun>>> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn find(&self, batch_id: &str) -> Result<Arc<BatchRun>, CoordinatorError> {
        self.lock_batches()
            .get(batch_id)
            .cloned()
            .ok_or_else(|| CoordinatorError::NotFound(batch_id.to_string()))
    }
}

/// 批量操作协调器：按策略在多台设备上执行同一操作。
#[derive(Clone)]
pub struct BatchCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl BatchCoordinator {
    pub fn new(
        executor: Arc<dyn OperationExecutor>,
        controller: ConcurrencyController,
        config: BatchConfig,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                executor,
                controller,
                config,
                batches: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.inner.config
    }

    fn register(&self, request: BatchRequest) -> Arc<BatchRun> {
        let config = &self.inner.config;
        let ids = new_batch_ids();
        let kind = request.operation.kind();
        let max_retries = request.max_retries.unwrap_or(config.max_retries);
        let operations: Vec<DeviceOperation> = request
            .devices
            .iter()
            .map(|target| DeviceOperation::new(new_operation_id(), target, kind, max_retries))
            .collect();
        let result = BatchOperationResult::new(
            ids.batch_id.clone(),
            ids.trace_id.clone(),
            request.strategy,
            kind,
            operations,
            now_epoch_ms(),
        );
        let (progress, _) = watch::channel(result.progress);
        let (callback_queue, callback_task) = match request.progress_callback {
            Some(callback) => {
                let (queue, snapshots) = mpsc::unbounded_channel();
                let task = tokio::spawn(deliver_progress(snapshots, callback));
                (Some(queue), Some(task))
            }
            None => (None, None),
        };
        let run = Arc::new(BatchRun {
            batch_id: ids.batch_id,
            trace_id: ids.trace_id,
            strategy: request.strategy,
            request: request.operation,
            targets: request.devices,
            max_retries,
            timeout: request.timeout_per_device.unwrap_or(config.timeout_per_device),
            started: Instant::now(),
            state: Mutex::new(result),
            progress,
            callback_queue: Mutex::new(callback_queue),
            callback_task: Mutex::new(callback_task),
            cancelled: AtomicBool::new(false),
        });
        self.inner
            .lock_batches()
            .insert(run.batch_id.clone(), run.clone());
        run
    }

    /// 执行批次并等待结束。
    pub async fn run_batch(&self, request: BatchRequest) -> BatchOperationResult {
        let run = self.register(request);
        drive(self.inner.clone(), run).await
    }

    /// 在后台启动批次，立即返回批次 ID 与进度订阅。
    pub fn start_batch(&self, request: BatchRequest) -> BatchTicket {
        let run = self.register(request);
        let progress = run.progress.subscribe();
        let batch_id = run.batch_id.clone();
        let trace_id = run.trace_id.clone();
        let completion = tokio::spawn(drive(self.inner.clone(), run));
        BatchTicket {
            batch_id,
            trace_id,
            progress,
            completion,
        }
    }

    pub fn get_batch_status(&self, batch_id: &str) -> Result<BatchOperationResult, CoordinatorError> {
        Ok(self.inner.find(batch_id)?.lock().clone())
    }

    /// 取消批次中尚未开始的设备；批次存在即返回 true，重复调用无副作用。
    pub fn cancel_batch(&self, batch_id: &str) -> bool {
        match self.try_cancel_batch(batch_id) {
            Ok(_) | Err(CoordinatorError::AlreadyCompleted(_)) => true,
            Err(_) => false,
        }
    }

    /// 取消批次，返回本次被取消的设备数。
    pub fn try_cancel_batch(&self, batch_id: &str) -> Result<usize, CoordinatorError> {
        let run = self.inner.find(batch_id)?;
        let now = now_epoch_ms();
        let cancelled = run.update(|state| {
            if state.is_completed() {
                None
            } else {
                Some(state.cancel_pending("batch cancelled", now))
            }
        });
        let Some(cancelled) = cancelled else {
            return Err(CoordinatorError::AlreadyCompleted(batch_id.to_string()));
        };
        if !run.cancelled.swap(true, Ordering::SeqCst) {
            record_batch_cancelled();
            info!(
                target: "netops.batch",
                batch_id = %batch_id,
                cancelled_operations = cancelled,
                "batch_cancelled"
            );
        }
        Ok(cancelled)
    }

    /// 登记表中的批次 ID（含保留期内已结束的批次）。
    pub fn active_batches(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock_batches().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// 提前移除已结束的批次；运行中的批次不会被移除。
    pub fn evict_batch(&self, batch_id: &str) -> bool {
        let mut batches = self.inner.lock_batches();
        let finished = batches
            .get(batch_id)
            .is_some_and(|run| run.lock().is_completed());
        if finished {
            batches.remove(batch_id);
        }
        finished
    }
}

async fn drive(inner: Arc<CoordinatorInner>, run: Arc<BatchRun>) -> BatchOperationResult {
    let span = info_span!(
        "batch",
        batch_id = %run.batch_id,
        trace_id = %run.trace_id,
        strategy = %run.strategy,
        operation = %run.request.kind()
    );
    async move {
        record_batch_started();
        info!(
            target: "netops.batch",
            devices = run.targets.len(),
            max_retries = run.max_retries,
            timeout_ms = run.timeout.as_millis() as u64,
            "batch_started"
        );

        if run.strategy.is_sequential() {
            run_sequential(&inner, &run).await;
        } else {
            run_parallel(&inner, &run).await;
        }

        let elapsed = run.started.elapsed();
        let now = now_epoch_ms();
        let result = run.update(|state| {
            state.finalize(elapsed, now);
            state.clone()
        });
        run.flush_callbacks().await;
        record_batch_completed();
        info!(
            target: "netops.batch",
            successful = result.progress.successful,
            failed = result.progress.failed,
            cancelled = result.progress.cancelled,
            duration_ms = elapsed.as_millis() as u64,
            "batch_completed"
        );
        schedule_expiry(&inner, &run.batch_id);
        result
    }
    .instrument(span)
    .await
}

/// 逐台执行；FailFast 在首个失败后取消其余设备。
async fn run_sequential(inner: &Arc<CoordinatorInner>, run: &Arc<BatchRun>) {
    for index in 0..run.targets.len() {
        if run.is_cancelled() {
            break;
        }
        let worker = tokio::spawn(run_device(inner.clone(), run.clone(), index).in_current_span());
        if let Err(err) = worker.await {
            fail_unfinished(inner, run, &[index], &err.to_string());
        }

        if run.strategy == BatchStrategy::FailFast
            && run.status_of(index) == Some(OperationStatus::Failed)
        {
            let failed_device = &run.targets[index].device_id;
            let reason = format!("cancelled after {} failed", failed_device);
            let now = now_epoch_ms();
            let cancelled = run.update(|state| state.cancel_pending(&reason, now));
            warn!(
                target: "netops.batch",
                device_id = %failed_device,
                cancelled_operations = cancelled,
                "batch_fail_fast_triggered"
            );
            break;
        }
    }
}

async fn run_parallel(inner: &Arc<CoordinatorInner>, run: &Arc<BatchRun>) {
    let mut workers = JoinSet::new();
    for index in 0..run.targets.len() {
        workers.spawn(run_device(inner.clone(), run.clone(), index).in_current_span());
    }
    let mut panic_message = None;
    while let Some(joined) = workers.join_next().await {
        if let Err(err) = joined {
            panic_message.get_or_insert_with(|| err.to_string());
        }
    }
    // 全部 worker 已退出，仍未终结的设备只可能来自异常退出的 worker
    if let Some(message) = panic_message {
        let unfinished: Vec<usize> = run
            .lock()
            .operations
            .iter()
            .enumerate()
            .filter(|(_, op)| !op.status.is_terminal())
            .map(|(index, _)| index)
            .collect();
        fail_unfinished(inner, run, &unfinished, &message);
    }
}

/// 按入队顺序调用进度回调，队列关闭后退出。
async fn deliver_progress(
    mut snapshots: mpsc::UnboundedReceiver<BatchProgress>,
    callback: ProgressCallback,
) {
    while let Some(progress) = snapshots.recv().await {
        callback(&progress);
    }
}

fn fail_unfinished(inner: &CoordinatorInner, run: &BatchRun, indexes: &[usize], message: &str) {
    let err = OperationError::WorkerPanicked(message.to_string());
    let now = now_epoch_ms();
    let capacity = inner.config.error_log_capacity;
    run.update(|state| {
        for &index in indexes {
            let started_at_ms = state
                .operations
                .get(index)
                .and_then(|op| op.started_at_ms)
                .unwrap_or(now);
            let elapsed = Duration::from_millis((now - started_at_ms).max(0) as u64);
            state.mark_finished(index, Err(&err), elapsed, now, capacity);
        }
    });
    error!(
        target: "netops.batch",
        devices = indexes.len(),
        error = %message,
        "batch_worker_panicked"
    );
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.min(16))
}

/// 单设备 worker：并发槽位 → Running → 带重试执行 → 终结。
async fn run_device(inner: Arc<CoordinatorInner>, run: Arc<BatchRun>, index: usize) {
    let target = &run.targets[index];
    let capacity = inner.config.error_log_capacity;

    let permit = match inner.controller.acquire().await {
        Ok(permit) => permit,
        Err(err) => {
            let now = now_epoch_ms();
            let err = OperationError::from(err);
            run.update(|state| state.mark_finished(index, Err(&err), Duration::ZERO, now, capacity));
            return;
        }
    };

    let now = now_epoch_ms();
    if !run.update(|state| state.mark_running(index, now)) {
        debug!(
            target: "netops.batch",
            device_id = %target.device_id,
            "device_operation_skipped"
        );
        return;
    }

    let started = Instant::now();
    let mut attempt = 0u32;
    let outcome = loop {
        run.update(|state| state.set_attempt(index, attempt));
        let attempt_started = Instant::now();
        match inner
            .executor
            .execute(target, &run.request, run.timeout)
            .await
        {
            Ok(output) => {
                inner.controller.record_success(attempt_started.elapsed());
                break Ok(output);
            }
            Err(err) => {
                inner.controller.record_error();
                if attempt >= run.max_retries || !err.is_retryable() {
                    break Err(err);
                }
                let delay = backoff_delay(inner.config.backoff_base, attempt);
                record_device_retry();
                warn!(
                    target: "netops.batch",
                    device_id = %target.device_id,
                    device_ip = %target.host,
                    attempt = attempt + 1,
                    max_retries = run.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error_kind = err.kind(),
                    error = %err,
                    "device_operation_retry_scheduled"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    };

    let elapsed = started.elapsed();
    if let Err(err) = &outcome {
        error!(
            target: "netops.batch",
            device_id = %target.device_id,
            device_ip = %target.host,
            attempts = attempt + 1,
            error_kind = err.kind(),
            error = %err,
            "device_operation_exhausted"
        );
    }
    let now = now_epoch_ms();
    run.update(|state| match outcome {
        Ok(output) => state.mark_finished(index, Ok(output), elapsed, now, capacity),
        Err(err) => state.mark_finished(index, Err(&err), elapsed, now, capacity),
    });
    drop(permit);
}

fn schedule_expiry(inner: &Arc<CoordinatorInner>, batch_id: &str) {
    let registry = Arc::downgrade(inner);
    let retention = inner.config.retention;
    let batch_id = batch_id.to_string();
    tokio::spawn(async move {
        tokio::time::sleep(retention).await;
        let Some(inner) = registry.upgrade() else {
            return;
        };
        if inner.lock_batches().remove(&batch_id).is_some() {
            debug!(target: "netops.batch", batch_id = %batch_id, "batch_expired");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_base() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(8));
        assert_eq!(backoff_delay(Duration::ZERO, 5), Duration::ZERO);
    }

    #[test]
    fn coordinator_error_kinds() {
        assert_eq!(CoordinatorError::NotFound("b".into()).kind(), "BatchNotFound");
        assert_eq!(
            CoordinatorError::AlreadyCompleted("b".into()).kind(),
            "BatchAlreadyCompleted"
        );
    }
}
