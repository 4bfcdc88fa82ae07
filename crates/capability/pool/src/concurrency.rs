use crate::error::PoolError;
use netops_telemetry::record_concurrency_retune;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::info;

/// 并发控制参数。
#[derive(Debug, Clone)]
pub struct ConcurrencyConfig {
    pub initial_limit: usize,
    pub min_limit: usize,
    pub max_limit: usize,
    pub retune_interval: Duration,
    /// 耗时滑动窗口大小。
    pub latency_window: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            initial_limit: 20,
            min_limit: 5,
            max_limit: 100,
            retune_interval: Duration::from_secs(30),
            latency_window: 100,
        }
    }
}

/// 并发控制快照。
#[derive(Debug, Clone, Serialize)]
pub struct ConcurrencySnapshot {
    pub current_limit: usize,
    pub min_limit: usize,
    pub max_limit: usize,
    pub available_permits: usize,
    pub in_flight: usize,
    pub recent_successes: u64,
    pub recent_errors: u64,
    pub mean_latency_ms: u64,
}

/// 根据错误率与平均耗时计算新的并发上限。
///
/// - 错误率 > 10%：收缩 20%
/// - 错误率 < 2% 且平均耗时 < 2s：扩张 20%
/// - 平均耗时 > 5s：收缩 10%
///
/// 收缩至少减 1、扩张至少加 1，结果限定在 `[min_limit, max_limit]`。
pub fn compute_limit(
    error_rate: f64,
    mean_latency_secs: f64,
    current: usize,
    min_limit: usize,
    max_limit: usize,
) -> usize {
    let shrink = |factor: f64| ((current as f64 * factor) as usize).min(current.saturating_sub(1));
    let grow = |factor: f64| ((current as f64 * factor) as usize).max(current + 1);
    let proposed = if error_rate > 0.1 {
        shrink(0.8)
    } else if error_rate < 0.02 && mean_latency_secs < 2.0 {
        grow(1.2)
    } else if mean_latency_secs > 5.0 {
        shrink(0.9)
    } else {
        current
    };
    proposed.clamp(min_limit, max_limit.max(min_limit))
}

struct ControllerState {
    current_limit: usize,
    /// 已下调但仍被占用的许可数，归还时抵扣。
    shrink_debt: usize,
    latencies: VecDeque<Duration>,
    successes: u64,
    errors: u64,
    last_retune: Instant,
}

impl ControllerState {
    fn mean_latency(&self) -> Duration {
        if self.latencies.is_empty() {
            return Duration::ZERO;
        }
        self.latencies.iter().sum::<Duration>() / self.latencies.len() as u32
    }
}

struct ControllerInner {
    config: ConcurrencyConfig,
    semaphore: Arc<Semaphore>,
    state: Mutex<ControllerState>,
    in_flight: AtomicUsize,
}

impl ControllerInner {
    fn lock_state(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply_limit(&self, state: &mut ControllerState, new_limit: usize) {
        let current = state.current_limit;
        if new_limit > current {
            let grow = new_limit - current;
            let settled = grow.min(state.shrink_debt);
            state.shrink_debt -= settled;
            self.semaphore.add_permits(grow - settled);
        } else if new_limit < current {
            let shrink = current - new_limit;
            let forgotten = self.semaphore.forget_permits(shrink);
            state.shrink_debt += shrink - forgotten;
        }
        state.current_limit = new_limit;
    }
}

/// 进程级自适应并发闸门。
#[derive(Clone)]
pub struct ConcurrencyController {
    inner: Arc<ControllerInner>,
}

/// 并发许可；丢弃即归还。
pub struct ConcurrencyPermit {
    permit: Option<OwnedSemaphorePermit>,
    inner: Arc<ControllerInner>,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::Relaxed);
        if let Some(permit) = self.permit.take() {
            let mut state = self.inner.lock_state();
            if state.shrink_debt > 0 {
                state.shrink_debt -= 1;
                permit.forget();
            }
        }
    }
}

impl ConcurrencyController {
    pub fn new(config: ConcurrencyConfig) -> Self {
        let initial = config
            .initial_limit
            .clamp(config.min_limit, config.max_limit.max(config.min_limit));
        Self {
            inner: Arc::new(ControllerInner {
                semaphore: Arc::new(Semaphore::new(initial)),
                state: Mutex::new(ControllerState {
                    current_limit: initial,
                    shrink_debt: 0,
                    latencies: VecDeque::with_capacity(config.latency_window),
                    successes: 0,
                    errors: 0,
                    last_retune: Instant::now(),
                }),
                in_flight: AtomicUsize::new(0),
                config,
            }),
        }
    }

    /// 等待一个并发槽位；获取前顺带检查是否需要调整上限。
    pub async fn acquire(&self) -> Result<ConcurrencyPermit, PoolError> {
        self.maybe_retune();
        let permit = self
            .inner
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::GateClosed)?;
        self.inner.in_flight.fetch_add(1, Ordering::Relaxed);
        Ok(ConcurrencyPermit {
            permit: Some(permit),
            inner: self.inner.clone(),
        })
    }

    pub fn record_success(&self, latency: Duration) {
        let mut state = self.inner.lock_state();
        state.successes += 1;
        state.latencies.push_back(latency);
        while state.latencies.len() > self.inner.config.latency_window.max(1) {
            state.latencies.pop_front();
        }
    }

    pub fn record_error(&self) {
        self.inner.lock_state().errors += 1;
    }

    /// 距上次调整超过周期且有样本时重新计算上限；返回调整后的上限。
    pub fn maybe_retune(&self) -> Option<usize> {
        let mut state = self.inner.lock_state();
        let now = Instant::now();
        if now.saturating_duration_since(state.last_retune) < self.inner.config.retune_interval {
            return None;
        }
        let samples = state.successes + state.errors;
        if samples == 0 {
            return None;
        }
        let error_rate = state.errors as f64 / samples as f64;
        let mean_latency = state.mean_latency();
        let previous = state.current_limit;
        let next = compute_limit(
            error_rate,
            mean_latency.as_secs_f64(),
            previous,
            self.inner.config.min_limit,
            self.inner.config.max_limit,
        );
        self.inner.apply_limit(&mut state, next);
        state.successes = 0;
        state.errors = 0;
        state.latencies.clear();
        state.last_retune = now;
        drop(state);

        record_concurrency_retune();
        if next != previous {
            info!(
                target: "netops.concurrency",
                previous,
                next,
                error_rate,
                mean_latency_ms = mean_latency.as_millis() as u64,
                "concurrency_limit_adjusted"
            );
        }
        Some(next)
    }

    /// 手动设置上限（限定在 `[min_limit, max_limit]`），返回生效值。
    pub fn set_limit(&self, limit: usize) -> usize {
        let config = &self.inner.config;
        let limit = limit.clamp(config.min_limit, config.max_limit.max(config.min_limit));
        let mut state = self.inner.lock_state();
        let previous = state.current_limit;
        self.inner.apply_limit(&mut state, limit);
        drop(state);
        info!(
            target: "netops.concurrency",
            previous,
            next = limit,
            "concurrency_limit_set"
        );
        limit
    }

    pub fn current_limit(&self) -> usize {
        self.inner.lock_state().current_limit
    }

    /// 关闭闸门：等待中的与后续的获取都会失败。
    pub fn close(&self) {
        self.inner.semaphore.close();
    }

    pub fn snapshot(&self) -> ConcurrencySnapshot {
        let state = self.inner.lock_state();
        ConcurrencySnapshot {
            current_limit: state.current_limit,
            min_limit: self.inner.config.min_limit,
            max_limit: self.inner.config.max_limit,
            available_permits: self.inner.semaphore.available_permits(),
            in_flight: self.inner.in_flight.load(Ordering::Relaxed),
            recent_successes: state.successes,
            recent_errors: state.errors,
            mean_latency_ms: state.mean_latency().as_millis() as u64,
        }
    }
}
