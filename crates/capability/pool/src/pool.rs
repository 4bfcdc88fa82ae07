use crate::error::PoolError;
use domain::{DeviceKey, DeviceTarget};
use netops_session::{DeviceSession, SessionConnector};
use netops_telemetry::{
    record_pool_exhausted, record_pool_hit, record_pool_miss, record_session_closed,
    record_session_open_failure, record_session_opened,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// 连续失败达到该次数即视为不健康。
const UNHEALTHY_FAILURE_THRESHOLD: u32 = 3;

/// 连接池参数。
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections_per_device: usize,
    pub max_total_connections: usize,
    pub max_idle_time: Duration,
    pub max_lifetime: Duration,
    pub health_check_interval: Duration,
    pub cleanup_interval: Duration,
    /// 容量已满时，内联清理之后最多等待多久（0 表示立即失败）。
    pub acquire_timeout: Duration,
    /// 健康探测单次超时。
    pub probe_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_device: 3,
            max_total_connections: 50,
            max_idle_time: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(3600),
            health_check_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(120),
            acquire_timeout: Duration::ZERO,
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// 连接生命周期状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Idle,
    Active,
    Checking,
    Failed,
    Expired,
}

/// 归还连接时附带的操作结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Success,
    Failure,
    /// 会话状态不可信（如命令被中途取消），直接关闭。
    Discard,
}

/// 连接池统计快照。
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub total_connections: usize,
    pub active_connections: usize,
    pub idle_connections: usize,
    pub checking_connections: usize,
    /// 累计：打开失败、探测失败、因失败归还而淘汰。
    pub failed_connections: u64,
    pub connections_created: u64,
    pub connections_destroyed: u64,
    pub peak_connections: usize,
    pub total_requests: u64,
    pub pool_hits: u64,
    pub pool_misses: u64,
    pub exhausted: u64,
    pub connection_errors: u64,
    /// 复用率（百分比）。
    pub cache_hit_rate: f64,
    pub max_total_connections: usize,
    pub devices: BTreeMap<String, usize>,
}

struct ConnectionSlot {
    id: u64,
    created_at: Instant,
    last_used_at: Instant,
    use_count: u64,
    state: ConnectionState,
    consecutive_failures: u32,
    /// 借出或探测期间为 None。
    session: Option<Box<dyn DeviceSession>>,
}

impl ConnectionSlot {
    fn is_expired(&self, now: Instant, config: &PoolConfig) -> bool {
        now.saturating_duration_since(self.last_used_at) > config.max_idle_time
            || now.saturating_duration_since(self.created_at) > config.max_lifetime
    }

    fn is_healthy(&self) -> bool {
        matches!(self.state, ConnectionState::Idle | ConnectionState::Active)
            && self.consecutive_failures < UNHEALTHY_FAILURE_THRESHOLD
            && self
                .session
                .as_ref()
                .is_some_and(|session| session.is_alive())
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    created: u64,
    destroyed: u64,
    failed: u64,
    peak: usize,
    total_requests: u64,
    hits: u64,
    misses: u64,
    exhausted: u64,
    connection_errors: u64,
}

enum Checkout {
    Reused {
        id: u64,
        use_count: u64,
        session: Box<dyn DeviceSession>,
    },
    Reserved {
        id: u64,
    },
    Full,
}

#[derive(Default)]
struct PoolState {
    buckets: HashMap<DeviceKey, Vec<ConnectionSlot>>,
    total: usize,
    next_id: u64,
    counters: PoolCounters,
    /// 待在锁外关闭的会话。
    retired: Vec<Box<dyn DeviceSession>>,
}

impl PoolState {
    fn retire(&mut self, slot: ConnectionSlot) {
        self.total = self.total.saturating_sub(1);
        self.counters.destroyed += 1;
        if let Some(session) = slot.session {
            self.retired.push(session);
        }
    }

    fn drain_retired(&mut self) -> Vec<Box<dyn DeviceSession>> {
        std::mem::take(&mut self.retired)
    }

    fn retire_where<F>(&mut self, key: &DeviceKey, mut predicate: F) -> usize
    where
        F: FnMut(&ConnectionSlot) -> bool,
    {
        let Some(bucket) = self.buckets.get_mut(key) else {
            return 0;
        };
        let mut removed = Vec::new();
        let mut index = 0;
        while index < bucket.len() {
            if predicate(&bucket[index]) {
                removed.push(bucket.swap_remove(index));
            } else {
                index += 1;
            }
        }
        if bucket.is_empty() {
            self.buckets.remove(key);
        }
        let count = removed.len();
        for slot in removed {
            self.retire(slot);
        }
        count
    }

    fn retire_everywhere<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&ConnectionSlot) -> bool,
    {
        let keys: Vec<DeviceKey> = self.buckets.keys().cloned().collect();
        keys.iter()
            .map(|key| self.retire_where(key, &mut predicate))
            .sum()
    }

    fn checkout(&mut self, key: &DeviceKey, now: Instant, config: &PoolConfig) -> Checkout {
        // 不健康或过期的空闲连接不参与复用。
        self.retire_where(key, |slot| {
            slot.state == ConnectionState::Idle
                && (slot.is_expired(now, config) || !slot.is_healthy())
        });

        if let Some(bucket) = self.buckets.get_mut(key) {
            if let Some(slot) = bucket
                .iter_mut()
                .find(|slot| slot.state == ConnectionState::Idle && slot.session.is_some())
            {
                if let Some(session) = slot.session.take() {
                    slot.state = ConnectionState::Active;
                    slot.use_count += 1;
                    slot.last_used_at = now;
                    self.counters.hits += 1;
                    return Checkout::Reused {
                        id: slot.id,
                        use_count: slot.use_count,
                        session,
                    };
                }
            }
        }

        let device_count = self.buckets.get(key).map_or(0, Vec::len);
        if device_count >= config.max_connections_per_device
            || self.total >= config.max_total_connections
        {
            return Checkout::Full;
        }

        self.next_id += 1;
        let id = self.next_id;
        self.buckets
            .entry(key.clone())
            .or_default()
            .push(ConnectionSlot {
                id,
                created_at: now,
                last_used_at: now,
                use_count: 1,
                state: ConnectionState::Active,
                consecutive_failures: 0,
                session: None,
            });
        self.total += 1;
        self.counters.peak = self.counters.peak.max(self.total);
        Checkout::Reserved { id }
    }

    /// 内联清理：淘汰所有过期空闲连接；若全局已满而本设备仍有余量，
    /// 再淘汰其他设备中最久未用的空闲连接。
    fn sweep_for(&mut self, key: &DeviceKey, now: Instant, config: &PoolConfig) -> usize {
        let mut evicted = self.retire_everywhere(|slot| {
            slot.state == ConnectionState::Idle && slot.is_expired(now, config)
        });
        let device_count = self.buckets.get(key).map_or(0, Vec::len);
        if self.total >= config.max_total_connections
            && device_count < config.max_connections_per_device
        {
            let victim = self
                .buckets
                .iter()
                .flat_map(|(bucket_key, slots)| {
                    slots
                        .iter()
                        .filter(|slot| slot.state == ConnectionState::Idle)
                        .map(move |slot| (bucket_key.clone(), slot.id, slot.last_used_at))
                })
                .min_by_key(|(_, _, last_used_at)| *last_used_at);
            if let Some((victim_key, victim_id, _)) = victim {
                evicted += self.retire_where(&victim_key, |slot| slot.id == victim_id);
            }
        }
        evicted
    }

    fn abandon_reservation(&mut self, key: &DeviceKey, id: u64) {
        if let Some(bucket) = self.buckets.get_mut(key) {
            bucket.retain(|slot| slot.id != id);
            if bucket.is_empty() {
                self.buckets.remove(key);
            }
        }
        self.total = self.total.saturating_sub(1);
        self.counters.connection_errors += 1;
        self.counters.failed += 1;
    }

    fn release(
        &mut self,
        key: &DeviceKey,
        id: u64,
        session: Box<dyn DeviceSession>,
        outcome: ReleaseOutcome,
        now: Instant,
        config: &PoolConfig,
    ) -> bool {
        let Some(slot) = self
            .buckets
            .get_mut(key)
            .and_then(|bucket| bucket.iter_mut().find(|slot| slot.id == id))
        else {
            self.retired.push(session);
            return false;
        };

        match outcome {
            ReleaseOutcome::Success => slot.consecutive_failures = 0,
            ReleaseOutcome::Failure | ReleaseOutcome::Discard => slot.consecutive_failures += 1,
        }
        let expired = slot.is_expired(now, config);
        slot.session = Some(session);
        let keep = outcome != ReleaseOutcome::Discard
            && slot.state == ConnectionState::Active
            && slot.is_healthy()
            && !expired;

        if keep {
            slot.state = ConnectionState::Idle;
            slot.last_used_at = now;
            return true;
        }

        slot.state = if expired || slot.state == ConnectionState::Expired {
            ConnectionState::Expired
        } else {
            ConnectionState::Failed
        };
        if slot.state == ConnectionState::Failed {
            self.counters.failed += 1;
        }
        self.retire_where(key, |slot| slot.id == id);
        false
    }

    fn begin_health_checks(&mut self) -> Vec<(DeviceKey, u64, Box<dyn DeviceSession>)> {
        let mut probes = Vec::new();
        for (key, bucket) in self.buckets.iter_mut() {
            for slot in bucket
                .iter_mut()
                .filter(|slot| slot.state == ConnectionState::Idle)
            {
                if let Some(session) = slot.session.take() {
                    slot.state = ConnectionState::Checking;
                    probes.push((key.clone(), slot.id, session));
                }
            }
        }
        probes
    }

    fn finish_health_check(
        &mut self,
        key: &DeviceKey,
        id: u64,
        session: Box<dyn DeviceSession>,
        healthy: bool,
    ) -> bool {
        let Some(slot) = self
            .buckets
            .get_mut(key)
            .and_then(|bucket| bucket.iter_mut().find(|slot| slot.id == id))
        else {
            self.retired.push(session);
            return false;
        };
        slot.session = Some(session);
        if healthy && slot.state == ConnectionState::Checking {
            slot.consecutive_failures = 0;
            slot.state = ConnectionState::Idle;
            return true;
        }
        if !healthy {
            slot.consecutive_failures += 1;
            slot.state = ConnectionState::Failed;
            self.counters.failed += 1;
        }
        self.retire_where(key, |slot| slot.id == id);
        false
    }

    /// 关闭空闲连接；借出与探测中的连接标记为过期，归还时关闭。
    fn reset(&mut self) -> usize {
        let closed = self.retire_everywhere(|slot| slot.state == ConnectionState::Idle);
        for slot in self.buckets.values_mut().flatten() {
            slot.state = ConnectionState::Expired;
        }
        closed
    }

    fn stats(&self, config: &PoolConfig) -> PoolStats {
        let mut stats = PoolStats {
            total_connections: self.total,
            failed_connections: self.counters.failed,
            connections_created: self.counters.created,
            connections_destroyed: self.counters.destroyed,
            peak_connections: self.counters.peak,
            total_requests: self.counters.total_requests,
            pool_hits: self.counters.hits,
            pool_misses: self.counters.misses,
            exhausted: self.counters.exhausted,
            connection_errors: self.counters.connection_errors,
            max_total_connections: config.max_total_connections,
            ..PoolStats::default()
        };
        for (key, bucket) in &self.buckets {
            stats.devices.insert(key.to_string(), bucket.len());
            for slot in bucket {
                match slot.state {
                    ConnectionState::Idle => stats.idle_connections += 1,
                    ConnectionState::Checking => stats.checking_connections += 1,
                    ConnectionState::Active | ConnectionState::Expired | ConnectionState::Failed => {
                        stats.active_connections += 1
                    }
                }
            }
        }
        let lookups = self.counters.hits + self.counters.misses;
        if lookups > 0 {
            stats.cache_hit_rate = self.counters.hits as f64 / lookups as f64 * 100.0;
        }
        stats
    }
}

struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

struct PoolInner {
    config: PoolConfig,
    connector: Arc<dyn SessionConnector>,
    state: Mutex<PoolState>,
    released: Notify,
    tasks: Mutex<Option<BackgroundTasks>>,
}

impl PoolInner {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release_now(
        &self,
        key: &DeviceKey,
        id: u64,
        session: Box<dyn DeviceSession>,
        outcome: ReleaseOutcome,
    ) -> (bool, Vec<Box<dyn DeviceSession>>) {
        let mut state = self.lock_state();
        let kept = state.release(key, id, session, outcome, Instant::now(), &self.config);
        let retired = state.drain_retired();
        drop(state);
        self.released.notify_waiters();
        (kept, retired)
    }

    async fn cleanup_pass(&self) -> usize {
        let now = Instant::now();
        let (evicted, retired) = {
            let mut state = self.lock_state();
            let evicted = state.retire_everywhere(|slot| {
                slot.state == ConnectionState::Idle && slot.is_expired(now, &self.config)
            });
            (evicted, state.drain_retired())
        };
        if evicted > 0 {
            self.released.notify_waiters();
        }
        close_sessions(retired).await;
        evicted
    }

    async fn health_check_pass(&self) -> usize {
        let probes = self.lock_state().begin_health_checks();
        let mut evicted = 0;
        for (key, id, mut session) in probes {
            let healthy = session.is_alive()
                && match session.send_command("", self.config.probe_timeout).await {
                    Ok(response) => !response.failed,
                    Err(err) => {
                        debug!(
                            target: "netops.pool",
                            device = %key,
                            connection_id = id,
                            error = %err,
                            "pool_health_probe_failed"
                        );
                        false
                    }
                };
            let retired = {
                let mut state = self.lock_state();
                if !state.finish_health_check(&key, id, session, healthy) {
                    evicted += 1;
                }
                state.drain_retired()
            };
            close_sessions(retired).await;
        }
        if evicted > 0 {
            self.released.notify_waiters();
        }
        evicted
    }
}

async fn close_sessions(sessions: Vec<Box<dyn DeviceSession>>) {
    for mut session in sessions {
        if let Err(err) = session.close().await {
            debug!(target: "netops.pool", error = %err, "pool_session_close_failed");
        }
        record_session_closed();
    }
}

fn close_detached(sessions: Vec<Box<dyn DeviceSession>>) {
    if sessions.is_empty() {
        return;
    }
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(close_sessions(sessions));
        }
        Err(_) => {
            for _ in sessions {
                record_session_closed();
            }
        }
    }
}

/// 借出的连接；归还前通过 `Deref` 直接当作会话使用。
///
/// 未经 [`ConnectionPool::release`] 就被丢弃时按 [`ReleaseOutcome::Discard`] 处理。
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    key: DeviceKey,
    id: u64,
    use_count: u64,
    reused: bool,
    session: Option<Box<dyn DeviceSession>>,
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device_key(&self) -> &DeviceKey {
        &self.key
    }

    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    /// 是否复用了已有会话（pool hit）。
    pub fn is_reused(&self) -> bool {
        self.reused
    }
}

impl Deref for PooledConnection {
    type Target = dyn DeviceSession;

    fn deref(&self) -> &Self::Target {
        self.session
            .as_deref()
            .expect("pooled session is present until release")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session
            .as_deref_mut()
            .expect("pooled session is present until release")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            let (_, retired) =
                self.pool
                    .release_now(&self.key, self.id, session, ReleaseOutcome::Discard);
            close_detached(retired);
        }
    }
}

/// 设备连接池。
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, connector: Arc<dyn SessionConnector>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                connector,
                state: Mutex::new(PoolState::default()),
                released: Notify::new(),
                tasks: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// 借出一个到目标设备的健康连接。
    pub async fn acquire(&self, target: &DeviceTarget) -> Result<PooledConnection, PoolError> {
        let key = target.device_key();
        let config = &self.inner.config;
        let deadline = Instant::now() + config.acquire_timeout;
        let mut counted = false;

        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (checkout, retired) = {
                let mut state = self.inner.lock_state();
                if !counted {
                    state.counters.total_requests += 1;
                    counted = true;
                }
                let checkout = state.checkout(&key, Instant::now(), config);
                (checkout, state.drain_retired())
            };
            close_sessions(retired).await;

            match checkout {
                Checkout::Reused {
                    id,
                    use_count,
                    session,
                } => {
                    record_pool_hit();
                    debug!(
                        target: "netops.pool",
                        device = %key,
                        connection_id = id,
                        use_count,
                        "pool_connection_reused"
                    );
                    return Ok(self.lease(key, id, use_count, true, session));
                }
                Checkout::Reserved { id } => {
                    return self.open_reserved(target, key, id).await;
                }
                Checkout::Full => {
                    let (evicted, retired) = {
                        let mut state = self.inner.lock_state();
                        let evicted = state.sweep_for(&key, Instant::now(), config);
                        (evicted, state.drain_retired())
                    };
                    close_sessions(retired).await;
                    if evicted > 0 {
                        debug!(target: "netops.pool", device = %key, evicted, "pool_inline_sweep");
                        continue;
                    }
                    if Instant::now() >= deadline
                        || tokio::time::timeout_at(deadline, notified).await.is_err()
                    {
                        return Err(self.exhausted(&key));
                    }
                }
            }
        }
    }

    async fn open_reserved(
        &self,
        target: &DeviceTarget,
        key: DeviceKey,
        id: u64,
    ) -> Result<PooledConnection, PoolError> {
        match self.inner.connector.open(target).await {
            Ok(session) => {
                {
                    let mut state = self.inner.lock_state();
                    state.counters.created += 1;
                    state.counters.misses += 1;
                    // 连接寿命从会话建立完成算起
                    if let Some(slot) = state
                        .buckets
                        .get_mut(&key)
                        .and_then(|bucket| bucket.iter_mut().find(|slot| slot.id == id))
                    {
                        slot.created_at = Instant::now();
                    }
                }
                record_session_opened();
                record_pool_miss();
                info!(
                    target: "netops.pool",
                    device = %key,
                    device_id = %target.device_id,
                    connection_id = id,
                    "pool_connection_created"
                );
                Ok(self.lease(key, id, 1, false, session))
            }
            Err(err) => {
                self.inner.lock_state().abandon_reservation(&key, id);
                self.inner.released.notify_waiters();
                record_session_open_failure();
                let err = PoolError::from_open(key.to_string(), err);
                warn!(
                    target: "netops.pool",
                    device = %key,
                    device_id = %target.device_id,
                    kind = err.kind(),
                    error = %err,
                    "pool_connection_open_failed"
                );
                Err(err)
            }
        }
    }

    fn lease(
        &self,
        key: DeviceKey,
        id: u64,
        use_count: u64,
        reused: bool,
        session: Box<dyn DeviceSession>,
    ) -> PooledConnection {
        PooledConnection {
            pool: self.inner.clone(),
            key,
            id,
            use_count,
            reused,
            session: Some(session),
        }
    }

    fn exhausted(&self, key: &DeviceKey) -> PoolError {
        let in_use = {
            let mut state = self.inner.lock_state();
            state.counters.exhausted += 1;
            state.total
        };
        record_pool_exhausted();
        warn!(
            target: "netops.pool",
            device = %key,
            in_use,
            max_total = self.inner.config.max_total_connections,
            "pool_exhausted"
        );
        PoolError::Exhausted {
            device: key.to_string(),
            in_use,
            max_total: self.inner.config.max_total_connections,
        }
    }

    /// 归还连接；返回连接是否回到空闲队列。
    pub async fn release(&self, mut connection: PooledConnection, outcome: ReleaseOutcome) -> bool {
        let Some(session) = connection.session.take() else {
            return false;
        };
        let (kept, retired) =
            connection
                .pool
                .release_now(&connection.key, connection.id, session, outcome);
        if !kept {
            debug!(
                target: "netops.pool",
                device = %connection.key,
                connection_id = connection.id,
                ?outcome,
                "pool_connection_evicted_on_release"
            );
        }
        close_sessions(retired).await;
        kept
    }

    /// 执行一次过期清理，返回淘汰数量。
    pub async fn cleanup_expired(&self) -> usize {
        self.inner.cleanup_pass().await
    }

    /// 对所有空闲连接执行一次健康探测，返回淘汰数量。
    pub async fn run_health_checks(&self) -> usize {
        self.inner.health_check_pass().await
    }

    /// 关闭全部空闲连接。
    pub async fn clear_idle(&self) -> usize {
        let (cleared, retired) = {
            let mut state = self.inner.lock_state();
            let cleared = state.retire_everywhere(|slot| slot.state == ConnectionState::Idle);
            (cleared, state.drain_retired())
        };
        self.inner.released.notify_waiters();
        close_sessions(retired).await;
        info!(target: "netops.pool", cleared, "pool_idle_cleared");
        cleared
    }

    /// 重启连接池：停止后台任务、关闭空闲会话、借出中的会话在归还时关闭，再重新启动后台任务。
    pub async fn restart(&self) {
        let was_running = self.stop().await;
        let (closed, retired) = {
            let mut state = self.inner.lock_state();
            let closed = state.reset();
            (closed, state.drain_retired())
        };
        self.inner.released.notify_waiters();
        close_sessions(retired).await;
        info!(target: "netops.pool", closed, "pool_restarted");
        if was_running {
            self.start();
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.lock_state().stats(&self.inner.config)
    }

    /// 启动后台清理与健康检查任务（重复调用无副作用）。
    pub fn start(&self) {
        let mut tasks = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if tasks.is_some() {
            return;
        }
        let (shutdown, receiver) = watch::channel(false);
        let weak = Arc::downgrade(&self.inner);
        let handles = vec![
            spawn_pool_loop(
                weak.clone(),
                receiver.clone(),
                self.inner.config.cleanup_interval,
                PoolTask::Cleanup,
            ),
            spawn_pool_loop(
                weak,
                receiver,
                self.inner.config.health_check_interval,
                PoolTask::HealthCheck,
            ),
        ];
        *tasks = Some(BackgroundTasks { shutdown, handles });
        info!(target: "netops.pool", "pool_background_started");
    }

    /// 停止后台任务并等待退出；返回之前是否在运行。
    pub async fn stop(&self) -> bool {
        let tasks = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(tasks) = tasks else {
            return false;
        };
        let _ = tasks.shutdown.send(true);
        for handle in tasks.handles {
            if let Err(err) = handle.await {
                warn!(target: "netops.pool", error = %err, "pool_background_join_failed");
            }
        }
        info!(target: "netops.pool", "pool_background_stopped");
        true
    }
}

#[derive(Debug, Clone, Copy)]
enum PoolTask {
    Cleanup,
    HealthCheck,
}

fn spawn_pool_loop(
    inner: Weak<PoolInner>,
    mut shutdown: watch::Receiver<bool>,
    period: Duration,
    task: PoolTask,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            let Some(inner) = inner.upgrade() else {
                break;
            };
            match task {
                PoolTask::Cleanup => {
                    let evicted = inner.cleanup_pass().await;
                    if evicted > 0 {
                        info!(target: "netops.pool", evicted, "pool_cleanup_evicted");
                    }
                }
                PoolTask::HealthCheck => {
                    let evicted = inner.health_check_pass().await;
                    if evicted > 0 {
                        warn!(target: "netops.pool", evicted, "pool_health_check_evicted");
                    }
                }
            }
        }
    })
}
