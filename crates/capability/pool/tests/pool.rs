use async_trait::async_trait;
use domain::DeviceTarget;
use netops_pool::{ConnectionPool, PoolConfig, PoolError, ReleaseOutcome};
use netops_session::{CommandResponse, DeviceSession, SessionConnector, SessionError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinSet;

#[derive(Default)]
struct Counters {
    opened: AtomicUsize,
    closed: AtomicUsize,
    live: AtomicUsize,
    peak_live: AtomicUsize,
}

struct FakeSession {
    counters: Arc<Counters>,
    probe_ok: Arc<AtomicBool>,
    alive: bool,
}

#[async_trait]
impl DeviceSession for FakeSession {
    fn is_alive(&self) -> bool {
        self.alive
    }

    async fn send_command(
        &mut self,
        command: &str,
        _timeout: Duration,
    ) -> Result<CommandResponse, SessionError> {
        if command.is_empty() && !self.probe_ok.load(Ordering::SeqCst) {
            return Err(SessionError::Timeout("probe".to_string()));
        }
        Ok(CommandResponse {
            output: format!("ok: {}", command),
            failed: false,
            elapsed: Duration::from_millis(1),
        })
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        if self.alive {
            self.alive = false;
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
            self.counters.live.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum OpenBehavior {
    Succeed,
    RejectCredentials,
    Unreachable,
}

struct FakeConnector {
    counters: Arc<Counters>,
    probe_ok: Arc<AtomicBool>,
    behavior: OpenBehavior,
    open_delay: Duration,
}

impl FakeConnector {
    fn new(behavior: OpenBehavior) -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            probe_ok: Arc::new(AtomicBool::new(true)),
            behavior,
            open_delay: Duration::ZERO,
        }
    }
}

#[async_trait]
impl SessionConnector for FakeConnector {
    async fn open(&self, target: &DeviceTarget) -> Result<Box<dyn DeviceSession>, SessionError> {
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        match self.behavior {
            OpenBehavior::Succeed => {}
            OpenBehavior::RejectCredentials => {
                return Err(SessionError::Authentication(format!(
                    "bad password for {}",
                    target.username
                )));
            }
            OpenBehavior::Unreachable => {
                return Err(SessionError::Connectivity("connection refused".to_string()));
            }
        }
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak_live.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            counters: self.counters.clone(),
            probe_ok: self.probe_ok.clone(),
            alive: true,
        }))
    }
}

fn device(id: &str) -> DeviceTarget {
    DeviceTarget::new(id, format!("10.0.0.{}", id.len()), "admin", "secret").with_port(
        22 + id.bytes().map(u16::from).sum::<u16>(),
    )
}

fn pool_with(config: PoolConfig, connector: FakeConnector) -> (ConnectionPool, Arc<Counters>, Arc<AtomicBool>) {
    let counters = connector.counters.clone();
    let probe_ok = connector.probe_ok.clone();
    (ConnectionPool::new(config, Arc::new(connector)), counters, probe_ok)
}

#[tokio::test]
async fn released_connection_is_reused() {
    let (pool, counters, _) = pool_with(PoolConfig::default(), FakeConnector::new(OpenBehavior::Succeed));
    let target = device("a");

    let first = pool.acquire(&target).await.expect("first");
    assert!(!first.is_reused());
    let first_id = first.id();
    assert!(pool.release(first, ReleaseOutcome::Success).await);

    let mut second = pool.acquire(&target).await.expect("second");
    assert!(second.is_reused());
    assert_eq!(second.id(), first_id);
    assert_eq!(second.use_count(), 2);
    let response = second
        .send_command("show clock", Duration::from_secs(1))
        .await
        .expect("command");
    assert_eq!(response.output, "ok: show clock");
    pool.release(second, ReleaseOutcome::Success).await;

    let stats = pool.stats();
    assert_eq!(counters.opened.load(Ordering::SeqCst), 1);
    assert_eq!(stats.pool_hits, 1);
    assert_eq!(stats.pool_misses, 1);
    assert_eq!(stats.total_requests, 2);
    assert!((stats.cache_hit_rate - 50.0).abs() < f64::EPSILON);
    assert_eq!(stats.idle_connections, 1);
}

#[tokio::test]
async fn per_device_and_global_caps_are_enforced() {
    let config = PoolConfig {
        max_connections_per_device: 2,
        max_total_connections: 3,
        ..PoolConfig::default()
    };
    let (pool, _, _) = pool_with(config, FakeConnector::new(OpenBehavior::Succeed));
    let a = device("a");
    let b = device("bb");
    let c = device("ccc");

    let a1 = pool.acquire(&a).await.expect("a1");
    let a2 = pool.acquire(&a).await.expect("a2");
    match pool.acquire(&a).await {
        Err(err @ PoolError::Exhausted { .. }) => assert_eq!(err.kind(), "PoolExhausted"),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("per-device cap exceeded"),
    }

    let b1 = pool.acquire(&b).await.expect("b1");
    assert!(matches!(pool.acquire(&c).await, Err(PoolError::Exhausted { .. })));

    let stats = pool.stats();
    assert_eq!(stats.total_connections, 3);
    assert_eq!(stats.active_connections, 3);
    assert_eq!(stats.exhausted, 2);
    assert_eq!(stats.devices.len(), 2);

    pool.release(a1, ReleaseOutcome::Success).await;
    pool.release(a2, ReleaseOutcome::Success).await;
    pool.release(b1, ReleaseOutcome::Success).await;
}

#[tokio::test]
async fn concurrent_acquires_never_exceed_caps() {
    let config = PoolConfig {
        max_connections_per_device: 2,
        max_total_connections: 3,
        acquire_timeout: Duration::from_secs(5),
        ..PoolConfig::default()
    };
    let mut connector = FakeConnector::new(OpenBehavior::Succeed);
    connector.open_delay = Duration::from_millis(5);
    let (pool, counters, _) = pool_with(config, connector);

    let mut workers = JoinSet::new();
    for worker in 0..24 {
        let pool = pool.clone();
        let target = if worker % 2 == 0 { device("a") } else { device("bb") };
        workers.spawn(async move {
            let connection = pool.acquire(&target).await.expect("acquire");
            tokio::time::sleep(Duration::from_millis(3)).await;
            pool.release(connection, ReleaseOutcome::Success).await;
        });
    }
    while let Some(result) = workers.join_next().await {
        result.expect("worker");
    }

    let stats = pool.stats();
    assert!(stats.peak_connections <= 3);
    assert!(counters.peak_live.load(Ordering::SeqCst) <= 3);
    assert!(stats.devices.values().all(|count| *count <= 2));
    assert_eq!(stats.pool_hits + stats.pool_misses, 24);
}

#[tokio::test(start_paused = true)]
async fn idle_connection_is_evicted_by_cleanup_pass() {
    let config = PoolConfig {
        max_idle_time: Duration::from_secs(300),
        ..PoolConfig::default()
    };
    let (pool, counters, _) = pool_with(config, FakeConnector::new(OpenBehavior::Succeed));
    let target = device("a");

    let connection = pool.acquire(&target).await.expect("acquire");
    let stale_id = connection.id();
    pool.release(connection, ReleaseOutcome::Success).await;

    tokio::time::advance(Duration::from_secs(200)).await;
    assert_eq!(pool.cleanup_expired().await, 0);

    tokio::time::advance(Duration::from_secs(101)).await;
    assert_eq!(pool.cleanup_expired().await, 1);
    assert_eq!(pool.stats().total_connections, 0);
    assert_eq!(counters.closed.load(Ordering::SeqCst), 1);

    let fresh = pool.acquire(&target).await.expect("fresh");
    assert_ne!(fresh.id(), stale_id);
    assert!(!fresh.is_reused());
}

#[tokio::test(start_paused = true)]
async fn background_cleanup_runs_on_interval() {
    let config = PoolConfig {
        max_idle_time: Duration::from_secs(10),
        cleanup_interval: Duration::from_secs(5),
        health_check_interval: Duration::from_secs(3600),
        ..PoolConfig::default()
    };
    let (pool, _, _) = pool_with(config, FakeConnector::new(OpenBehavior::Succeed));
    pool.start();

    let connection = pool.acquire(&device("a")).await.expect("acquire");
    pool.release(connection, ReleaseOutcome::Success).await;

    tokio::time::sleep(Duration::from_secs(16)).await;
    assert_eq!(pool.stats().total_connections, 0);
    assert!(pool.stop().await);
    assert!(!pool.stop().await);
}

#[tokio::test]
async fn idle_connection_of_other_device_yields_to_new_device() {
    let config = PoolConfig {
        max_connections_per_device: 1,
        max_total_connections: 1,
        ..PoolConfig::default()
    };
    let (pool, counters, _) = pool_with(config, FakeConnector::new(OpenBehavior::Succeed));

    let a = pool.acquire(&device("a")).await.expect("a");
    pool.release(a, ReleaseOutcome::Success).await;

    let b = pool.acquire(&device("bb")).await.expect("b");
    assert!(!b.is_reused());
    assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().total_connections, 1);
    pool.release(b, ReleaseOutcome::Success).await;
}

#[tokio::test]
async fn waiting_acquire_receives_released_connection() {
    let config = PoolConfig {
        max_connections_per_device: 1,
        max_total_connections: 1,
        acquire_timeout: Duration::from_secs(5),
        ..PoolConfig::default()
    };
    let (pool, counters, _) = pool_with(config, FakeConnector::new(OpenBehavior::Succeed));
    let target = device("a");

    let held = pool.acquire(&target).await.expect("held");
    let held_id = held.id();

    let waiter = {
        let pool = pool.clone();
        let target = target.clone();
        tokio::spawn(async move { pool.acquire(&target).await.map(|conn| (conn.id(), conn.is_reused())) })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    pool.release(held, ReleaseOutcome::Success).await;

    let (id, reused) = waiter.await.expect("join").expect("acquire");
    assert_eq!(id, held_id);
    assert!(reused);
    assert_eq!(counters.opened.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn open_failures_are_classified_and_not_counted() {
    let (pool, _, _) = pool_with(PoolConfig::default(), FakeConnector::new(OpenBehavior::RejectCredentials));
    match pool.acquire(&device("a")).await {
        Err(err @ PoolError::Authentication { .. }) => {
            assert_eq!(err.kind(), "AuthenticationError");
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("open should fail"),
    }

    let (pool, _, _) = pool_with(PoolConfig::default(), FakeConnector::new(OpenBehavior::Unreachable));
    match pool.acquire(&device("a")).await {
        Err(err) => assert_eq!(err.kind(), "ConnectivityError"),
        Ok(_) => panic!("open should fail"),
    }

    let stats = pool.stats();
    assert_eq!(stats.total_connections, 0);
    assert_eq!(stats.connection_errors, 1);
    assert_eq!(stats.failed_connections, 1);
    assert!(stats.devices.is_empty());
}

#[tokio::test]
async fn repeated_failures_evict_connection() {
    let (pool, counters, _) = pool_with(PoolConfig::default(), FakeConnector::new(OpenBehavior::Succeed));
    let target = device("a");

    for round in 0..3 {
        let connection = pool.acquire(&target).await.expect("acquire");
        let kept = pool.release(connection, ReleaseOutcome::Failure).await;
        assert_eq!(kept, round < 2, "round {}", round);
    }
    assert_eq!(pool.stats().total_connections, 0);
    assert_eq!(counters.opened.load(Ordering::SeqCst), 1);
    assert_eq!(counters.closed.load(Ordering::SeqCst), 1);

    let connection = pool.acquire(&target).await.expect("acquire");
    assert!(pool.release(connection, ReleaseOutcome::Success).await);
    let connection = pool.acquire(&target).await.expect("acquire");
    assert!(pool.release(connection, ReleaseOutcome::Failure).await);
}

#[tokio::test]
async fn dropped_lease_is_discarded() {
    let (pool, counters, _) = pool_with(PoolConfig::default(), FakeConnector::new(OpenBehavior::Succeed));
    let connection = pool.acquire(&device("a")).await.expect("acquire");
    drop(connection);

    assert_eq!(pool.stats().total_connections, 0);
    tokio::task::yield_now().await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failing_health_probe_evicts_idle_connection() {
    let (pool, counters, probe_ok) = pool_with(PoolConfig::default(), FakeConnector::new(OpenBehavior::Succeed));
    let a = pool.acquire(&device("a")).await.expect("a");
    let b = pool.acquire(&device("bb")).await.expect("b");
    pool.release(a, ReleaseOutcome::Success).await;

    assert_eq!(pool.run_health_checks().await, 0);
    assert_eq!(pool.stats().idle_connections, 1);

    probe_ok.store(false, Ordering::SeqCst);
    assert_eq!(pool.run_health_checks().await, 1);
    let stats = pool.stats();
    assert_eq!(stats.idle_connections, 0);
    assert_eq!(stats.active_connections, 1);
    assert_eq!(counters.closed.load(Ordering::SeqCst), 1);

    pool.release(b, ReleaseOutcome::Success).await;
}

#[tokio::test]
async fn restart_closes_idle_and_retires_checked_out_sessions() {
    let (pool, counters, _) = pool_with(PoolConfig::default(), FakeConnector::new(OpenBehavior::Succeed));
    pool.start();
    let held = pool.acquire(&device("a")).await.expect("held");
    let idle = pool.acquire(&device("bb")).await.expect("idle");
    pool.release(idle, ReleaseOutcome::Success).await;

    pool.restart().await;
    assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().total_connections, 1);

    assert!(!pool.release(held, ReleaseOutcome::Success).await);
    assert_eq!(pool.stats().total_connections, 0);
    assert_eq!(counters.closed.load(Ordering::SeqCst), 2);
    assert!(pool.stop().await);
}

#[tokio::test]
async fn clear_idle_reports_count() {
    let (pool, _, _) = pool_with(PoolConfig::default(), FakeConnector::new(OpenBehavior::Succeed));
    for name in ["a", "bb", "ccc"] {
        let connection = pool.acquire(&device(name)).await.expect("acquire");
        pool.release(connection, ReleaseOutcome::Success).await;
    }
    assert_eq!(pool.clear_idle().await, 3);
    assert_eq!(pool.stats().total_connections, 0);
    assert_eq!(pool.stats().connections_destroyed, 3);
}
