//! 网络设备运维守护进程：加载配置与设备清单，启动连接池/监控后台任务，
//! 周期对全部设备做连通性巡检，Ctrl+C 退出。

mod inventory;

use domain::DeviceTarget;
use inventory::load_inventory;
use netops_batch::{
    BatchConfig, BatchCoordinator, BatchOperationResult, BatchRequest, BatchStrategy,
    DeviceExecutor, OperationRequest,
};
use netops_config::AppConfig;
use netops_monitor::{MonitorConfig, PerformanceMonitor};
use netops_pool::{ConcurrencyConfig, ConcurrencyController, ConnectionPool, PoolConfig};
use netops_session::{TcpCliConfig, TcpCliConnector};
use netops_telemetry::init_tracing;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载本地 .env（如存在），便于直接 cargo run 启动
    dotenvy::dotenv().ok();
    // 从环境变量加载运行配置
    let config = AppConfig::from_env()?;
    // 初始化结构化日志
    init_tracing();

    let devices = match config.inventory_path.as_deref() {
        Some(path) => load_inventory(path)?,
        None => {
            warn!(target: "netops.agent", "inventory_not_configured");
            Vec::new()
        }
    };
    info!(target: "netops.agent", devices = devices.len(), "inventory_loaded");

    let connector = Arc::new(TcpCliConnector::new(TcpCliConfig {
        connect_timeout: config.session_connect_timeout(),
        ..TcpCliConfig::default()
    }));
    let pool = ConnectionPool::new(pool_config(&config), connector);
    let controller = ConcurrencyController::new(concurrency_config(&config));
    let monitor = PerformanceMonitor::new(monitor_config(&config));
    let executor = Arc::new(DeviceExecutor::new(
        pool,
        controller.clone(),
        monitor,
        config.session_command_timeout(),
    ));
    let coordinator = BatchCoordinator::new(executor.clone(), controller.clone(), batch_config(&config));

    executor.start();
    info!(
        target: "netops.agent",
        max_total_connections = config.pool_max_total,
        concurrency_limit = controller.current_limit(),
        probe_interval_seconds = config.probe_interval_seconds,
        "agent_started"
    );

    match config.probe_interval() {
        Some(period) if !devices.is_empty() => {
            tokio::select! {
                _ = probe_loop(&coordinator, &executor, &devices, period) => {}
                result = tokio::signal::ctrl_c() => result?,
            }
        }
        _ => tokio::signal::ctrl_c().await?,
    }

    info!(target: "netops.agent", "agent_stopping");
    for batch_id in coordinator.active_batches() {
        coordinator.cancel_batch(&batch_id);
    }
    controller.close();
    executor.stop().await;
    info!(target: "netops.agent", "agent_stopped");
    Ok(())
}

/// 按周期对整个清单下发连通性测试。
async fn probe_loop(
    coordinator: &BatchCoordinator,
    executor: &DeviceExecutor,
    devices: &[DeviceTarget],
    period: Duration,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let request = BatchRequest::new(devices.to_vec(), OperationRequest::ConnectivityTest)
            .with_strategy(BatchStrategy::ContinueOnError);
        let result = coordinator.run_batch(request).await;
        log_probe(&result);
        coordinator.evict_batch(&result.batch_id);

        let stats = executor.stats();
        match serde_json::to_string(&stats) {
            Ok(snapshot) => info!(target: "netops.agent", stats = %snapshot, "runtime_stats"),
            Err(err) => error!(target: "netops.agent", error = %err, "runtime_stats_encode_failed"),
        }
        let health = executor.health_report();
        if !health.issues.is_empty() {
            warn!(
                target: "netops.agent",
                issues = ?health.issues,
                device_health_rate = health.device_health_rate,
                "runtime_health_warning"
            );
        }
    }
}

fn log_probe(result: &BatchOperationResult) {
    let Some(summary) = result.summary.as_ref() else {
        return;
    };
    info!(
        target: "netops.agent",
        batch_id = %result.batch_id,
        total = summary.total_devices,
        successful = summary.successful_devices,
        failed = summary.failed_devices,
        success_rate = summary.success_rate,
        duration_ms = summary.total_duration.as_millis() as u64,
        "fleet_probe_completed"
    );
    for op in result.operations.iter().filter(|op| op.error.is_some()) {
        warn!(
            target: "netops.agent",
            device_id = %op.device_id,
            device_ip = %op.device_ip,
            error_kind = op.error_kind.as_deref().unwrap_or("unknown"),
            error = op.error.as_deref().unwrap_or_default(),
            "fleet_probe_device_failed"
        );
    }
}

fn pool_config(config: &AppConfig) -> PoolConfig {
    PoolConfig {
        max_connections_per_device: config.pool_max_per_device,
        max_total_connections: config.pool_max_total,
        max_idle_time: Duration::from_secs(config.pool_max_idle_seconds),
        max_lifetime: Duration::from_secs(config.pool_max_lifetime_seconds),
        health_check_interval: Duration::from_secs(config.pool_health_check_interval_seconds),
        cleanup_interval: Duration::from_secs(config.pool_cleanup_interval_seconds),
        acquire_timeout: Duration::from_millis(config.pool_acquire_timeout_ms),
        ..PoolConfig::default()
    }
}

fn concurrency_config(config: &AppConfig) -> ConcurrencyConfig {
    ConcurrencyConfig {
        initial_limit: config.concurrency_initial,
        min_limit: config.concurrency_min,
        max_limit: config.concurrency_max,
        retune_interval: Duration::from_secs(config.concurrency_retune_seconds),
        ..ConcurrencyConfig::default()
    }
}

fn monitor_config(config: &AppConfig) -> MonitorConfig {
    MonitorConfig {
        history_size: config.monitor_history_size,
        alert_capacity: config.monitor_alert_capacity,
        insight_interval: Duration::from_secs(config.monitor_interval_seconds),
        ..MonitorConfig::default()
    }
}

fn batch_config(config: &AppConfig) -> BatchConfig {
    BatchConfig {
        max_retries: config.batch_max_retries,
        timeout_per_device: Duration::from_secs(config.batch_timeout_per_device_seconds),
        retention: Duration::from_secs(config.batch_retention_seconds),
        backoff_base: Duration::from_millis(config.batch_backoff_base_ms),
        ..BatchConfig::default()
    }
}
