use crate::model::OperationRequest;
use async_trait::async_trait;
use domain::{DeviceTarget, OperationKind, now_epoch_ms};
use netops_monitor::{OperationMetrics, PerformanceMonitor};
use netops_pool::{ConcurrencyController, ConnectionPool, PoolError, ReleaseOutcome};
use netops_session::{DeviceSession, SessionError};
use netops_telemetry::{new_operation_id, record_operation};
use serde_json::{Value, json};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// 单设备操作错误。
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("operation failed: {0}")]
    Failed(String),
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("worker panicked: {0}")]
    WorkerPanicked(String),
}

impl OperationError {
    /// 稳定的错误类别名，写入 `error_kind` 与错误分布。
    pub fn kind(&self) -> &'static str {
        match self {
            OperationError::Pool(err) => err.kind(),
            OperationError::Session(err) => match err {
                SessionError::Timeout(_) => "OperationTimeout",
                SessionError::Authentication(_) => "AuthenticationError",
                SessionError::Connectivity(_) | SessionError::Io(_) | SessionError::Closed => {
                    "ConnectivityError"
                }
                SessionError::Protocol(_) => "OperationFailed",
            },
            OperationError::Timeout(_) => "OperationTimeout",
            OperationError::Failed(_) => "OperationFailed",
            OperationError::InvalidParameters(_) => "InvalidParameters",
            OperationError::Cancelled => "Cancelled",
            OperationError::WorkerPanicked(_) => "WorkerPanicked",
        }
    }

    /// 参数错误与取消重试也不会成功。
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            OperationError::InvalidParameters(_)
                | OperationError::Cancelled
                | OperationError::Pool(PoolError::GateClosed)
        )
    }
}

/// 单设备操作执行器（批量协调器通过它访问设备）。
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    /// 执行一次尝试；`timeout` 覆盖借连接与全部命令往返。
    async fn execute(
        &self,
        target: &DeviceTarget,
        request: &OperationRequest,
        timeout: Duration,
    ) -> Result<Value, OperationError>;
}

type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, OperationError>> + Send + 'a>>;

/// 操作处理器：在已借出的会话上完成一种操作。
type Handler = for<'a> fn(
    &'a mut dyn DeviceSession,
    &'a DeviceTarget,
    &'a OperationRequest,
    Duration,
) -> HandlerFuture<'a>;

fn handler_for(kind: OperationKind) -> Handler {
    match kind {
        OperationKind::CommandExecution => execute_commands,
        OperationKind::ConfigDeployment => deploy_config,
        OperationKind::ConfigBackup => backup_config,
        OperationKind::ConnectivityTest => test_connectivity,
        OperationKind::DeviceInfoCollection => collect_device_info,
    }
}

/// 参数校验在借连接之前完成。
fn validate(request: &OperationRequest) -> Result<(), OperationError> {
    match request {
        OperationRequest::CommandExecution { commands }
            if commands.iter().all(|command| command.trim().is_empty()) =>
        {
            Err(OperationError::InvalidParameters(
                "no command given".to_string(),
            ))
        }
        OperationRequest::ConfigDeployment { lines }
            if lines.iter().all(|line| line.trim().is_empty()) =>
        {
            Err(OperationError::InvalidParameters(
                "no config lines given".to_string(),
            ))
        }
        _ => Ok(()),
    }
}

fn first_line(output: &str) -> &str {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("")
}

fn execute_commands<'a>(
    session: &'a mut dyn DeviceSession,
    _target: &'a DeviceTarget,
    request: &'a OperationRequest,
    timeout: Duration,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let OperationRequest::CommandExecution { commands } = request else {
            return Err(OperationError::InvalidParameters(
                "expected command execution parameters".to_string(),
            ));
        };
        let mut results = Vec::with_capacity(commands.len());
        for command in commands.iter().filter(|command| !command.trim().is_empty()) {
            let response = session.send_command(command, timeout).await?;
            if response.failed {
                return Err(OperationError::Failed(format!(
                    "`{}` rejected: {}",
                    command,
                    first_line(&response.output)
                )));
            }
            results.push(json!({
                "command": command,
                "output": response.output,
                "elapsed_ms": response.elapsed.as_millis() as u64,
            }));
        }
        Ok(json!({ "command_count": results.len(), "results": results }))
    })
}

fn deploy_config<'a>(
    session: &'a mut dyn DeviceSession,
    _target: &'a DeviceTarget,
    request: &'a OperationRequest,
    timeout: Duration,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let OperationRequest::ConfigDeployment { lines } = request else {
            return Err(OperationError::InvalidParameters(
                "expected config deployment parameters".to_string(),
            ));
        };
        let lines: Vec<String> = lines
            .iter()
            .filter(|line| !line.trim().is_empty())
            .cloned()
            .collect();
        let response = session.send_config(&lines, timeout).await?;
        if response.failed {
            return Err(OperationError::Failed(format!(
                "config rejected: {}",
                first_line(&response.output)
            )));
        }
        Ok(json!({
            "lines_applied": lines.len(),
            "output": response.output,
            "elapsed_ms": response.elapsed.as_millis() as u64,
        }))
    })
}

fn backup_config<'a>(
    session: &'a mut dyn DeviceSession,
    target: &'a DeviceTarget,
    _request: &'a OperationRequest,
    timeout: Duration,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let command = target.platform.backup_command();
        let response = session.send_command(command, timeout).await?;
        if response.failed {
            return Err(OperationError::Failed(format!(
                "`{}` rejected: {}",
                command,
                first_line(&response.output)
            )));
        }
        Ok(json!({
            "command": command,
            "config_size": response.output.len(),
            "config": response.output,
        }))
    })
}

fn test_connectivity<'a>(
    session: &'a mut dyn DeviceSession,
    target: &'a DeviceTarget,
    _request: &'a OperationRequest,
    timeout: Duration,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let started = Instant::now();
        let response = session
            .send_command(target.platform.version_command(), timeout)
            .await?;
        Ok(json!({
            "reachable": true,
            "platform": target.platform.as_str(),
            "response_time_ms": started.elapsed().as_millis() as u64,
            "response_length": response.output.len(),
        }))
    })
}

fn collect_device_info<'a>(
    session: &'a mut dyn DeviceSession,
    target: &'a DeviceTarget,
    _request: &'a OperationRequest,
    timeout: Duration,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let command = target.platform.version_command();
        let version = session.send_command(command, timeout).await?;
        if version.failed {
            return Err(OperationError::Failed(format!(
                "`{}` rejected: {}",
                command,
                first_line(&version.output)
            )));
        }

        // 硬件清单采集失败不影响结果
        let mut inventory = None;
        if let Some(extra) = target.platform.inventory_command() {
            match session.send_command(extra, timeout).await {
                Ok(response) if !response.failed => inventory = Some(response.output),
                Ok(response) => debug!(
                    target: "netops.batch",
                    device_id = %target.device_id,
                    command = extra,
                    output = %first_line(&response.output),
                    "device_info_extra_rejected"
                ),
                Err(err) if err.is_timeout() || matches!(err, SessionError::Closed) => {
                    return Err(err.into());
                }
                Err(err) => debug!(
                    target: "netops.batch",
                    device_id = %target.device_id,
                    command = extra,
                    error = %err,
                    "device_info_extra_failed"
                ),
            }
        }

        Ok(json!({
            "platform": target.platform.as_str(),
            "version": version.output,
            "inventory": inventory,
        }))
    })
}

/// 基于连接池的设备操作执行器。
///
/// 每次尝试：借连接 → 按操作类型分派处理器 → 归还连接，
/// 并把结果写入性能监控与进程计数器。
#[derive(Clone)]
pub struct DeviceExecutor {
    pub(crate) pool: ConnectionPool,
    pub(crate) controller: ConcurrencyController,
    pub(crate) monitor: PerformanceMonitor,
    command_timeout: Duration,
}

impl DeviceExecutor {
    pub fn new(
        pool: ConnectionPool,
        controller: ConcurrencyController,
        monitor: PerformanceMonitor,
        command_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            controller,
            monitor,
            command_timeout,
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn controller(&self) -> &ConcurrencyController {
        &self.controller
    }

    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.monitor
    }

    async fn attempt(
        &self,
        target: &DeviceTarget,
        request: &OperationRequest,
        timeout: Duration,
    ) -> Result<Value, OperationError> {
        let mut connection = self.pool.acquire(target).await?;
        let handler = handler_for(request.kind());
        let command_timeout = self.command_timeout.min(timeout);
        let result = handler(&mut *connection, target, request, command_timeout).await;
        let outcome = match &result {
            Err(OperationError::Session(_)) => ReleaseOutcome::Failure,
            _ => ReleaseOutcome::Success,
        };
        self.pool.release(connection, outcome).await;
        result
    }

    fn record(
        &self,
        target: &DeviceTarget,
        kind: OperationKind,
        started_at_ms: i64,
        elapsed: Duration,
        result: &Result<Value, OperationError>,
    ) {
        record_operation(result.is_ok(), elapsed.as_millis() as u64);
        let (error_kind, error_message) = match result {
            Ok(_) => (None, None),
            Err(err) => (Some(err.kind().to_string()), Some(err.to_string())),
        };
        self.monitor.record_operation(OperationMetrics {
            operation_id: new_operation_id(),
            operation: kind,
            device_id: target.device_id.clone(),
            device_ip: target.host.clone(),
            started_at_ms,
            finished_at_ms: started_at_ms + elapsed.as_millis() as i64,
            duration: elapsed,
            success: result.is_ok(),
            error_kind,
            error_message,
        });
    }
}

#[async_trait]
impl OperationExecutor for DeviceExecutor {
    async fn execute(
        &self,
        target: &DeviceTarget,
        request: &OperationRequest,
        timeout: Duration,
    ) -> Result<Value, OperationError> {
        validate(request)?;
        let started_at_ms = now_epoch_ms();
        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, self.attempt(target, request, timeout)).await
        {
            Ok(result) => result,
            Err(_) => Err(OperationError::Timeout(timeout)),
        };
        let elapsed = started.elapsed();
        self.record(target, request.kind(), started_at_ms, elapsed, &result);

        match &result {
            Ok(_) => debug!(
                target: "netops.batch",
                device_id = %target.device_id,
                device_ip = %target.host,
                operation = %request.kind(),
                elapsed_ms = elapsed.as_millis() as u64,
                "device_operation_succeeded"
            ),
            Err(err) => warn!(
                target: "netops.batch",
                device_id = %target.device_id,
                device_ip = %target.host,
                operation = %request.kind(),
                error_kind = err.kind(),
                error = %err,
                elapsed_ms = elapsed.as_millis() as u64,
                "device_operation_failed"
            ),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_are_stable() {
        assert_eq!(
            OperationError::Timeout(Duration::from_secs(1)).kind(),
            "OperationTimeout"
        );
        assert_eq!(
            OperationError::Session(SessionError::Timeout("prompt".into())).kind(),
            "OperationTimeout"
        );
        assert_eq!(
            OperationError::Session(SessionError::Closed).kind(),
            "ConnectivityError"
        );
        assert_eq!(
            OperationError::Pool(PoolError::Exhausted {
                device: "d".into(),
                in_use: 1,
                max_total: 1
            })
            .kind(),
            "PoolExhausted"
        );
        assert_eq!(OperationError::Failed("x".into()).kind(), "OperationFailed");
    }

    #[test]
    fn invalid_parameters_are_not_retried() {
        let err = validate(&OperationRequest::CommandExecution {
            commands: vec!["  ".to_string()],
        })
        .expect_err("blank command");
        assert_eq!(err.kind(), "InvalidParameters");
        assert!(!err.is_retryable());
        assert!(validate(&OperationRequest::ConfigDeployment { lines: vec![] }).is_err());
        assert!(validate(&OperationRequest::ConfigBackup).is_ok());
        assert!(OperationError::Failed("x".into()).is_retryable());
    }

    #[test]
    fn first_line_skips_blank_lines() {
        assert_eq!(first_line("\n  % Invalid input\nsw1#"), "% Invalid input");
        assert_eq!(first_line(""), "");
    }
}
