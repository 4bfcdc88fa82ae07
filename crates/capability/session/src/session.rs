use crate::error::SessionError;
use async_trait::async_trait;
use domain::DeviceTarget;
use std::time::Duration;

/// 单条命令的设备回显。
#[derive(Debug, Clone, Default)]
pub struct CommandResponse {
    pub output: String,
    /// 设备提示命令错误（如 `% Invalid input`）。
    pub failed: bool,
    pub elapsed: Duration,
}

/// 与单台设备的交互式命令通道。
#[async_trait]
pub trait DeviceSession: Send {
    fn is_alive(&self) -> bool;

    async fn send_command(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResponse, SessionError>;

    /// 逐行下发配置；任一行失败则整体标记失败。
    async fn send_config(
        &mut self,
        lines: &[String],
        timeout: Duration,
    ) -> Result<CommandResponse, SessionError> {
        let mut merged = CommandResponse::default();
        for line in lines {
            let response = self.send_command(line, timeout).await?;
            if !merged.output.is_empty() && !response.output.is_empty() {
                merged.output.push('\n');
            }
            merged.output.push_str(&response.output);
            merged.failed |= response.failed;
            merged.elapsed += response.elapsed;
        }
        Ok(merged)
    }

    async fn close(&mut self) -> Result<(), SessionError>;
}

/// 会话打开器：连接池通过它创建新会话。
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn open(&self, target: &DeviceTarget) -> Result<Box<dyn DeviceSession>, SessionError>;
}
