//! 会话错误类型定义

/// 设备会话错误
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// 认证失败（用户名/密码/enable 密码错误）
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// 网络不可达、连接被拒绝或登录阶段断开
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// 等待提示符超时
    #[error("timeout: {0}")]
    Timeout(String),

    /// IO 错误
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// 设备返回了无法识别的内容
    #[error("protocol error: {0}")]
    Protocol(String),

    /// 会话已关闭
    #[error("session closed")]
    Closed,
}

impl SessionError {
    /// 按错误文本归类打开会话时的失败。
    ///
    /// 文本中出现 `authentication` 或 `login` 视为认证失败，其余视为连通性失败。
    pub fn classify_open(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        if lower.contains("authentication") || lower.contains("login") {
            SessionError::Authentication(message)
        } else {
            SessionError::Connectivity(message)
        }
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, SessionError::Authentication(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SessionError::Timeout(_))
    }
}
