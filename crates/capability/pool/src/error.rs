use netops_session::SessionError;

/// 连接池与并发闸门错误。
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool exhausted for {device}: {in_use}/{max_total} connections in use")]
    Exhausted {
        device: String,
        in_use: usize,
        max_total: usize,
    },
    #[error("authentication failed for {device}: {message}")]
    Authentication { device: String, message: String },
    #[error("cannot reach {device}: {message}")]
    Connectivity { device: String, message: String },
    #[error("failed to open session to {device}: {message}")]
    Connection { device: String, message: String },
    #[error("concurrency gate closed")]
    GateClosed,
}

impl PoolError {
    /// 会话打开失败归类：认证 / 连通性 / 未知。
    pub fn from_open(device: String, err: SessionError) -> Self {
        match err {
            SessionError::Authentication(message) => PoolError::Authentication { device, message },
            SessionError::Connectivity(message) | SessionError::Timeout(message) => {
                PoolError::Connectivity { device, message }
            }
            SessionError::Io(err) => PoolError::Connectivity {
                device,
                message: err.to_string(),
            },
            SessionError::Protocol(message) => match SessionError::classify_open(message) {
                SessionError::Authentication(message) => {
                    PoolError::Authentication { device, message }
                }
                other => PoolError::Connection {
                    device,
                    message: other.to_string(),
                },
            },
            SessionError::Closed => PoolError::Connection {
                device,
                message: "session closed during open".to_string(),
            },
        }
    }

    /// 稳定的错误类别名，用于批量结果的错误分布。
    pub fn kind(&self) -> &'static str {
        match self {
            PoolError::Exhausted { .. } => "PoolExhausted",
            PoolError::Authentication { .. } => "AuthenticationError",
            PoolError::Connectivity { .. } => "ConnectivityError",
            PoolError::Connection { .. } => "ConnectionError",
            PoolError::GateClosed => "Cancelled",
        }
    }
}
