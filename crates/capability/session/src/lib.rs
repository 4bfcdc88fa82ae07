//! # 设备会话能力模块
//!
//! 连接池与批量执行只依赖这里定义的会话抽象：
//! - [`SessionConnector`]：按设备目标打开会话（区分认证失败与网络失败）
//! - [`DeviceSession`]：存活检查、下发命令/配置、关闭
//!
//! [`TcpCliConnector`] 是基于行的 CLI 适配实现：登录提示应答、
//! 提示符识别、按平台关闭分页与进入配置模式。
//!
//! ```text
//! DeviceTarget ──► SessionConnector::open ──► Box<dyn DeviceSession>
//!                                                   │
//!                                  send_command / send_config / close
//! ```

mod error;
mod session;
mod tcp_cli;

pub use error::SessionError;
pub use session::{CommandResponse, DeviceSession, SessionConnector};
pub use tcp_cli::{TcpCliConfig, TcpCliConnector, TcpCliSession};
