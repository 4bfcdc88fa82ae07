//! # 连接池与并发控制
//!
//! - [`ConnectionPool`]：按 [`domain::DeviceKey`] 分桶复用设备会话，
//!   同时受单设备上限与全局上限约束，后台定期清理过期连接并做健康探测。
//! - [`ConcurrencyController`]：进程级并发闸门，按最近的耗时与错误率周期性调整上限。
//!
//! ```text
//! acquire ──► 空闲且健康？──是──► 复用（hit）
//!               │否
//!               ▼
//!          容量未满？──是──► 新建会话（miss）
//!               │否
//!               ▼
//!          内联清理后重试 ──► 等待释放（acquire_timeout）──► PoolExhausted
//! ```

mod concurrency;
mod error;
mod pool;

pub use concurrency::{
    ConcurrencyConfig, ConcurrencyController, ConcurrencyPermit, ConcurrencySnapshot,
    compute_limit,
};
pub use error::PoolError;
pub use pool::{ConnectionPool, ConnectionState, PoolConfig, PoolStats, PooledConnection, ReleaseOutcome};
