//! # 批量设备操作
//!
//! [`BatchCoordinator`] 把同一操作下发到多台设备：
//!
//! ```text
//! start_batch ─► 登记批次 ─► 策略调度（parallel / sequential / fail_fast / continue_on_error）
//!                               │
//!                               ▼ 每台设备
//!              并发槽位 ─► Running ─► OperationExecutor::execute ─► 失败则退避重试
//!                               │
//!                               ▼
//!                     Success / Failed / Cancelled ─► 进度计数 + 回调
//! ```
//!
//! [`DeviceExecutor`] 是基于连接池的执行器：借连接、按操作类型分派处理器、
//! 归还连接，并把每次尝试写入性能监控。

mod coordinator;
mod executor;
mod model;
mod runtime;

pub use coordinator::{BatchCoordinator, BatchTicket, CoordinatorError};
pub use executor::{DeviceExecutor, OperationError, OperationExecutor};
pub use model::{
    BatchConfig, BatchErrorEntry, BatchOperationResult, BatchProgress, BatchRequest,
    BatchStrategy, BatchSummary, DeviceOperation, DeviceTiming, OperationRequest,
    OperationStatus, ProgressCallback,
};
pub use runtime::{HealthReport, HealthStatus, RuntimeStats};
