//! 网络设备自动化的共享领域模型。

pub mod device;
pub mod operation;

pub use device::{DeviceKey, DeviceTarget, Platform};
pub use operation::OperationKind;

/// 当前 Unix 毫秒时间戳。
pub fn now_epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
