//! # 性能监控
//!
//! 每次设备操作结束后调用 [`PerformanceMonitor::record_operation`]：
//! 更新设备画像（成功率、耗时窗口、错误分布、连续失败、可靠性评分），
//! 并按阈值产生告警。后台任务周期刷新全局统计，输出表现最差与响应偏慢的设备。

mod model;
mod monitor;

pub use model::{
    AlertKind, AlertSeverity, AlertThresholds, DevicePerformanceProfile, LatencyStats,
    OperationMetrics, PerformanceAlert, device_profile_key,
};
pub use monitor::{
    AlertBreakdown, DeviceDetails, DeviceHealth, FleetInsights, FleetSummary, GlobalStats,
    MonitorConfig, PerformanceMonitor, PerformanceTrends,
};
