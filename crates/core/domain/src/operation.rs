use serde::{Deserialize, Serialize};
use std::fmt;

/// 批量操作类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    CommandExecution,
    ConfigDeployment,
    ConfigBackup,
    ConnectivityTest,
    DeviceInfoCollection,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::CommandExecution => "command_execution",
            OperationKind::ConfigDeployment => "config_deployment",
            OperationKind::ConfigBackup => "config_backup",
            OperationKind::ConnectivityTest => "connectivity_test",
            OperationKind::DeviceInfoCollection => "device_info_collection",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
