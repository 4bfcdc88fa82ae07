use serde::{Deserialize, Serialize};
use std::fmt;

/// 连接池分片标识：主机 + 端口 + 登录账号。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceKey {
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl DeviceKey {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.port, self.username)
    }
}

/// 设备平台（决定备份、信息采集所用命令）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Platform {
    CiscoIos,
    CiscoNxos,
    CiscoIosXr,
    Huawei,
    H3c,
    #[default]
    Unknown,
}

impl Platform {
    /// 归一化平台字符串，例如 `cisco_ios`、`huawei_vrp`、`hp_comware`。
    pub fn parse(raw: &str) -> Self {
        let value = raw.trim().to_ascii_lowercase();
        if value.contains("nxos") || value.contains("nx-os") {
            Platform::CiscoNxos
        } else if value.contains("iosxr") || value.contains("ios-xr") || value.contains("ios_xr") {
            Platform::CiscoIosXr
        } else if value.contains("cisco") || value.contains("ios") {
            Platform::CiscoIos
        } else if value.contains("huawei") || value.contains("vrp") {
            Platform::Huawei
        } else if value.contains("h3c") || value.contains("comware") {
            Platform::H3c
        } else {
            Platform::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::CiscoIos => "cisco_ios",
            Platform::CiscoNxos => "cisco_nxos",
            Platform::CiscoIosXr => "cisco_iosxr",
            Platform::Huawei => "huawei",
            Platform::H3c => "h3c",
            Platform::Unknown => "unknown",
        }
    }

    pub fn is_cisco(&self) -> bool {
        matches!(
            self,
            Platform::CiscoIos | Platform::CiscoNxos | Platform::CiscoIosXr
        )
    }

    fn is_vrp_family(&self) -> bool {
        matches!(self, Platform::Huawei | Platform::H3c)
    }

    /// 导出运行配置的命令。
    pub fn backup_command(&self) -> &'static str {
        if self.is_vrp_family() {
            "display current-configuration"
        } else {
            "show running-config"
        }
    }

    /// 版本信息命令。
    pub fn version_command(&self) -> &'static str {
        if self.is_vrp_family() {
            "display version"
        } else {
            "show version"
        }
    }

    /// 硬件清单命令；未知平台没有。
    pub fn inventory_command(&self) -> Option<&'static str> {
        if self.is_cisco() {
            Some("show inventory")
        } else if self.is_vrp_family() {
            Some("display device")
        } else {
            None
        }
    }
}

impl From<String> for Platform {
    fn from(value: String) -> Self {
        Platform::parse(&value)
    }
}

impl From<Platform> for String {
    fn from(value: Platform) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_port() -> u16 {
    22
}

/// 批量操作的目标设备（含登录凭据）。
#[derive(Clone, Serialize, Deserialize)]
pub struct DeviceTarget {
    pub device_id: String,
    #[serde(default)]
    pub device_name: Option<String>,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    #[serde(skip_serializing, default)]
    pub enable_password: Option<String>,
    #[serde(default)]
    pub platform: Platform,
}

impl DeviceTarget {
    pub fn new(
        device_id: impl Into<String>,
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: None,
            host: host.into(),
            port: default_port(),
            username: username.into(),
            password: password.into(),
            enable_password: None,
            platform: Platform::Unknown,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn device_key(&self) -> DeviceKey {
        DeviceKey::new(self.host.clone(), self.port, self.username.clone())
    }

    /// 展示用名称：优先设备名，其次 ID。
    pub fn display_name(&self) -> &str {
        self.device_name.as_deref().unwrap_or(&self.device_id)
    }
}

// 凭据不进入日志。
impl fmt::Debug for DeviceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceTarget")
            .field("device_id", &self.device_id)
            .field("device_name", &self.device_name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("platform", &self.platform)
            .finish_non_exhaustive()
    }
}
