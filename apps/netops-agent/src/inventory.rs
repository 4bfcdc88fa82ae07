//! 设备清单加载（JSON 数组）。

use domain::DeviceTarget;
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("read inventory {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse inventory {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("duplicate device_id in inventory: {0}")]
    DuplicateDevice(String),
}

pub fn load_inventory(path: impl AsRef<Path>) -> Result<Vec<DeviceTarget>, InventoryError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| InventoryError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_inventory(&raw).map_err(|err| match err {
        InventoryError::Parse { source, .. } => InventoryError::Parse {
            path: path.display().to_string(),
            source,
        },
        other => other,
    })
}

/// 解析清单内容；`device_id` 必须唯一。
pub fn parse_inventory(raw: &str) -> Result<Vec<DeviceTarget>, InventoryError> {
    let devices: Vec<DeviceTarget> =
        serde_json::from_str(raw).map_err(|source| InventoryError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
    let mut seen = HashSet::new();
    for device in &devices {
        if !seen.insert(device.device_id.as_str()) {
            return Err(InventoryError::DuplicateDevice(device.device_id.clone()));
        }
    }
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::Platform;

    #[test]
    fn parses_targets_with_defaults() {
        let raw = r#"[
            {"device_id": "core-1", "host": "10.0.0.1", "username": "admin", "password": "pw", "platform": "huawei"},
            {"device_id": "edge-1", "device_name": "edge", "host": "10.0.0.2", "port": 2222, "username": "ops"}
        ]"#;
        let devices = parse_inventory(raw).expect("inventory");
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].platform, Platform::Huawei);
        assert_eq!(devices[0].port, 22);
        assert_eq!(devices[1].port, 2222);
        assert_eq!(devices[1].display_name(), "edge");
        assert!(devices[1].password.is_empty());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let raw = r#"[
            {"device_id": "sw1", "host": "10.0.0.1", "username": "a"},
            {"device_id": "sw1", "host": "10.0.0.2", "username": "a"}
        ]"#;
        match parse_inventory(raw) {
            Err(InventoryError::DuplicateDevice(id)) => assert_eq!(id, "sw1"),
            other => panic!("unexpected: {:?}", other.map(|d| d.len())),
        }
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            parse_inventory("{not json"),
            Err(InventoryError::Parse { .. })
        ));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_inventory("/nonexistent/netops-inventory.json").expect_err("missing");
        assert!(err.to_string().contains("/nonexistent/netops-inventory.json"));
    }
}
