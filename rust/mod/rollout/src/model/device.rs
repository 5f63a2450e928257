use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Lookup of device attributes by rule field name.
///
/// Implementations return None for attributes the device did not report;
/// an empty string counts as not reported.
pub trait Attributes {
    fn attribute(&self, field: &str) -> Option<&str>;
}

/// An update check from one app install.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCheckIn {
    /// Stable, opaque per-install identifier.
    pub device_id: String,

    pub app_id: String,

    /// Channel override; the app's default channel is used when absent or unknown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    /// Bundle version the device is running now.
    pub current_version: String,

    #[serde(default)]
    pub platform: String,

    #[serde(default)]
    pub os_version: String,

    /// Native binary version.
    #[serde(default)]
    pub app_version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, String>,
}

fn present(s: &str) -> Option<&str> {
    if s.is_empty() { None } else { Some(s) }
}

impl Attributes for DeviceCheckIn {
    fn attribute(&self, field: &str) -> Option<&str> {
        match field {
            "platform" => present(&self.platform),
            "osVersion" | "os_version" => present(&self.os_version),
            "appVersion" | "app_version" => present(&self.app_version),
            "currentVersion" | "current_version" => present(&self.current_version),
            "deviceId" | "device_id" => present(&self.device_id),
            "locale" => self.locale.as_deref().and_then(present),
            other => self.custom.get(other).map(String::as_str).and_then(present),
        }
    }
}

impl Attributes for HashMap<String, String> {
    fn attribute(&self, field: &str) -> Option<&str> {
        self.get(field).map(String::as_str).and_then(present)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_in() -> DeviceCheckIn {
        DeviceCheckIn {
            device_id: "dev-1".into(),
            app_id: "app".into(),
            channel: None,
            current_version: "1.9.0".into(),
            platform: "ios".into(),
            os_version: "17.2".into(),
            app_version: "3.4.0".into(),
            locale: Some("en-US".into()),
            custom: BTreeMap::from([
                ("tier".to_string(), "gold".to_string()),
                ("empty".to_string(), String::new()),
            ]),
        }
    }

    #[test]
    fn builtin_and_custom_attributes() {
        let c = check_in();
        assert_eq!(c.attribute("platform"), Some("ios"));
        assert_eq!(c.attribute("osVersion"), Some("17.2"));
        assert_eq!(c.attribute("os_version"), Some("17.2"));
        assert_eq!(c.attribute("appVersion"), Some("3.4.0"));
        assert_eq!(c.attribute("locale"), Some("en-US"));
        assert_eq!(c.attribute("tier"), Some("gold"));
        assert_eq!(c.attribute("empty"), None);
        assert_eq!(c.attribute("missing"), None);
    }

    #[test]
    fn deserializes_sparse_check_in() {
        let c: DeviceCheckIn = serde_json::from_value(serde_json::json!({
            "deviceId": "d",
            "appId": "a",
            "currentVersion": "1.0.0"
        }))
        .unwrap();
        assert_eq!(c.attribute("platform"), None);
        assert!(c.channel.is_none());
        assert!(c.custom.is_empty());
    }
}
