pub mod decode;

use serde::{Deserialize, Serialize};

/// A raw login event as carried on the input topic.
///
/// Immutable once decoded; all fields are required and non-empty
/// (enforced by [`decode::decode_event`]).
#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    pub user_id: String,
    pub app_version: String,
    pub device_type: String,
    pub ip: String,
    pub locale: String,
    pub device_id: String,
    /// Unix epoch seconds, kept as the raw string until normalization.
    pub timestamp: String,
}

/// Device families accepted by the pipeline. Anything else is dropped
/// before it can touch aggregation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceType {
    Android,
    Ios,
}

impl DeviceType {
    /// Returns the canonical lowercased label used on the output topic.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Android => "android",
            Self::Ios => "ios",
        }
    }

    /// Case-insensitive parse of a raw device type value.
    pub fn from_raw(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "android" => Some(Self::Android),
            "ios" => Some(Self::Ios),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The enriched record published to the output topic.
///
/// Field names and ordering match the output topic schema exactly,
/// including the lowercased device type fields. Produced once per
/// accepted input event and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub user_id: String,
    pub app_version: String,
    pub total_logins_for_version: u64,
    pub ip: String,
    pub suspicious_login: bool,
    pub logs_from_multiple_locations: bool,
    pub normalized_timestamp: String,
    pub locale: String,
    pub total_logins_from_locale: u64,
    pub device_id: String,
    pub shared_device: bool,
    pub device_type: String,
    pub most_common_device_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_type_from_raw_case_insensitive() {
        assert_eq!(DeviceType::from_raw("Android"), Some(DeviceType::Android));
        assert_eq!(DeviceType::from_raw("ANDROID"), Some(DeviceType::Android));
        assert_eq!(DeviceType::from_raw("iOS"), Some(DeviceType::Ios));
        assert_eq!(DeviceType::from_raw("ios"), Some(DeviceType::Ios));
    }

    #[test]
    fn test_device_type_rejects_non_mobile() {
        assert_eq!(DeviceType::from_raw("Desktop"), None);
        assert_eq!(DeviceType::from_raw("windows"), None);
        assert_eq!(DeviceType::from_raw(""), None);
    }

    #[test]
    fn test_processed_event_field_names() {
        let event = ProcessedEvent {
            user_id: "u1".to_string(),
            app_version: "2.3.0".to_string(),
            total_logins_for_version: 1,
            ip: "1.2.3.4".to_string(),
            suspicious_login: false,
            logs_from_multiple_locations: false,
            normalized_timestamp: "2024-03-24 17:50:36".to_string(),
            locale: "NC".to_string(),
            total_logins_from_locale: 1,
            device_id: "d1".to_string(),
            shared_device: false,
            device_type: "android".to_string(),
            most_common_device_type: "android".to_string(),
        };

        let json = serde_json::to_value(&event).expect("serialize");
        for field in [
            "user_id",
            "app_version",
            "total_logins_for_version",
            "ip",
            "suspicious_login",
            "logs_from_multiple_locations",
            "normalized_timestamp",
            "locale",
            "total_logins_from_locale",
            "device_id",
            "shared_device",
            "device_type",
            "most_common_device_type",
        ] {
            assert!(json.get(field).is_some(), "missing output field: {field}");
        }
    }
}
