use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const MESSAGE_VERSION: i32 = 1;

pub const LEVEL_ERROR: i32 = 800;
pub const LEVEL_INFO: i32 = 400;

/// Status or log entry attached to state documents and system events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub category: String,
    pub level: i32,
    pub timestamp: DateTime<Utc>,
}

impl Entry {
    pub fn new(level: i32, category: &str, message: &str) -> Self {
        Self {
            message: message.to_string(),
            detail: None,
            category: category.to_string(),
            level,
            timestamp: Utc::now(),
        }
    }
}

/// Reportable device state, published whole on every state update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub timestamp: DateTime<Utc>,
    pub system: SystemState,
    pub pointset: PointsetState,
}

impl Default for State {
    fn default() -> Self {
        Self {
            timestamp: Utc::now(),
            system: SystemState::default(),
            pointset: PointsetState::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemState {
    pub operational: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_no: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub make_model: Option<String>,
    pub firmware: Firmware,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_config: Option<DateTime<Utc>>,
    #[serde(default)]
    pub statuses: HashMap<String, Entry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Firmware {
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PointsetState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_etag: Option<String>,
    #[serde(default)]
    pub points: HashMap<String, PointPointsetState>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointPointsetState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writeable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
}

/// Telemetry event carrying the present value of every registered point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointsetEvent {
    pub version: i32,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_field: Option<String>, // Opaque passthrough used to probe schema tolerance downstream
    #[serde(default)]
    pub points: HashMap<String, PointPointsetEvent>,
}

impl PointsetEvent {
    pub fn new() -> Self {
        Self {
            version: MESSAGE_VERSION,
            timestamp: Utc::now(),
            extra_field: None,
            points: HashMap::new(),
        }
    }
}

impl Default for PointsetEvent {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointPointsetEvent {
    pub present_value: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEvent {
    pub version: i32,
    pub timestamp: DateTime<Utc>,
    pub logentries: Vec<Entry>,
}

impl SystemEvent {
    pub fn new(logentries: Vec<Entry>) -> Self {
        Self {
            version: MESSAGE_VERSION,
            timestamp: Utc::now(),
            logentries,
        }
    }
}

/// Inbound device configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pointset: Option<PointsetConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PointsetConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate_sec: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_etag: Option<String>,
    #[serde(default)]
    pub points: HashMap<String, PointPointsetConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PointPointsetConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writeable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline_value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline_tolerance: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
}

/// Error report published by an upstream gateway on behalf of a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Bootstrap payload consumed from the swarm feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmMessage {
    pub key_base64: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_metadata: Option<Metadata>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud: Option<CloudMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pointset: Option<PointsetMetadata>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PointsetMetadata {
    #[serde(default)]
    pub points: HashMap<String, PointPointsetMetadata>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PointPointsetMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writeable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline_value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline_tolerance: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_parsing() {
        let raw = r#"{
            "timestamp": "2026-08-21T10:15:30Z",
            "pointset": {
                "sample_rate_sec": 5,
                "state_etag": "abc123",
                "points": {
                    "recalcitrant_angle": { "writeable": false, "units": "Celsius" }
                }
            }
        }"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        let pointset = config.pointset.unwrap();
        assert_eq!(pointset.sample_rate_sec, Some(5));
        assert_eq!(pointset.state_etag.as_deref(), Some("abc123"));
        assert_eq!(
            pointset.points["recalcitrant_angle"].writeable,
            Some(false)
        );
    }

    #[test]
    fn test_config_tolerates_missing_sections() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert!(config.timestamp.is_none());
        assert!(config.pointset.is_none());

        let config: Config = serde_json::from_str(r#"{"pointset": {}}"#).unwrap();
        let pointset = config.pointset.unwrap();
        assert!(pointset.sample_rate_sec.is_none());
        assert!(pointset.points.is_empty());
    }

    #[test]
    fn test_state_serialization_skips_absent_fields() {
        let state = State::default();
        let raw = serde_json::to_string(&state).unwrap();
        assert!(!raw.contains("serial_no"));
        assert!(!raw.contains("last_config"));
        assert!(raw.contains("statuses"));
        assert!(raw.contains("firmware"));
    }

    #[test]
    fn test_entry_round_trip() {
        let mut entry = Entry::new(LEVEL_ERROR, "config", "broken");
        entry.detail = Some("caused by: oops".to_string());
        let raw = serde_json::to_string(&entry).unwrap();
        let parsed: Entry = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn test_swarm_message_parsing() {
        let raw = r#"{
            "key_base64": "c2VjcmV0",
            "device_metadata": {
                "cloud": { "auth_type": "ES256" },
                "pointset": { "points": { "p1": { "units": "foo" } } }
            }
        }"#;
        let message: SwarmMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(message.key_base64, "c2VjcmV0");
        let metadata = message.device_metadata.unwrap();
        assert_eq!(
            metadata.cloud.unwrap().auth_type.as_deref(),
            Some("ES256")
        );
        assert_eq!(
            metadata.pointset.unwrap().points["p1"].units.as_deref(),
            Some("foo")
        );
    }
}
