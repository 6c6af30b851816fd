use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::agent::PubberError;
use crate::messages::{Metadata, PointsetConfig};

pub const PUBSUB_SITE: &str = "PubSub";
pub const DEFAULT_BRIDGE_HOSTNAME: &str = "localhost";
pub const DEFAULT_BRIDGE_PORT: u16 = 1883;

pub const MIN_REPORT_MS: u64 = 200;
pub const DEFAULT_REPORT_SEC: u32 = 10;

const DEFAULT_KEY_FILE: &str = "local/rsa_private.pkcs8";
const DEFAULT_ALGORITHM: &str = "RS256";
const DEFAULT_OUT_DIR: &str = "out";

/// Launch-time device settings; effectively immutable once an agent
/// finishes initializing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceConfig {
    pub project_id: Option<String>,
    pub device_id: Option<String>,
    pub serial_no: Option<String>,
    pub mac_addr: Option<String>,
    pub gateway_id: Option<String>,
    pub extra_field: Option<String>,
    pub site_path: Option<String>,
    pub key_file: Option<String>,
    #[serde(skip)]
    pub key_bytes: Option<Vec<u8>>,
    pub algorithm: String,
    pub registry_id: Option<String>,
    pub cloud_region: Option<String>,
    pub bridge_hostname: String,
    pub bridge_port: u16,
    pub out_dir: PathBuf,
    pub verbose: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            project_id: None,
            device_id: None,
            serial_no: None,
            mac_addr: None,
            gateway_id: None,
            extra_field: None,
            site_path: None,
            key_file: Some(DEFAULT_KEY_FILE.to_string()),
            key_bytes: None,
            algorithm: DEFAULT_ALGORITHM.to_string(),
            registry_id: None,
            cloud_region: None,
            bridge_hostname: DEFAULT_BRIDGE_HOSTNAME.to_string(),
            bridge_port: DEFAULT_BRIDGE_PORT,
            out_dir: PathBuf::from(DEFAULT_OUT_DIR),
            verbose: true,
        }
    }
}

impl DeviceConfig {
    pub fn from_file(path: &Path) -> Result<Self, PubberError> {
        let raw = fs::read_to_string(path).map_err(|source| PubberError::Io {
            context: format!("reading device config {}", path.display()),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|err| {
            PubberError::Configuration(format!(
                "parsing device config {}: {err}",
                path.display()
            ))
        })
    }

    pub fn for_device(
        project_id: &str,
        site_path: &str,
        device_id: &str,
        serial_no: &str,
    ) -> Self {
        Self {
            project_id: Some(project_id.to_string()),
            device_id: Some(device_id.to_string()),
            serial_no: Some(serial_no.to_string()),
            site_path: Some(site_path.to_string()),
            ..Self::default()
        }
    }

    /// Swarm instances start with no device identity; the bootstrap bundle
    /// fills it in. Per-send logging is suppressed in this mode.
    pub fn for_swarm(project_id: &str, serial_no: &str) -> Self {
        Self {
            project_id: Some(project_id.to_string()),
            serial_no: Some(serial_no.to_string()),
            site_path: Some(PUBSUB_SITE.to_string()),
            verbose: false,
            ..Self::default()
        }
    }

    /// Read auth key bytes from the configured key file unless a bootstrap
    /// path already supplied them.
    pub fn load_key_bytes(&mut self) -> Result<(), PubberError> {
        if self.key_bytes.is_some() {
            return Ok(());
        }
        let key_file = self.key_file.as_deref().ok_or_else(|| {
            PubberError::Configuration("auth key file not configured".to_string())
        })?;
        let bytes = fs::read(key_file).map_err(|source| PubberError::Io {
            context: format!("reading key bytes from {key_file}"),
            source,
        })?;
        self.key_bytes = Some(bytes);
        Ok(())
    }
}

/// Key file location inside a site model, keyed by auth algorithm family.
pub fn site_key_file(site_path: &str, device_id: &str, algorithm: &str) -> String {
    let prefix = if algorithm.starts_with("RS") { "rsa" } else { "ec" };
    format!("{site_path}/devices/{device_id}/{prefix}_private.pkcs8")
}

/// Registry settings shared by every device in a site model. Unlike the
/// device config, `cloud_iot_config.json` carries snake_case keys.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistryConfig {
    pub registry_id: Option<String>,
    pub cloud_region: Option<String>,
}

pub fn load_registry_config(site_path: &str) -> Result<RegistryConfig, PubberError> {
    let path = format!("{site_path}/cloud_iot_config.json");
    let raw = fs::read_to_string(&path).map_err(|source| PubberError::Io {
        context: format!("reading registry config {path}"),
        source,
    })?;
    serde_json::from_str(&raw)
        .map_err(|err| PubberError::Configuration(format!("parsing registry config {path}: {err}")))
}

pub fn load_device_metadata(site_path: &str, device_id: &str) -> Result<Metadata, PubberError> {
    let path = format!("{site_path}/devices/{device_id}/metadata.json");
    let raw = fs::read_to_string(&path).map_err(|source| PubberError::Io {
        context: format!("reading device metadata {path}"),
        source,
    })?;
    serde_json::from_str(&raw)
        .map_err(|err| PubberError::Configuration(format!("parsing device metadata {path}: {err}")))
}

/// Telemetry interval for a pointset config, floored so a hostile sample
/// rate cannot melt the scheduler.
pub fn effective_interval_ms(pointset: Option<&PointsetConfig>) -> u64 {
    let rate_sec = pointset
        .and_then(|p| p.sample_rate_sec)
        .unwrap_or(DEFAULT_REPORT_SEC);
    (u64::from(rate_sec) * 1000).max(MIN_REPORT_MS)
}
