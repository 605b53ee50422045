use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::header::HeaderName;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;

use crate::error::{Result, SidelinkError};

pub const DEFAULT_SIDECAR_HOST: &str = "127.0.0.1";
pub const DEFAULT_SIDECAR_PORT: u16 = 26636;
pub const DEFAULT_CCLOUD_CONNECTION_ID: &str = "vscode-confluent-cloud-connection";
pub const DEFAULT_CONNECTION_ID_HEADER: &str = "x-connection-id";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    pub sidecar_host: String,
    pub sidecar_port: u16,
    pub websocket_path: String,
    pub handshake_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub max_payload_bytes: usize,
    pub ccloud_connection_id: String,
    pub connection_id_header: String,
    /// Upper bound on how long a control-plane request waits for a token
    /// refresh. `None` waits indefinitely.
    pub auth_gate_max_wait_ms: Option<u64>,
    pub logs_retention_days: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            sidecar_host: DEFAULT_SIDECAR_HOST.to_string(),
            sidecar_port: DEFAULT_SIDECAR_PORT,
            websocket_path: "/ws".to_string(),
            handshake_timeout_ms: 5_000,
            heartbeat_interval_ms: 5_000,
            max_payload_bytes: sidelink_wire::DEFAULT_MAX_PAYLOAD_BYTES,
            ccloud_connection_id: DEFAULT_CCLOUD_CONNECTION_ID.to_string(),
            connection_id_header: DEFAULT_CONNECTION_ID_HEADER.to_string(),
            auth_gate_max_wait_ms: None,
            logs_retention_days: 14,
        }
    }
}

impl ClientConfig {
    /// Effective config: defaults, then the JSON file at `path` (if any),
    /// then `SIDELINK_*` environment variables, then `overrides`.
    pub async fn load(path: Option<&Path>, overrides: Option<Value>) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;
        if let Some(path) = path {
            deep_merge(&mut merged, &read_json_file(path).await?);
        }
        deep_merge(&mut merged, &env_layer());
        if let Some(overrides) = overrides {
            deep_merge(&mut merged, &overrides);
        }
        let config: Self = serde_json::from_value(merged)
            .map_err(|err| SidelinkError::InvalidConfig(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sidecar_port == 0 {
            return Err(SidelinkError::InvalidConfig(
                "sidecar_port must be non-zero".to_string(),
            ));
        }
        if self.handshake_timeout_ms == 0 || self.heartbeat_interval_ms == 0 {
            return Err(SidelinkError::InvalidConfig(
                "handshake and heartbeat intervals must be non-zero".to_string(),
            ));
        }
        if self.max_payload_bytes == 0 {
            return Err(SidelinkError::InvalidConfig(
                "max_payload_bytes must be non-zero".to_string(),
            ));
        }
        self.connection_id_header_name()?;
        Ok(())
    }

    pub fn websocket_url(&self) -> String {
        let path = self.websocket_path.trim_start_matches('/');
        format!("ws://{}:{}/{}", self.sidecar_host, self.sidecar_port, path)
    }

    pub fn http_base_url(&self) -> String {
        format!("http://{}:{}", self.sidecar_host, self.sidecar_port)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn auth_gate_max_wait(&self) -> Option<Duration> {
        self.auth_gate_max_wait_ms.map(Duration::from_millis)
    }

    pub fn connection_id_header_name(&self) -> Result<HeaderName> {
        HeaderName::from_bytes(self.connection_id_header.as_bytes()).map_err(|_| {
            SidelinkError::InvalidConfig(format!(
                "invalid connection id header: {}",
                self.connection_id_header
            ))
        })
    }
}

pub fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("SIDELINK_CONFIG") {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .map(|dir| dir.join("sidelink").join("config.json"))
        .unwrap_or_else(|| PathBuf::from(".sidelink/config.json"))
}

pub fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("sidelink"))
        .unwrap_or_else(|| PathBuf::from(".sidelink"))
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str::<Value>(&raw).unwrap_or_else(|_| empty_object()))
}

fn env_layer() -> Value {
    let mut root = empty_object();

    if let Ok(host) = std::env::var("SIDELINK_SIDECAR_HOST") {
        if !host.trim().is_empty() {
            deep_merge(&mut root, &json!({ "sidecar_host": host.trim() }));
        }
    }
    if let Some(port) = env_number::<u16>("SIDELINK_SIDECAR_PORT") {
        deep_merge(&mut root, &json!({ "sidecar_port": port }));
    }
    if let Some(ms) = env_number::<u64>("SIDELINK_HANDSHAKE_TIMEOUT_MS") {
        deep_merge(&mut root, &json!({ "handshake_timeout_ms": ms }));
    }
    if let Some(ms) = env_number::<u64>("SIDELINK_HEARTBEAT_INTERVAL_MS") {
        deep_merge(&mut root, &json!({ "heartbeat_interval_ms": ms }));
    }
    if let Some(ms) = env_number::<u64>("SIDELINK_AUTH_GATE_MAX_WAIT_MS") {
        deep_merge(&mut root, &json!({ "auth_gate_max_wait_ms": ms }));
    }

    root
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
