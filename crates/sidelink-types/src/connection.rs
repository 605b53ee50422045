use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionType {
    Ccloud,
    Direct,
    Local,
    /// Any type this client does not know about yet.
    #[serde(other)]
    Unknown,
}

impl ConnectionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionType::Ccloud => "CCLOUD",
            ConnectionType::Direct => "DIRECT",
            ConnectionType::Local => "LOCAL",
            ConnectionType::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectedState {
    #[default]
    None,
    Attempting,
    Success,
    Expired,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ErrorDetail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ConnectionErrors {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sign_in: Option<ErrorDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_status_check: Option<ErrorDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_refresh: Option<ErrorDetail>,
}

/// State of one probed sub-resource (cloud account, Kafka cluster or
/// Schema Registry) of a connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SubResourceStatus {
    #[serde(default)]
    pub state: ConnectedState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<ConnectionErrors>,
}

impl SubResourceStatus {
    pub fn new(state: ConnectedState) -> Self {
        Self {
            state,
            errors: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ConnectionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ccloud: Option<SubResourceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kafka_cluster: Option<SubResourceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_registry: Option<SubResourceStatus>,
}

impl ConnectionStatus {
    /// Missing sub-statuses read as `NONE`.
    pub fn ccloud_state(&self) -> ConnectedState {
        self.ccloud.as_ref().map(|s| s.state).unwrap_or_default()
    }

    pub fn kafka_state(&self) -> ConnectedState {
        self.kafka_cluster
            .as_ref()
            .map(|s| s.state)
            .unwrap_or_default()
    }

    pub fn schema_registry_state(&self) -> ConnectedState {
        self.schema_registry
            .as_ref()
            .map(|s| s.state)
            .unwrap_or_default()
    }

    pub fn sign_in_error(&self) -> Option<&ErrorDetail> {
        self.ccloud
            .as_ref()
            .and_then(|s| s.errors.as_ref())
            .and_then(|e| e.sign_in.as_ref())
    }
}

/// Client-side mirror of a connection tracked by the sidecar.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub connection_type: ConnectionType,
    #[serde(default)]
    pub status: ConnectionStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionAction {
    Created,
    Updated,
    Connected,
    Disconnected,
    Deleted,
}

impl ConnectionAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionAction::Created => "CREATED",
            ConnectionAction::Updated => "UPDATED",
            ConnectionAction::Connected => "CONNECTED",
            ConnectionAction::Disconnected => "DISCONNECTED",
            ConnectionAction::Deleted => "DELETED",
        }
    }

    /// The connection is gone (or unreachable) after this action.
    pub fn is_removal(self) -> bool {
        matches!(
            self,
            ConnectionAction::Disconnected | ConnectionAction::Deleted
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub action: ConnectionAction,
    pub connection: ConnectionDescriptor,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn descriptor_parses_sidecar_shape() {
        let raw = json!({
            "id": "conn-1",
            "name": "dev cluster",
            "type": "DIRECT",
            "status": {
                "kafka_cluster": { "state": "ATTEMPTING" },
                "schema_registry": { "state": "SUCCESS" }
            }
        });
        let parsed: ConnectionDescriptor = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.connection_type, ConnectionType::Direct);
        assert_eq!(parsed.status.kafka_state(), ConnectedState::Attempting);
        assert_eq!(
            parsed.status.schema_registry_state(),
            ConnectedState::Success
        );
        assert_eq!(parsed.status.ccloud_state(), ConnectedState::None);
    }

    #[test]
    fn unrecognized_connection_type_is_preserved_as_unknown() {
        let parsed: ConnectionType = serde_json::from_str("\"PLATFORM\"").unwrap();
        assert_eq!(parsed, ConnectionType::Unknown);
    }

    #[test]
    fn sign_in_error_is_read_from_ccloud_status() {
        let raw = json!({
            "ccloud": {
                "state": "FAILED",
                "errors": { "sign_in": { "message": "bad password" } }
            }
        });
        let status: ConnectionStatus = serde_json::from_value(raw).unwrap();
        assert_eq!(
            status.sign_in_error().map(|e| e.message.as_str()),
            Some("bad password")
        );
    }
}
