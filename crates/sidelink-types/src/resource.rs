//! Records held by the client-side resource cache.
//!
//! Every child record carries the id of the parent it is listed under
//! (`connection_id`, `environment_id`, `cluster_id`, `schema_registry_id`).

use serde::{Deserialize, Serialize};

use crate::ConnectionType;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Environment {
    pub id: String,
    pub name: String,
    pub connection_id: String,
    pub connection_type: ConnectionType,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KafkaCluster {
    pub id: String,
    pub name: String,
    pub environment_id: String,
    #[serde(default)]
    pub bootstrap_servers: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaRegistry {
    pub id: String,
    pub uri: String,
    pub environment_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Topic {
    pub name: String,
    pub cluster_id: String,
    #[serde(default)]
    pub partition_count: u32,
    #[serde(default)]
    pub replication_factor: u32,
    #[serde(default)]
    pub is_internal: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Schema {
    pub id: String,
    pub subject: String,
    pub version: u32,
    pub schema_registry_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_type: Option<String>,
}

/// A cached record listed under a parent key.
pub trait ParentKeyed {
    fn parent_key(&self) -> &str;
}

impl ParentKeyed for Environment {
    fn parent_key(&self) -> &str {
        &self.connection_id
    }
}

impl ParentKeyed for KafkaCluster {
    fn parent_key(&self) -> &str {
        &self.environment_id
    }
}

impl ParentKeyed for SchemaRegistry {
    fn parent_key(&self) -> &str {
        &self.environment_id
    }
}

impl ParentKeyed for Topic {
    fn parent_key(&self) -> &str {
        &self.cluster_id
    }
}

impl ParentKeyed for Schema {
    fn parent_key(&self) -> &str {
        &self.schema_registry_id
    }
}
