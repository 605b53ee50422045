//! Client-side cache of resources fetched through the sidecar, plus
//! per-document metadata.
//!
//! The backing [`KeyValueStore`] has no transactions, so every
//! read-modify-write of a collection happens under that collection's own
//! mutex. Locks are provisioned once, in [`ResourceCache::new`], for every
//! [`StorageKey`]; writers to different keys never contend. Plain reads skip
//! the lock and may observe a value an in-flight writer is about to replace.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use sidelink_types::{Environment, KafkaCluster, ParentKeyed, Schema, SchemaRegistry, Topic};

use crate::error::{Result, SidelinkError};
use crate::store::KeyValueStore;

/// Metadata attached to one document URI.
pub type UriMetadata = HashMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKey {
    /// Environments, listed per connection id.
    Environments,
    /// Kafka clusters, listed per environment id.
    KafkaClusters,
    /// Schema registries, listed per environment id.
    SchemaRegistries,
    /// Topics, listed per Kafka cluster id.
    Topics,
    /// Schemas, listed per schema registry id.
    Schemas,
    /// Metadata maps, keyed by document URI.
    UriMetadata,
}

impl StorageKey {
    pub const ALL: [StorageKey; 6] = [
        StorageKey::Environments,
        StorageKey::KafkaClusters,
        StorageKey::SchemaRegistries,
        StorageKey::Topics,
        StorageKey::Schemas,
        StorageKey::UriMetadata,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StorageKey::Environments => "sidelink.environments",
            StorageKey::KafkaClusters => "sidelink.kafka_clusters",
            StorageKey::SchemaRegistries => "sidelink.schema_registries",
            StorageKey::Topics => "sidelink.topics",
            StorageKey::Schemas => "sidelink.schemas",
            StorageKey::UriMetadata => "sidelink.uri_metadata",
        }
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn store_error(err: anyhow::Error) -> SidelinkError {
    SidelinkError::Store(format!("{err:#}"))
}

pub struct ResourceCache {
    store: Arc<dyn KeyValueStore>,
    locks: HashMap<StorageKey, Mutex<()>>,
}

impl ResourceCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        let locks = StorageKey::ALL
            .into_iter()
            .map(|key| (key, Mutex::new(())))
            .collect();
        Self { store, locks }
    }

    fn lock_for(&self, key: StorageKey) -> Result<&Mutex<()>> {
        self.locks.get(&key).ok_or(SidelinkError::MissingMutex(key))
    }

    // -- environments -------------------------------------------------------

    pub async fn environments(&self, connection_id: &str) -> Result<Option<Vec<Environment>>> {
        self.children(StorageKey::Environments, connection_id).await
    }

    pub async fn set_environments(
        &self,
        connection_id: &str,
        environments: Vec<Environment>,
    ) -> Result<()> {
        self.set_children(StorageKey::Environments, connection_id, environments)
            .await
    }

    pub async fn delete_environments(&self, connection_id: Option<&str>) -> Result<()> {
        self.delete_children(StorageKey::Environments, connection_id)
            .await
    }

    // -- kafka clusters -----------------------------------------------------

    pub async fn kafka_clusters(&self, environment_id: &str) -> Result<Option<Vec<KafkaCluster>>> {
        self.children(StorageKey::KafkaClusters, environment_id)
            .await
    }

    pub async fn set_kafka_clusters(
        &self,
        environment_id: &str,
        clusters: Vec<KafkaCluster>,
    ) -> Result<()> {
        self.set_children(StorageKey::KafkaClusters, environment_id, clusters)
            .await
    }

    pub async fn delete_kafka_clusters(&self, environment_id: Option<&str>) -> Result<()> {
        self.delete_children(StorageKey::KafkaClusters, environment_id)
            .await
    }

    // -- schema registries --------------------------------------------------

    pub async fn schema_registries(
        &self,
        environment_id: &str,
    ) -> Result<Option<Vec<SchemaRegistry>>> {
        self.children(StorageKey::SchemaRegistries, environment_id)
            .await
    }

    pub async fn set_schema_registries(
        &self,
        environment_id: &str,
        registries: Vec<SchemaRegistry>,
    ) -> Result<()> {
        self.set_children(StorageKey::SchemaRegistries, environment_id, registries)
            .await
    }

    pub async fn delete_schema_registries(&self, environment_id: Option<&str>) -> Result<()> {
        self.delete_children(StorageKey::SchemaRegistries, environment_id)
            .await
    }

    // -- topics -------------------------------------------------------------

    pub async fn topics_for_cluster(&self, cluster_id: &str) -> Result<Option<Vec<Topic>>> {
        self.children(StorageKey::Topics, cluster_id).await
    }

    pub async fn set_topics_for_cluster(&self, cluster_id: &str, topics: Vec<Topic>) -> Result<()> {
        self.set_children(StorageKey::Topics, cluster_id, topics)
            .await
    }

    pub async fn delete_topics_for_cluster(&self, cluster_id: Option<&str>) -> Result<()> {
        self.delete_children(StorageKey::Topics, cluster_id).await
    }

    // -- schemas ------------------------------------------------------------

    pub async fn schemas_for_registry(&self, registry_id: &str) -> Result<Option<Vec<Schema>>> {
        self.children(StorageKey::Schemas, registry_id).await
    }

    pub async fn set_schemas_for_registry(
        &self,
        registry_id: &str,
        schemas: Vec<Schema>,
    ) -> Result<()> {
        self.set_children(StorageKey::Schemas, registry_id, schemas)
            .await
    }

    pub async fn delete_schemas_for_registry(&self, registry_id: Option<&str>) -> Result<()> {
        self.delete_children(StorageKey::Schemas, registry_id).await
    }

    // -- uri metadata -------------------------------------------------------

    pub async fn uri_metadata(&self, uri: &str) -> Result<Option<UriMetadata>> {
        let all: HashMap<String, UriMetadata> = self.read_map(StorageKey::UriMetadata).await?;
        Ok(all.get(uri).cloned())
    }

    /// Upsert `partial` into the metadata stored for `uri` and return the
    /// resulting map. Keys not named in `partial` are kept.
    pub async fn merge_uri_metadata(&self, uri: &str, partial: UriMetadata) -> Result<UriMetadata> {
        let _guard = self.lock_for(StorageKey::UriMetadata)?.lock().await;
        let mut all: HashMap<String, UriMetadata> = self.read_map(StorageKey::UriMetadata).await?;
        let entry = all.entry(uri.to_string()).or_default();
        entry.extend(partial);
        let merged = entry.clone();
        self.write_map(StorageKey::UriMetadata, &all).await?;
        Ok(merged)
    }

    /// Remove `keys` from the metadata of `uri`. An entry left empty is
    /// removed altogether.
    pub async fn clear_uri_metadata_values(&self, uri: &str, keys: &[&str]) -> Result<()> {
        let _guard = self.lock_for(StorageKey::UriMetadata)?.lock().await;
        let mut all: HashMap<String, UriMetadata> = self.read_map(StorageKey::UriMetadata).await?;
        let Some(entry) = all.get_mut(uri) else {
            return Ok(());
        };
        for key in keys {
            entry.remove(*key);
        }
        if entry.is_empty() {
            all.remove(uri);
        }
        self.write_map(StorageKey::UriMetadata, &all).await
    }

    pub async fn delete_uri_metadata(&self, uri: Option<&str>) -> Result<()> {
        self.delete_children(StorageKey::UriMetadata, uri).await
    }

    // -- shared plumbing ----------------------------------------------------

    async fn children<T: DeserializeOwned>(
        &self,
        key: StorageKey,
        parent: &str,
    ) -> Result<Option<Vec<T>>> {
        let mut all: HashMap<String, Vec<T>> = self.read_map(key).await?;
        Ok(all.remove(parent))
    }

    /// Replace everything listed under `parent` with `children`.
    async fn set_children<T>(&self, key: StorageKey, parent: &str, children: Vec<T>) -> Result<()>
    where
        T: ParentKeyed + Serialize,
    {
        if let Some(stray) = children.iter().find(|c| c.parent_key() != parent) {
            return Err(SidelinkError::ForeignKeyMismatch {
                key,
                expected: parent.to_string(),
                found: stray.parent_key().to_string(),
            });
        }

        let _guard = self.lock_for(key)?.lock().await;
        let mut all: HashMap<String, Value> = self.read_map(key).await?;
        all.insert(parent.to_string(), serde_json::to_value(&children)?);
        debug!(
            storage_key = key.as_str(),
            parent_key = parent,
            count = children.len(),
            "cached resources replaced"
        );
        self.write_map(key, &all).await
    }

    async fn delete_children(&self, key: StorageKey, parent: Option<&str>) -> Result<()> {
        let _guard = self.lock_for(key)?.lock().await;
        match parent {
            None => self.store.delete(key.as_str()).await.map_err(store_error),
            Some(parent) => {
                let mut all: HashMap<String, Value> = self.read_map(key).await?;
                if all.remove(parent).is_none() {
                    return Ok(());
                }
                self.write_map(key, &all).await
            }
        }
    }

    async fn read_map<T: DeserializeOwned>(&self, key: StorageKey) -> Result<HashMap<String, T>> {
        match self.store.get(key.as_str()).await.map_err(store_error)? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(HashMap::new()),
        }
    }

    async fn write_map<T: Serialize>(&self, key: StorageKey, map: &HashMap<String, T>) -> Result<()> {
        if map.is_empty() {
            return self.store.delete(key.as_str()).await.map_err(store_error);
        }
        let value = serde_json::to_value(map)?;
        self.store
            .set(key.as_str(), value)
            .await
            .map_err(store_error)
    }
}
