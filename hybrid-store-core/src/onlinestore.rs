//! Backend adapters: one uniform capability interface over each concrete key-value store.

pub mod memory;
mod redis;
pub mod sqlite_onlinestore;

use crate::config::BackendConfig;
use crate::error::AdapterError;
use crate::model::{FeatureRef, FeatureView, HashEntityKey, OnlineStoreRow, ReadResult};
use crate::onlinestore::memory::MemoryOnlineStore;
use crate::onlinestore::sqlite_onlinestore::{ConnectionOptions, SqliteOnlineStore};
use crate::types::Value;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait OnlineStore: Send + Sync + 'static {
    /// Returns exactly `keys.len() * features.len()` rows, key-major, in request order.
    /// Values the backend does not hold come back as `NotFound` rows.
    async fn get_feature_values(
        &self,
        keys: &[HashEntityKey],
        features: &[FeatureRef],
    ) -> Result<Vec<ReadResult>, AdapterError>;

    /// Upserts the rows and returns how many were written.
    async fn put_feature_values(&self, rows: Vec<OnlineStoreRow>) -> Result<usize, AdapterError>;

    async fn delete_entities(
        &self,
        feature_view: &FeatureView,
        keys: &[HashEntityKey],
    ) -> Result<(), AdapterError>;

    /// Removes everything stored for the feature view.
    async fn drop_feature_view(&self, feature_view: &FeatureView) -> Result<(), AdapterError>;

    async fn health_check(&self) -> Result<(), AdapterError>;

    async fn close(&self) -> Result<(), AdapterError>;
}

/// Opens a connection to one backend. Invoked at most once per live handle by the
/// backend registry.
#[async_trait]
pub trait OnlineStoreFactory: Send + Sync + 'static {
    async fn connect(&self) -> Result<Arc<dyn OnlineStore>, AdapterError>;
}

/// Factory for the backend kinds that can be declared in `feature_store.yaml`.
#[derive(Debug, Clone)]
pub struct ConfiguredBackend {
    project: String,
    config: BackendConfig,
    cwd: Option<String>,
}

impl ConfiguredBackend {
    pub fn new(project: impl Into<String>, config: BackendConfig, cwd: Option<&str>) -> Self {
        Self {
            project: project.into(),
            config,
            cwd: cwd.map(str::to_owned),
        }
    }
}

#[async_trait]
impl OnlineStoreFactory for ConfiguredBackend {
    async fn connect(&self) -> Result<Arc<dyn OnlineStore>, AdapterError> {
        match &self.config {
            BackendConfig::Memory => {
                debug!("Create in-memory online store");
                Ok(Arc::new(MemoryOnlineStore::default()))
            }
            BackendConfig::Sqlite {
                path,
                max_connections,
            } => {
                let full_path = match &self.cwd {
                    Some(prefix) if !path.starts_with('/') => format!("{}/{}", prefix, path),
                    _ => path.clone(),
                };
                debug!("Create SQLite online store with path: {}", full_path);
                let mut options = ConnectionOptions::default();
                if let Some(max_connections) = max_connections {
                    options = options.with_max_connections(*max_connections);
                }
                SqliteOnlineStore::from_options(&full_path, self.project.clone(), options)
                    .await
                    .map(|sqlite| Arc::new(sqlite) as Arc<dyn OnlineStore>)
            }
            BackendConfig::Redis {
                redis_type,
                connection_string,
                key_ttl_seconds,
            } => {
                debug!("Create Redis online store");
                redis::new(
                    self.project.clone(),
                    redis_type.clone(),
                    connection_string,
                    *key_ttl_seconds,
                )
                .await
            }
        }
    }
}

/// Builds the key-major result grid for `keys` x `features`, asking `lookup` for each cell.
pub(crate) fn assemble_rows<F>(
    keys: &[HashEntityKey],
    features: &[FeatureRef],
    mut lookup: F,
) -> Vec<ReadResult>
where
    F: FnMut(usize, &FeatureRef) -> Option<(Value, DateTime<Utc>)>,
{
    let mut rows = Vec::with_capacity(keys.len() * features.len());
    for (key_index, key) in keys.iter().enumerate() {
        for feature in features {
            let row = match lookup(key_index, feature) {
                Some((value, event_ts)) => {
                    ReadResult::present(key.clone(), feature.clone(), value, event_ts)
                }
                None => ReadResult::not_found(key.clone(), feature.clone()),
            };
            rows.push(row);
        }
    }
    rows
}
