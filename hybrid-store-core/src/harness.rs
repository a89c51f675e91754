//! Provisioning of throwaway hybrid stores for integration tests.

use crate::config::{BackendConfig, FeatureViewConfig, HybridStoreConfig, RepoConfig};
use crate::hybrid_store::HybridOnlineStore;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, warn};

/// Tag a feature view carries to be routed somewhere other than the in-memory default.
pub const ROUTING_TAG: &str = "online_store";
pub const MEMORY_BACKEND: &str = "memory";
pub const SQLITE_BACKEND: &str = "sqlite";

#[async_trait]
pub trait OnlineStoreCreator: Send + Sync {
    async fn create(
        &mut self,
        feature_views: Vec<FeatureViewConfig>,
    ) -> Result<Arc<HybridOnlineStore>>;

    async fn teardown(&mut self) -> Result<()>;
}

/// Creates a store with an in-memory default backend and an SQLite backend backed by a
/// file in a fresh temporary directory. Views tagged `online_store: sqlite` go to SQLite.
pub struct HybridOnlineStoreCreator {
    project: String,
    dir: Option<TempDir>,
    store: Option<Arc<HybridOnlineStore>>,
}

impl HybridOnlineStoreCreator {
    pub fn new(project: &str) -> Self {
        Self {
            project: project.to_string(),
            dir: None,
            store: None,
        }
    }

    pub fn boxed(project: &str) -> Box<dyn OnlineStoreCreator> {
        Box::new(Self::new(project))
    }

    fn repo_config(
        &self,
        sqlite_path: String,
        feature_views: Vec<FeatureViewConfig>,
    ) -> RepoConfig {
        RepoConfig {
            project: self.project.clone(),
            online_store: HybridStoreConfig {
                default_backend: Some(MEMORY_BACKEND.to_string()),
                routing_tag: Some(ROUTING_TAG.to_string()),
                backends: BTreeMap::from([
                    (MEMORY_BACKEND.to_string(), BackendConfig::Memory),
                    (
                        SQLITE_BACKEND.to_string(),
                        BackendConfig::Sqlite {
                            path: sqlite_path,
                            max_connections: Some(4),
                        },
                    ),
                ]),
                ..Default::default()
            },
            feature_views,
        }
    }
}

#[async_trait]
impl OnlineStoreCreator for HybridOnlineStoreCreator {
    async fn create(
        &mut self,
        feature_views: Vec<FeatureViewConfig>,
    ) -> Result<Arc<HybridOnlineStore>> {
        if self.store.is_some() {
            return Err(anyhow!("Store for project {} already created", self.project));
        }
        let dir = tempfile::Builder::new()
            .prefix("hybrid-store-")
            .tempdir()
            .context("Failed to create temporary directory")?;
        let sqlite_path = dir.path().join("online_store.db");
        let sqlite_path = sqlite_path
            .to_str()
            .ok_or_else(|| anyhow!("Temporary path {:?} is not valid UTF-8", sqlite_path))?
            .to_string();
        debug!("Provisioning hybrid store with SQLite file {}", sqlite_path);

        let config = self.repo_config(sqlite_path, feature_views);
        let store = Arc::new(HybridOnlineStore::from_config(&config, None)?);
        self.dir = Some(dir);
        self.store = Some(store.clone());
        Ok(store)
    }

    async fn teardown(&mut self) -> Result<()> {
        let store_result = match self.store.take() {
            Some(store) => store.teardown().await.map_err(anyhow::Error::from),
            None => Ok(()),
        };
        let dir_result = match self.dir.take() {
            Some(dir) => dir.close().context("Failed to remove temporary directory"),
            None => Ok(()),
        };
        store_result.and(dir_result)
    }
}

/// One backend setup the integration suite runs against.
#[derive(Clone, Copy)]
pub struct IntegrationTestRepoConfig {
    pub online_store_creator: fn(&str) -> Box<dyn OnlineStoreCreator>,
}

pub fn full_repo_configs() -> Vec<IntegrationTestRepoConfig> {
    vec![IntegrationTestRepoConfig {
        online_store_creator: HybridOnlineStoreCreator::boxed,
    }]
}

/// Creates a store, runs `test` against it and tears it down whether or not the test
/// returned an error. The test's own error takes precedence over a teardown failure.
pub async fn run_with_online_store<F, Fut, T>(
    config: &IntegrationTestRepoConfig,
    project: &str,
    feature_views: Vec<FeatureViewConfig>,
    test: F,
) -> Result<T>
where
    F: FnOnce(Arc<HybridOnlineStore>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut creator = (config.online_store_creator)(project);
    let store = match creator.create(feature_views).await {
        Ok(store) => store,
        Err(err) => {
            if let Err(teardown_err) = creator.teardown().await {
                warn!("Teardown after failed create also failed: {:#}", teardown_err);
            }
            return Err(err);
        }
    };
    let outcome = test(store).await;
    let teardown = creator.teardown().await;
    match (outcome, teardown) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) => Err(err),
        (Err(err), teardown) => {
            if let Err(teardown_err) = teardown {
                warn!("Teardown after failed test also failed: {:#}", teardown_err);
            }
            Err(err)
        }
    }
}
