//! The hybrid online store: one `OnlineStore`-shaped surface over several backends.
//!
//! Each request is split by backend using the routing table, every backend's share runs
//! concurrently, and the results are merged back into the caller's order.

use crate::backend_registry::BackendRegistry;
use crate::config::{DEFAULT_BATCH_SIZE, RepoConfig};
use crate::coordinator::BatchCoordinator;
use crate::error::{AdapterError, StoreError};
use crate::model::{
    FeatureRef, FeatureStatus, FeatureView, HashEntityKey, OnlineStoreRow, ReadResult,
};
use crate::onlinestore::ConfiguredBackend;
use crate::routing::RoutingTable;
use crate::types::EntityKey;
use chrono::Utc;
use rustc_hash::FxHashMap as HashMap;
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub use crate::coordinator::{BackendWriteOutcome, WriteReport};

/// Feature positions (indices into the request) served by one backend.
type FeatureIndices = SmallVec<[usize; 8]>;

#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    pub batch_size: usize,
    pub read_timeout: Option<Duration>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            read_timeout: None,
        }
    }
}

pub struct HybridOnlineStore {
    registry: Arc<BackendRegistry>,
    routing: RoutingTable,
    feature_views: HashMap<Arc<str>, FeatureView>,
    coordinator: BatchCoordinator,
}

impl HybridOnlineStore {
    /// Fails if the routing table points at a backend the registry does not know.
    pub fn new(
        registry: BackendRegistry,
        routing: RoutingTable,
        feature_views: Vec<FeatureView>,
        options: StoreOptions,
    ) -> Result<Self, StoreError> {
        routing.validate(|name| registry.contains(name))?;
        let feature_views = feature_views
            .into_iter()
            .map(|view| (view.name.clone(), view))
            .collect();
        Ok(Self {
            registry: Arc::new(registry),
            routing,
            feature_views,
            coordinator: BatchCoordinator::new(options.batch_size, options.read_timeout),
        })
    }

    /// Builds the store from a parsed repository config. Relative SQLite paths are resolved
    /// against `cwd` when given. No backend is contacted until first use.
    pub fn from_config(config: &RepoConfig, cwd: Option<&str>) -> Result<Self, StoreError> {
        config.validate()?;
        let store_config = &config.online_store;
        let mut registry = BackendRegistry::new();
        for (name, backend) in &store_config.backends {
            registry.register(
                name.clone(),
                Arc::new(ConfiguredBackend::new(
                    config.project.clone(),
                    backend.clone(),
                    cwd,
                )),
            )?;
        }
        let feature_views = config.feature_views();
        let routing = RoutingTable::from_config(
            &store_config.bindings,
            &feature_views,
            store_config.routing_tag.as_deref(),
            store_config.default_backend.clone(),
        );
        info!(
            "Hybrid store for project {} with backends [{}]",
            config.project,
            store_config
                .backends
                .keys()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        );
        Self::new(
            registry,
            routing,
            feature_views,
            StoreOptions {
                batch_size: store_config.batch_size,
                read_timeout: store_config.read_timeout_ms.map(Duration::from_millis),
            },
        )
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn feature_view(&self, name: &str) -> Option<&FeatureView> {
        self.feature_views.get(name)
    }

    pub fn feature_views(&self) -> impl Iterator<Item = &FeatureView> {
        self.feature_views.values()
    }

    /// Routes every distinct view in `views`, returning all unroutable ones together.
    fn route_all<'a>(
        &self,
        views: impl IntoIterator<Item = &'a str>,
    ) -> Result<HashMap<&'a str, &str>, StoreError> {
        let mut routes = HashMap::default();
        let mut unroutable = Vec::new();
        for view in views {
            if routes.contains_key(view) {
                continue;
            }
            match self.routing.route(view) {
                Ok(backend) => {
                    routes.insert(view, backend);
                }
                Err(_) => unroutable.push(view.to_string()),
            }
        }
        if unroutable.is_empty() {
            Ok(routes)
        } else {
            Err(StoreError::unroutable(unroutable))
        }
    }

    /// Reads every requested feature for every entity key.
    ///
    /// The result holds `entity_keys.len() * features.len()` rows, key-major: the row for
    /// key `i` and feature `j` sits at `i * features.len() + j`. A failing or slow backend
    /// only marks its own rows as `BackendError`; the call itself fails only when a view
    /// cannot be routed.
    pub async fn online_read(
        &self,
        entity_keys: Vec<EntityKey>,
        features: &[FeatureRef],
    ) -> Result<Vec<ReadResult>, StoreError> {
        let routes = self.route_all(features.iter().map(|f| f.feature_view_name.as_ref()))?;
        if entity_keys.is_empty() || features.is_empty() {
            return Ok(Vec::new());
        }

        let mut groups: Vec<(&str, FeatureIndices)> = Vec::new();
        for (index, feature) in features.iter().enumerate() {
            let backend = routes[feature.feature_view_name.as_ref()];
            match groups.iter_mut().find(|(name, _)| *name == backend) {
                Some((_, indices)) => indices.push(index),
                None => groups.push((backend, SmallVec::from_elem(index, 1))),
            }
        }
        debug!(
            "Reading {} keys x {} features across {} backends",
            entity_keys.len(),
            features.len(),
            groups.len()
        );

        let keys: Arc<Vec<HashEntityKey>> =
            Arc::new(entity_keys.into_iter().map(HashEntityKey::from).collect());
        let requests = groups
            .iter()
            .map(|(backend, indices)| {
                (
                    backend.to_string(),
                    indices.iter().map(|&i| features[i].clone()).collect(),
                )
            })
            .collect();
        let outcomes = self.coordinator.read(&self.registry, &keys, requests).await;

        let feature_count = features.len();
        let mut slots: Vec<Option<ReadResult>> = vec![None; keys.len() * feature_count];
        for ((_, indices), (_, outcome)) in groups.iter().zip(outcomes) {
            match outcome {
                Ok(rows) => {
                    for (position, row) in rows.into_iter().enumerate() {
                        let key_index = position / indices.len();
                        let feature_index = indices[position % indices.len()];
                        slots[key_index * feature_count + feature_index] = Some(row);
                    }
                }
                Err(message) => {
                    for (key_index, key) in keys.iter().enumerate() {
                        for &feature_index in indices {
                            slots[key_index * feature_count + feature_index] =
                                Some(ReadResult::backend_error(
                                    key.clone(),
                                    features[feature_index].clone(),
                                    message.clone(),
                                ));
                        }
                    }
                }
            }
        }

        let now = Utc::now();
        Ok(slots
            .into_iter()
            .enumerate()
            .map(|(position, slot)| {
                let mut row = slot.unwrap_or_else(|| {
                    ReadResult::backend_error(
                        keys[position / feature_count].clone(),
                        features[position % feature_count].clone(),
                        Arc::from("backend returned no row"),
                    )
                });
                if row.status == FeatureStatus::Present
                    && let Some(event_ts) = row.event_ts
                    && let Some(view) = self.feature_views.get(&row.feature.feature_view_name)
                    && view.is_expired(event_ts, now)
                {
                    row.status = FeatureStatus::OutsideMaxAge;
                }
                row
            })
            .collect())
    }

    fn check_schema(&self, row: &OnlineStoreRow, problems: &mut Vec<String>) {
        let Some(view) = self.feature_views.get(&row.feature.feature_view_name) else {
            return;
        };
        if view.features.is_empty() {
            return;
        }
        match view.field(&row.feature.feature_name) {
            None => problems.push(format!(
                "feature '{}' is not declared in feature view '{}'",
                row.feature.feature_name, view.name
            )),
            Some(field) => {
                if let (Some(expected), Some(actual)) = (field.value_type, row.value.value_type())
                    && expected != actual
                {
                    problems.push(format!(
                        "feature '{}' expects {:?} but got {:?}",
                        row.feature, expected, actual
                    ));
                }
            }
        }
    }

    /// Writes rows to the backends their views are routed to.
    ///
    /// Routing and declared field types are checked for every row before anything is
    /// written. Backends are written independently; if any of them fails the call returns
    /// `StoreError::PartialWrite` carrying the per-backend report, and rows already written
    /// elsewhere stay written.
    pub async fn online_write(&self, rows: Vec<OnlineStoreRow>) -> Result<WriteReport, StoreError> {
        if rows.is_empty() {
            return Ok(WriteReport::default());
        }
        let routes = self.route_all(rows.iter().map(|row| row.feature.feature_view_name.as_ref()))?;
        let mut problems = Vec::new();
        for row in &rows {
            self.check_schema(row, &mut problems);
        }
        if !problems.is_empty() {
            problems.sort();
            problems.dedup();
            return Err(StoreError::Schema { problems });
        }

        let mut batch_index: HashMap<&str, usize> = HashMap::default();
        let mut batches: Vec<(String, Vec<OnlineStoreRow>)> = Vec::new();
        let assignments: Vec<usize> = rows
            .iter()
            .map(|row| {
                let backend = routes[row.feature.feature_view_name.as_ref()];
                *batch_index.entry(backend).or_insert_with(|| {
                    batches.push((backend.to_string(), Vec::new()));
                    batches.len() - 1
                })
            })
            .collect();
        for (row, batch) in rows.into_iter().zip(assignments) {
            batches[batch].1.push(row);
        }

        let report = self.coordinator.write(&self.registry, batches).await;
        if report.is_success() {
            debug!("Wrote {} rows", report.rows_written());
            Ok(report)
        } else {
            Err(StoreError::PartialWrite(report))
        }
    }

    /// Removes every feature of `feature_view_name` for the given entities.
    pub async fn delete_entities(
        &self,
        feature_view_name: &str,
        entity_keys: Vec<EntityKey>,
    ) -> Result<(), StoreError> {
        let backend = self.routing.route(feature_view_name)?;
        let view = self.lookup_view(feature_view_name);
        let keys: Vec<HashEntityKey> = entity_keys.into_iter().map(HashEntityKey::from).collect();
        let store = self.registry.resolve(backend).await?;
        store
            .delete_entities(&view, &keys)
            .await
            .map_err(|err| StoreError::backend(backend, err))
    }

    fn lookup_view(&self, name: &str) -> FeatureView {
        self.feature_views
            .get(name)
            .cloned()
            .unwrap_or_else(|| FeatureView::new(name))
    }

    /// Drops the stored data of `views_to_delete` on whichever backend each is routed to.
    /// Every view gets a drop attempt; failures are returned together.
    pub async fn update(&self, views_to_delete: &[FeatureView]) -> Result<(), StoreError> {
        let routes = self.route_all(views_to_delete.iter().map(|view| view.name.as_ref()))?;
        let mut failures: Vec<(String, AdapterError)> = Vec::new();
        for view in views_to_delete {
            let backend = routes[view.name.as_ref()];
            let result = match self.registry.resolve(backend).await {
                Ok(store) => store.drop_feature_view(view).await,
                Err(StoreError::Backend { source, .. }) => Err(source),
                Err(err) => Err(AdapterError::connection(err.to_string())),
            };
            match result {
                Ok(()) => info!("Dropped feature view {} on backend {}", view.name, backend),
                Err(err) => {
                    warn!(
                        "Failed to drop feature view {} on backend {}: {}",
                        view.name, backend, err
                    );
                    failures.push((backend.to_string(), err));
                }
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(StoreError::Teardown { failures })
        }
    }

    /// Drops every known feature view and closes all backends.
    pub async fn teardown(&self) -> Result<(), StoreError> {
        let mut views: Vec<FeatureView> = self
            .feature_views
            .values()
            .filter(|view| self.routing.route(&view.name).is_ok())
            .cloned()
            .collect();
        views.sort_by(|a, b| a.name.cmp(&b.name));
        let mut failures = match self.update(&views).await {
            Ok(()) => Vec::new(),
            Err(StoreError::Teardown { failures }) => failures,
            Err(err) => return Err(err),
        };
        if let Err(StoreError::Teardown { failures: close_failures }) = self.close().await {
            failures.extend(close_failures);
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(StoreError::Teardown { failures })
        }
    }

    /// Health of every backend connected so far.
    pub async fn health_check(&self) -> Vec<(String, Result<(), AdapterError>)> {
        self.registry.health_check_all().await
    }

    pub async fn close(&self) -> Result<(), StoreError> {
        self.registry.close_all().await
    }
}
