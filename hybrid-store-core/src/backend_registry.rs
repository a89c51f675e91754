//! Backend registry: owns every backend handle and its connection lifecycle.

use crate::error::{AdapterError, StoreError};
use crate::onlinestore::{OnlineStore, OnlineStoreFactory};
use rustc_hash::FxHashMap as HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

struct BackendSlot {
    factory: Arc<dyn OnlineStoreFactory>,
    handle: OnceCell<Arc<dyn OnlineStore>>,
    closed: AtomicBool,
}

/// Maps logical backend names to lazily connected adapter handles.
///
/// Each name owns at most one live handle. Concurrent first uses of the same name wait on
/// a single connect attempt; a failed attempt is not cached and the next caller retries.
#[derive(Default)]
pub struct BackendRegistry {
    slots: HashMap<String, BackendSlot>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: Arc<dyn OnlineStoreFactory>,
    ) -> Result<(), StoreError> {
        let name = name.into();
        if self.slots.contains_key(&name) {
            return Err(StoreError::DuplicateBackend { name });
        }
        self.slots.insert(
            name,
            BackendSlot {
                factory,
                handle: OnceCell::new(),
                closed: AtomicBool::new(false),
            },
        );
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    pub async fn resolve(&self, name: &str) -> Result<Arc<dyn OnlineStore>, StoreError> {
        let slot = self
            .slots
            .get(name)
            .ok_or_else(|| StoreError::unknown_backend(name))?;
        if slot.closed.load(Ordering::SeqCst) {
            return Err(StoreError::BackendClosed {
                name: name.to_string(),
            });
        }
        let handle = slot
            .handle
            .get_or_try_init(|| async {
                debug!("Connecting backend {}", name);
                slot.factory.connect().await
            })
            .await
            .map(Arc::clone)
            .map_err(|err| {
                warn!("Failed to connect backend {}: {}", name, err);
                StoreError::backend(name, err)
            })?;
        // `close_all` may have run while the connect was in flight and skipped this slot.
        if slot.closed.load(Ordering::SeqCst) {
            if let Err(err) = handle.close().await {
                warn!("Failed to close backend {}: {}", name, err);
            }
            return Err(StoreError::BackendClosed {
                name: name.to_string(),
            });
        }
        Ok(handle)
    }

    /// Health of every backend that has been connected so far.
    pub async fn health_check_all(&self) -> Vec<(String, Result<(), AdapterError>)> {
        let mut report = Vec::new();
        for (name, slot) in &self.slots {
            if slot.closed.load(Ordering::Acquire) {
                continue;
            }
            if let Some(handle) = slot.handle.get() {
                report.push((name.clone(), handle.health_check().await));
            }
        }
        report.sort_by(|a, b| a.0.cmp(&b.0));
        report
    }

    /// Closes every opened handle. All handles get a close attempt; failures are collected
    /// and returned together. A connect still in flight is closed by its own `resolve`
    /// call, so adapter `close` must tolerate being called twice.
    pub async fn close_all(&self) -> Result<(), StoreError> {
        let mut failures = Vec::new();
        for (name, slot) in &self.slots {
            if slot.closed.swap(true, Ordering::SeqCst) {
                continue;
            }
            if let Some(handle) = slot.handle.get() {
                match handle.close().await {
                    Ok(()) => info!("Closed backend {}", name),
                    Err(err) => {
                        warn!("Failed to close backend {}: {}", name, err);
                        failures.push((name.clone(), err));
                    }
                }
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            failures.sort_by(|a, b| a.0.cmp(&b.0));
            Err(StoreError::Teardown { failures })
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::{FeatureRef, FeatureView, HashEntityKey, OnlineStoreRow, ReadResult};
    use crate::onlinestore::memory::MemoryOnlineStore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Memory store whose close call can be made to fail.
    pub(crate) struct FailingClose(pub MemoryOnlineStore);

    #[async_trait]
    impl OnlineStore for FailingClose {
        async fn get_feature_values(
            &self,
            keys: &[HashEntityKey],
            features: &[FeatureRef],
        ) -> Result<Vec<ReadResult>, AdapterError> {
            self.0.get_feature_values(keys, features).await
        }

        async fn put_feature_values(
            &self,
            rows: Vec<OnlineStoreRow>,
        ) -> Result<usize, AdapterError> {
            self.0.put_feature_values(rows).await
        }

        async fn delete_entities(
            &self,
            feature_view: &FeatureView,
            keys: &[HashEntityKey],
        ) -> Result<(), AdapterError> {
            self.0.delete_entities(feature_view, keys).await
        }

        async fn drop_feature_view(&self, feature_view: &FeatureView) -> Result<(), AdapterError> {
            self.0.drop_feature_view(feature_view).await
        }

        async fn health_check(&self) -> Result<(), AdapterError> {
            self.0.health_check().await
        }

        async fn close(&self) -> Result<(), AdapterError> {
            Err(AdapterError::connection("socket already gone"))
        }
    }

    pub(crate) struct CountingFactory {
        pub connects: AtomicUsize,
        pub fail_close: bool,
        pub connect_delay: Duration,
    }

    impl CountingFactory {
        pub(crate) fn new() -> Self {
            Self {
                connects: AtomicUsize::new(0),
                fail_close: false,
                connect_delay: Duration::from_millis(0),
            }
        }
    }

    #[async_trait]
    impl OnlineStoreFactory for CountingFactory {
        async fn connect(&self) -> Result<Arc<dyn OnlineStore>, AdapterError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.connect_delay).await;
            if self.fail_close {
                Ok(Arc::new(FailingClose(MemoryOnlineStore::default())))
            } else {
                Ok(Arc::new(MemoryOnlineStore::default()))
            }
        }
    }

    struct RefusingFactory {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl OnlineStoreFactory for RefusingFactory {
        async fn connect(&self) -> Result<Arc<dyn OnlineStore>, AdapterError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(AdapterError::connection("connection refused"))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_resolve_connects_once() -> Result<(), StoreError> {
        let factory = Arc::new(CountingFactory {
            connect_delay: Duration::from_millis(50),
            ..CountingFactory::new()
        });
        let mut registry = BackendRegistry::new();
        registry.register("redis", factory.clone())?;
        let registry = Arc::new(registry);

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..32 {
            let registry = registry.clone();
            tasks.spawn(async move { registry.resolve("redis").await.map(|_| ()) });
        }
        while let Some(res) = tasks.join_next().await {
            res.expect("resolve task panicked")?;
        }
        assert_eq!(factory.connects.load(Ordering::SeqCst), 1);

        let first = registry.resolve("redis").await?;
        let second = registry.resolve("redis").await?;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(factory.connects.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn failed_connect_is_retried() -> Result<(), StoreError> {
        let factory = Arc::new(RefusingFactory {
            attempts: AtomicUsize::new(0),
        });
        let mut registry = BackendRegistry::new();
        registry.register("redis", factory.clone())?;
        for _ in 0..2 {
            let err = registry.resolve("redis").await.err().expect("connect must fail");
            assert!(err.is_retryable());
        }
        assert_eq!(factory.attempts.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn connect_racing_close_all_is_closed() -> Result<(), StoreError> {
        let factory = Arc::new(CountingFactory {
            connect_delay: Duration::from_millis(50),
            ..CountingFactory::new()
        });
        let mut registry = BackendRegistry::new();
        registry.register("sqlite", factory.clone())?;
        let registry = Arc::new(registry);

        let pending = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.resolve("sqlite").await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        registry.close_all().await?;

        let resolved = pending.await.expect("resolve task panicked");
        assert!(matches!(resolved, Err(StoreError::BackendClosed { .. })));
        assert_eq!(factory.connects.load(Ordering::SeqCst), 1);
        let handle = registry.slots["sqlite"]
            .handle
            .get()
            .expect("connect finished after close_all");
        assert!(handle.health_check().await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn unknown_and_duplicate_backends() {
        let mut registry = BackendRegistry::new();
        registry
            .register("memory", Arc::new(CountingFactory::new()))
            .unwrap();
        assert!(matches!(
            registry.register("memory", Arc::new(CountingFactory::new())),
            Err(StoreError::DuplicateBackend { .. })
        ));
        assert!(matches!(
            registry.resolve("redis").await,
            Err(StoreError::UnknownBackend { .. })
        ));
    }

    #[tokio::test]
    async fn close_all_attempts_every_backend() -> Result<(), StoreError> {
        let failing = Arc::new(CountingFactory {
            fail_close: true,
            ..CountingFactory::new()
        });
        let healthy = Arc::new(CountingFactory::new());
        let never_used = Arc::new(CountingFactory::new());
        let mut registry = BackendRegistry::new();
        registry.register("a_failing", failing)?;
        registry.register("b_healthy", healthy)?;
        registry.register("c_unused", never_used.clone())?;

        let healthy_handle = registry.resolve("b_healthy").await?;
        registry.resolve("a_failing").await?;
        assert_eq!(registry.health_check_all().await.len(), 2);

        match registry.close_all().await {
            Err(StoreError::Teardown { failures }) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].0, "a_failing");
            }
            other => panic!("unexpected close result {:?}", other),
        }
        assert!(healthy_handle.health_check().await.is_err());
        assert_eq!(never_used.connects.load(Ordering::SeqCst), 0);
        assert!(matches!(
            registry.resolve("b_healthy").await,
            Err(StoreError::BackendClosed { .. })
        ));
        registry.close_all().await?;
        Ok(())
    }
}
