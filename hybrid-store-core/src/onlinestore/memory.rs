use crate::error::AdapterError;
use crate::model::{FeatureRef, FeatureView, HashEntityKey, OnlineStoreRow, ReadResult};
use crate::onlinestore::{OnlineStore, assemble_rows};
use crate::types::Value;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap as HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

type StoredFeatures = HashMap<Arc<str>, (Value, DateTime<Utc>)>;

/// Process-local backend. Every view's rows live in one map keyed by (view, entity key).
#[derive(Default)]
pub struct MemoryOnlineStore {
    data: RwLock<HashMap<(Arc<str>, HashEntityKey), StoredFeatures>>,
    closed: AtomicBool,
}

impl MemoryOnlineStore {
    fn ensure_open(&self) -> Result<(), AdapterError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AdapterError::connection("in-memory store is closed"));
        }
        Ok(())
    }

    /// Number of (view, entity) rows currently held.
    pub fn len(&self) -> usize {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl OnlineStore for MemoryOnlineStore {
    async fn get_feature_values(
        &self,
        keys: &[HashEntityKey],
        features: &[FeatureRef],
    ) -> Result<Vec<ReadResult>, AdapterError> {
        self.ensure_open()?;
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        Ok(assemble_rows(keys, features, |key_index, feature| {
            data.get(&(feature.feature_view_name.clone(), keys[key_index].clone()))
                .and_then(|stored| stored.get(&feature.feature_name))
                .cloned()
        }))
    }

    async fn put_feature_values(&self, rows: Vec<OnlineStoreRow>) -> Result<usize, AdapterError> {
        self.ensure_open()?;
        let written = rows.len();
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        for row in rows {
            data.entry((row.feature.feature_view_name, row.entity_key))
                .or_default()
                .insert(row.feature.feature_name, (row.value, row.event_ts));
        }
        Ok(written)
    }

    async fn delete_entities(
        &self,
        feature_view: &FeatureView,
        keys: &[HashEntityKey],
    ) -> Result<(), AdapterError> {
        self.ensure_open()?;
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        for key in keys {
            data.remove(&(feature_view.name.clone(), key.clone()));
        }
        Ok(())
    }

    async fn drop_feature_view(&self, feature_view: &FeatureView) -> Result<(), AdapterError> {
        self.ensure_open()?;
        self.data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(view, _), _| *view != feature_view.name);
        Ok(())
    }

    async fn health_check(&self) -> Result<(), AdapterError> {
        self.ensure_open()
    }

    async fn close(&self) -> Result<(), AdapterError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FeatureStatus;
    use crate::types::EntityKey;
    use crate::types::value::Val;

    fn driver(id: i64) -> HashEntityKey {
        EntityKey::new([("driver_id", Val::Int64Val(id).into())]).into()
    }

    #[tokio::test]
    async fn put_then_get() -> Result<(), AdapterError> {
        let store = MemoryOnlineStore::default();
        let conv_rate = FeatureRef::new("driver_hourly_stats", "conv_rate");
        let acc_rate = FeatureRef::new("driver_hourly_stats", "acc_rate");
        let ts = Utc::now();
        store
            .put_feature_values(vec![OnlineStoreRow::new(
                driver(1005),
                conv_rate.clone(),
                Val::DoubleVal(0.5).into(),
                ts,
            )])
            .await?;

        let keys = vec![driver(1005), driver(1002)];
        let rows = store
            .get_feature_values(&keys, &[conv_rate, acc_rate])
            .await?;
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].status, FeatureStatus::Present);
        assert_eq!(rows[0].value, Val::DoubleVal(0.5).into());
        assert_eq!(rows[0].event_ts, Some(ts));
        assert!(rows[1..].iter().all(|row| row.status == FeatureStatus::NotFound));
        Ok(())
    }

    #[tokio::test]
    async fn compound_keys_match_in_any_join_key_order() -> Result<(), AdapterError> {
        let store = MemoryOnlineStore::default();
        let trips = FeatureRef::new("pair_stats", "trips");
        let written: HashEntityKey = EntityKey::new([
            ("a", Val::Int64Val(1).into()),
            ("b", Val::Int64Val(2).into()),
        ])
        .into();
        let reversed: HashEntityKey = EntityKey::new([
            ("b", Val::Int64Val(2).into()),
            ("a", Val::Int64Val(1).into()),
        ])
        .into();
        store
            .put_feature_values(vec![OnlineStoreRow::new(
                written,
                trips.clone(),
                Val::Int32Val(7).into(),
                Utc::now(),
            )])
            .await?;

        let rows = store.get_feature_values(&[reversed.clone()], &[trips]).await?;
        assert_eq!(rows[0].status, FeatureStatus::Present);
        assert_eq!(rows[0].value, Val::Int32Val(7).into());

        store
            .delete_entities(&FeatureView::new("pair_stats"), &[reversed])
            .await?;
        assert!(store.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn drop_view_keeps_other_views() -> Result<(), AdapterError> {
        let store = MemoryOnlineStore::default();
        let ts = Utc::now();
        store
            .put_feature_values(vec![
                OnlineStoreRow::new(
                    driver(1),
                    FeatureRef::new("a", "x"),
                    Val::Int64Val(1).into(),
                    ts,
                ),
                OnlineStoreRow::new(
                    driver(1),
                    FeatureRef::new("b", "y"),
                    Val::Int64Val(2).into(),
                    ts,
                ),
            ])
            .await?;
        store.drop_feature_view(&FeatureView::new("a")).await?;
        assert_eq!(store.len(), 1);
        store.delete_entities(&FeatureView::new("b"), &[driver(1)]).await?;
        assert!(store.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn closed_store_rejects_calls() {
        let store = MemoryOnlineStore::default();
        store.close().await.unwrap();
        let err = store.health_check().await.unwrap_err();
        assert!(err.is_retryable());
    }
}
