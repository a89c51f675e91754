use anyhow::Result;
use chrono::{DateTime, Utc};
use hybrid_store_core::config::{FeatureViewConfig, FieldConfig};
use hybrid_store_core::error::StoreError;
use hybrid_store_core::harness::{
    ROUTING_TAG, SQLITE_BACKEND, full_repo_configs, run_with_online_store,
};
use hybrid_store_core::model::{FeatureRef, FeatureStatus, OnlineStoreRow};
use hybrid_store_core::types::value::Val;
use hybrid_store_core::types::{EntityKey, Value, ValueType};
use std::collections::HashMap;

fn feature_views() -> Vec<FeatureViewConfig> {
    vec![
        FeatureViewConfig {
            name: "driver_hourly_stats".to_string(),
            backend: None,
            ttl_seconds: Some(86400),
            tags: HashMap::from([(ROUTING_TAG.to_string(), SQLITE_BACKEND.to_string())]),
            features: vec![
                FieldConfig {
                    name: "conv_rate".to_string(),
                    dtype: Some(ValueType::Double),
                },
                FieldConfig {
                    name: "trips_today".to_string(),
                    dtype: Some(ValueType::Int64),
                },
            ],
        },
        FeatureViewConfig {
            name: "driver_session".to_string(),
            backend: None,
            ttl_seconds: None,
            tags: HashMap::new(),
            features: vec![],
        },
    ]
}

fn driver(id: i64) -> EntityKey {
    EntityKey::new([("driver_id", Value::from(Val::Int64Val(id)))])
}

fn row(id: i64, feature: &FeatureRef, val: Val, event_ts: DateTime<Utc>) -> OnlineStoreRow {
    OnlineStoreRow::new(driver(id), feature.clone(), Value::from(val), event_ts)
}

#[tokio::test]
async fn round_trip_across_sqlite_and_memory() -> Result<()> {
    for config in full_repo_configs() {
        run_with_online_store(&config, "integration", feature_views(), |store| async move {
            let conv_rate = FeatureRef::new("driver_hourly_stats", "conv_rate");
            let trips = FeatureRef::new("driver_hourly_stats", "trips_today");
            let session = FeatureRef::new("driver_session", "last_city");
            let now = Utc::now();

            let report = store
                .online_write(vec![
                    row(1001, &conv_rate, Val::DoubleVal(0.5), now),
                    row(1001, &trips, Val::Int64Val(7), now),
                    row(1002, &conv_rate, Val::DoubleVal(0.9), now),
                    row(1001, &session, Val::StringVal("Lisbon".to_string()), now),
                ])
                .await?;
            assert!(report.is_success());
            assert_eq!(report.rows_written(), 4);

            let features = vec![session.clone(), conv_rate.clone(), trips.clone()];
            let result = store
                .online_read(vec![driver(1002), driver(1001)], &features)
                .await?;
            assert_eq!(result.len(), 6);
            let statuses: Vec<FeatureStatus> = result.iter().map(|r| r.status).collect();
            assert_eq!(
                statuses,
                vec![
                    FeatureStatus::NotFound,
                    FeatureStatus::Present,
                    FeatureStatus::NotFound,
                    FeatureStatus::Present,
                    FeatureStatus::Present,
                    FeatureStatus::Present,
                ]
            );
            assert_eq!(result[1].value, Value::from(Val::DoubleVal(0.9)));
            assert_eq!(result[3].value, Value::from(Val::StringVal("Lisbon".to_string())));
            assert_eq!(result[5].value, Value::from(Val::Int64Val(7)));

            let health = store.health_check().await;
            assert!(health.iter().all(|(_, status)| status.is_ok()));
            Ok::<_, anyhow::Error>(())
        })
        .await?;
    }
    Ok(())
}

#[tokio::test]
async fn stale_sqlite_values_are_outside_max_age() -> Result<()> {
    for config in full_repo_configs() {
        run_with_online_store(&config, "integration_ttl", feature_views(), |store| async move {
            let conv_rate = FeatureRef::new("driver_hourly_stats", "conv_rate");
            let stale = Utc::now() - chrono::Duration::days(3);
            store
                .online_write(vec![row(1, &conv_rate, Val::DoubleVal(0.1), stale)])
                .await?;
            let result = store.online_read(vec![driver(1)], &[conv_rate]).await?;
            assert_eq!(result[0].status, FeatureStatus::OutsideMaxAge);
            let two_days_ago = Utc::now() - chrono::Duration::days(2);
            assert!(result[0].event_ts.is_some_and(|ts| ts < two_days_ago));
            Ok::<_, anyhow::Error>(())
        })
        .await?;
    }
    Ok(())
}

#[tokio::test]
async fn mistyped_rows_are_rejected_before_writing() -> Result<()> {
    for config in full_repo_configs() {
        run_with_online_store(&config, "integration_schema", feature_views(), |store| async move {
            let conv_rate = FeatureRef::new("driver_hourly_stats", "conv_rate");
            let session = FeatureRef::new("driver_session", "last_city");
            let now = Utc::now();
            let err = store
                .online_write(vec![
                    row(1, &session, Val::StringVal("Porto".to_string()), now),
                    row(1, &conv_rate, Val::StringVal("high".to_string()), now),
                ])
                .await
                .expect_err("schema mismatch must fail the write");
            assert!(matches!(err, StoreError::Schema { .. }));

            let result = store.online_read(vec![driver(1)], &[session]).await?;
            assert_eq!(result[0].status, FeatureStatus::NotFound);
            Ok::<_, anyhow::Error>(())
        })
        .await?;
    }
    Ok(())
}
