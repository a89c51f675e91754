use crate::error::AdapterError;
use crate::key_serialization::serialize_key;
use crate::model::{FeatureRef, FeatureView, HashEntityKey, OnlineStoreRow, ReadResult};
use crate::onlinestore::{OnlineStore, assemble_rows};
use crate::types::Value;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use prost::Message;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{FromRow, Pool, Row, Sqlite};
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::debug;

pub struct ConnectionOptions {
    max_connections: u32,
    min_connections: u32,
    acquire_timeout: Duration,
    idle_timeout: Duration,
    test_before_acquire: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            max_connections: 5,
            min_connections: 1,
            acquire_timeout: Duration::seconds(5),
            idle_timeout: Duration::seconds(600),
            test_before_acquire: true,
        }
    }
}

impl ConnectionOptions {
    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections.max(1);
        self.min_connections = self.min_connections.min(self.max_connections);
        self
    }
}

#[derive(Debug)]
struct SqliteStoreRow {
    entity_key: Vec<u8>,
    feature_name: String,
    value: Vec<u8>,
    event_ts: DateTime<Utc>,
}

impl FromRow<'_, SqliteRow> for SqliteStoreRow {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            entity_key: row.try_get("entity_key")?,
            feature_name: row.try_get("feature_name")?,
            value: row.try_get("value")?,
            event_ts: row.try_get("event_ts")?,
        })
    }
}

/// Stored cells of one view: (serialized entity key, feature name) -> (value, event ts).
type ViewCells = HashMap<(Vec<u8>, String), (Value, DateTime<Utc>)>;

/// Disk-backed backend using the Feast SQLite layout: one table per feature view named
/// `<project>_<view>`, one row per (entity key, feature).
pub struct SqliteOnlineStore {
    project: String,
    connection_pool: Pool<Sqlite>,
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn placeholders(count: usize) -> String {
    format!("?{}", ", ?".repeat(count.saturating_sub(1)))
}

fn is_missing_table(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.message().contains("no such table"))
}

impl SqliteOnlineStore {
    pub async fn from_options(
        path: &str,
        project: String,
        connection_options: ConnectionOptions,
    ) -> Result<Self, AdapterError> {
        let connect_options = SqliteConnectOptions::from_str(path)
            .map_err(|e| AdapterError::connection(format!("invalid SQLite path {}: {}", path, e)))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(connection_options.max_connections)
            .min_connections(connection_options.min_connections)
            .acquire_timeout(
                connection_options
                    .acquire_timeout
                    .to_std()
                    .unwrap_or_else(|_| std::time::Duration::from_secs(0)),
            )
            .idle_timeout(
                connection_options
                    .idle_timeout
                    .to_std()
                    .unwrap_or_else(|_| std::time::Duration::from_secs(0)),
            )
            .test_before_acquire(connection_options.test_before_acquire)
            .connect_with(connect_options)
            .await?;
        Ok(Self {
            project,
            connection_pool: pool,
        })
    }

    fn table_name(&self, feature_view_name: &str) -> String {
        quote_identifier(&format!("{}_{}", self.project, feature_view_name))
    }

    async fn fetch_view(
        pool: Pool<Sqlite>,
        table_name: String,
        serialized_keys: Vec<Vec<u8>>,
        feature_names: Vec<String>,
    ) -> Result<ViewCells, AdapterError> {
        let query = format!(
            "SELECT entity_key, feature_name, value, event_ts \
             FROM {} WHERE entity_key IN ({}) AND feature_name IN ({})",
            table_name,
            placeholders(serialized_keys.len()),
            placeholders(feature_names.len())
        );
        let mut sqlx_query = sqlx::query_as::<_, SqliteStoreRow>(&query);
        for key in &serialized_keys {
            sqlx_query = sqlx_query.bind(key);
        }
        for feature_name in &feature_names {
            sqlx_query = sqlx_query.bind(feature_name);
        }
        let rows = match sqlx_query.fetch_all(&pool).await {
            Ok(rows) => rows,
            Err(err) if is_missing_table(&err) => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        rows.into_iter()
            .map(|row| {
                let value = Value::decode(row.value.as_slice()).map_err(|e| {
                    AdapterError::schema(format!(
                        "failed to decode value for {}.{}: {}",
                        table_name, row.feature_name, e
                    ))
                })?;
                Ok(((row.entity_key, row.feature_name), (value, row.event_ts)))
            })
            .collect()
    }
}

#[async_trait]
impl OnlineStore for SqliteOnlineStore {
    async fn get_feature_values(
        &self,
        keys: &[HashEntityKey],
        features: &[FeatureRef],
    ) -> Result<Vec<ReadResult>, AdapterError> {
        let serialized_keys = keys
            .iter()
            .map(|key| serialize_key(&key.0))
            .collect::<Result<Vec<_>, _>>()?;
        let unique_keys: Vec<Vec<u8>> = serialized_keys
            .iter()
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let mut view_features: HashMap<Arc<str>, HashSet<String>> = HashMap::default();
        for feature in features {
            view_features
                .entry(feature.feature_view_name.clone())
                .or_default()
                .insert(feature.feature_name.to_string());
        }

        let mut join_set: JoinSet<(Arc<str>, Result<ViewCells, AdapterError>)> = JoinSet::new();
        if !unique_keys.is_empty() {
            for (view_name, feature_names) in view_features {
                let pool = self.connection_pool.clone();
                let table_name = self.table_name(&view_name);
                let keys = unique_keys.clone();
                join_set.spawn(async move {
                    let cells = Self::fetch_view(
                        pool,
                        table_name,
                        keys,
                        feature_names.into_iter().collect(),
                    )
                    .await;
                    (view_name, cells)
                });
            }
        }

        let mut cells_by_view: HashMap<Arc<str>, ViewCells> = HashMap::default();
        let mut errors = vec![];
        while let Some(res) = join_set.join_next().await {
            match res {
                Ok((view_name, Ok(cells))) => {
                    cells_by_view.insert(view_name, cells);
                }
                Ok((view_name, Err(e))) => errors.push((view_name, e)),
                Err(e) => {
                    return Err(AdapterError::connection(format!(
                        "Error joining SQLite read task: {:?}",
                        e
                    )));
                }
            }
        }
        if let Some((view_name, first)) = errors.into_iter().next() {
            debug!("SQLite read failed for feature view {}: {}", view_name, first);
            return Err(first);
        }

        Ok(assemble_rows(keys, features, |key_index, feature| {
            cells_by_view
                .get(&feature.feature_view_name)
                .and_then(|cells| {
                    cells.get(&(
                        serialized_keys[key_index].clone(),
                        feature.feature_name.to_string(),
                    ))
                })
                .cloned()
        }))
    }

    async fn put_feature_values(&self, rows: Vec<OnlineStoreRow>) -> Result<usize, AdapterError> {
        let mut rows_by_view: HashMap<Arc<str>, Vec<OnlineStoreRow>> = HashMap::default();
        for row in rows {
            rows_by_view
                .entry(row.feature.feature_view_name.clone())
                .or_default()
                .push(row);
        }

        let mut written = 0;
        let mut transaction = self.connection_pool.begin().await?;
        for (view_name, view_rows) in rows_by_view {
            let table_name = self.table_name(&view_name);
            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS {} (entity_key BLOB, feature_name TEXT, value BLOB, \
                 event_ts TIMESTAMP, created_ts TIMESTAMP, PRIMARY KEY(entity_key, feature_name))",
                table_name
            ))
            .execute(&mut *transaction)
            .await?;
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} (entity_key)",
                quote_identifier(&format!("{}_{}_ek", self.project, view_name)),
                table_name
            ))
            .execute(&mut *transaction)
            .await?;

            let insert = format!(
                "INSERT OR REPLACE INTO {} (entity_key, feature_name, value, event_ts, created_ts) \
                 VALUES (?, ?, ?, ?, ?)",
                table_name
            );
            for row in view_rows {
                sqlx::query(&insert)
                    .bind(serialize_key(&row.entity_key.0)?)
                    .bind(row.feature.feature_name.as_ref())
                    .bind(row.value.encode_to_vec())
                    .bind(row.event_ts)
                    .bind(row.created_ts.unwrap_or_else(Utc::now))
                    .execute(&mut *transaction)
                    .await?;
                written += 1;
            }
        }
        transaction.commit().await?;
        Ok(written)
    }

    async fn delete_entities(
        &self,
        feature_view: &FeatureView,
        keys: &[HashEntityKey],
    ) -> Result<(), AdapterError> {
        if keys.is_empty() {
            return Ok(());
        }
        let serialized_keys = keys
            .iter()
            .map(|key| serialize_key(&key.0))
            .collect::<Result<Vec<_>, _>>()?;
        let query = format!(
            "DELETE FROM {} WHERE entity_key IN ({})",
            self.table_name(&feature_view.name),
            placeholders(serialized_keys.len())
        );
        let mut sqlx_query = sqlx::query(&query);
        for key in &serialized_keys {
            sqlx_query = sqlx_query.bind(key);
        }
        match sqlx_query.execute(&self.connection_pool).await {
            Ok(_) => Ok(()),
            Err(err) if is_missing_table(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn drop_feature_view(&self, feature_view: &FeatureView) -> Result<(), AdapterError> {
        sqlx::query(&format!(
            "DROP TABLE IF EXISTS {}",
            self.table_name(&feature_view.name)
        ))
        .execute(&self.connection_pool)
        .await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), AdapterError> {
        sqlx::query("SELECT 1")
            .execute(&self.connection_pool)
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), AdapterError> {
        self.connection_pool.close().await;
        Ok(())
    }
}
