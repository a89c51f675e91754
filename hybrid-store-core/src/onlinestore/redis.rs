use crate::config::RedisType;
use crate::error::AdapterError;
use crate::key_serialization::serialize_key;
use crate::model::{FeatureRef, FeatureView, HashEntityKey, OnlineStoreRow, ReadResult};
use crate::onlinestore::OnlineStore;
use crate::types::Value;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prost::Message;
use prost_types::Timestamp;
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::cluster::{ClusterClient, ClusterClientBuilder};
use redis::cluster_async::ClusterConnection;
use redis::{
    Client, ConnectionAddr, ConnectionInfo, IntoConnectionInfo, RedisConnectionInfo, RedisResult,
};
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use std::sync::Arc;
use tracing::debug;

const SCAN_BATCH: usize = 500;

fn feature_redis_key(feature_view_name: &str, feature_name: &str) -> Vec<u8> {
    let mut key_bytes = feature_view_name.as_bytes().to_vec();
    key_bytes.push(b':');
    key_bytes.extend_from_slice(feature_name.as_bytes());
    // Reading from an in-memory cursor cannot fail.
    let hashed_key = murmur3::murmur3_32(&mut std::io::Cursor::new(&key_bytes), 0).unwrap_or(0);
    hashed_key.to_le_bytes().to_vec()
}

fn timestamp_field(feature_view_name: &str) -> Vec<u8> {
    ["_ts:", feature_view_name].concat().into_bytes()
}

fn timestamp_to_bytes(ts: DateTime<Utc>) -> Vec<u8> {
    Timestamp {
        seconds: ts.timestamp(),
        nanos: ts.timestamp_subsec_nanos() as i32,
    }
    .encode_to_vec()
}

#[derive(Debug, Default, Clone)]
struct CommonConnectionOptions {
    password: Option<String>,
    username: Option<String>,
    db: Option<i64>,
}

#[derive(Debug, Default, Clone)]
struct RedisConnectionOption {
    hosts: Vec<(String, u16)>,
    common_options: CommonConnectionOptions,
}

/// Parses the Feast connection string format: `host:port[,host:port...][,key=value...]`.
fn parse_redis_connection_string(
    connection_string: &str,
) -> Result<RedisConnectionOption, AdapterError> {
    let mut result = RedisConnectionOption::default();
    for (i, part) in connection_string.split(',').map(str::trim).enumerate() {
        if let Some((key, value)) = part.split_once('=') {
            parse_common_options(&mut result.common_options, i, key, value)?;
        } else if let Some((host, port_str)) = part.split_once(':') {
            let port = port_str.parse::<u16>().map_err(|_| {
                AdapterError::schema(format!("Failed to parse port '{}' at index {}", port_str, i))
            })?;
            result.hosts.push((host.to_string(), port));
        } else {
            return Err(AdapterError::schema(format!(
                "Invalid connection URL part at index {}: {}",
                i, part
            )));
        }
    }
    if result.hosts.is_empty() {
        return Err(AdapterError::schema(
            "Redis connection string does not contain any host",
        ));
    }
    Ok(result)
}

fn parse_common_options(
    result: &mut CommonConnectionOptions,
    i: usize,
    key: &str,
    value: &str,
) -> Result<(), AdapterError> {
    match key.to_ascii_lowercase().as_str() {
        "password" => result.password = Some(value.to_string()),
        "username" => result.username = Some(value.to_string()),
        "db" => {
            result.db = Some(value.parse::<i64>().map_err(|_| {
                AdapterError::schema(format!("Invalid db value at index {}: {}", i, value))
            })?)
        }
        other => {
            return Err(AdapterError::schema(format!(
                "Invalid connection option at index {}: {}",
                i, other
            )));
        }
    }
    Ok(())
}

struct RedisHost {
    host: String,
    port: u16,
    options: CommonConnectionOptions,
}

impl IntoConnectionInfo for RedisHost {
    fn into_connection_info(self) -> RedisResult<ConnectionInfo> {
        let mut redis = RedisConnectionInfo::default();
        redis.username = self.options.username;
        redis.password = self.options.password;
        if let Some(db) = self.options.db {
            redis.db = db;
        }
        Ok(ConnectionInfo {
            addr: ConnectionAddr::Tcp(self.host, self.port),
            redis,
        })
    }
}

impl From<RedisConnectionOption> for Vec<RedisHost> {
    fn from(value: RedisConnectionOption) -> Self {
        let options = value.common_options;
        value
            .hosts
            .into_iter()
            .map(|(host, port)| RedisHost {
                host,
                port,
                options: options.clone(),
            })
            .collect()
    }
}

async fn check_redis_connection<C: ConnectionLike + Send>(
    conn: &mut C,
) -> Result<(), AdapterError> {
    let ping_response: String = redis::cmd("PING").query_async(conn).await?;
    if !ping_response.eq_ignore_ascii_case("PONG") {
        return Err(AdapterError::connection(format!(
            "unexpected PING response: {}",
            ping_response
        )));
    }
    Ok(())
}

/// Networked backend using the Feast Redis layout: one hash per entity key (serialized key
/// followed by the project name) holding murmur3-hashed feature fields and one
/// `_ts:<view>` timestamp field per feature view.
pub(crate) struct RedisOnlineStore<C> {
    project: String,
    connection: C,
    key_ttl_seconds: Option<u64>,
}

pub(crate) async fn new(
    project: String,
    redis_type: RedisType,
    connection_string: &str,
    key_ttl_seconds: Option<u64>,
) -> Result<Arc<dyn OnlineStore>, AdapterError> {
    let connection_option = parse_redis_connection_string(connection_string)?;
    let mut hosts: Vec<RedisHost> = connection_option.into();
    match redis_type {
        RedisType::SingleNode => {
            if hosts.len() != 1 {
                return Err(AdapterError::schema(format!(
                    "Expected single host for single node Redis, got {}",
                    hosts.len()
                )));
            }
            let client = Client::open(hosts.remove(0))?;
            let mut connection = ConnectionManager::new(client).await?;
            check_redis_connection(&mut connection).await?;
            debug!("Connected to single node Redis for project {}", project);
            Ok(Arc::new(RedisOnlineStore {
                project,
                connection,
                key_ttl_seconds,
            }))
        }
        RedisType::RedisCluster => {
            let cluster_client: ClusterClient = ClusterClientBuilder::new(hosts).build()?;
            let mut connection: ClusterConnection = cluster_client.get_async_connection().await?;
            check_redis_connection(&mut connection).await?;
            debug!("Connected to Redis cluster for project {}", project);
            Ok(Arc::new(RedisOnlineStore {
                project,
                connection,
                key_ttl_seconds,
            }))
        }
    }
}

enum RedisRequest<'a> {
    FeatureRow {
        key_index: usize,
        feature: &'a FeatureRef,
    },
    TimestampRow {
        key_index: usize,
        feature_view_name: &'a str,
    },
}

impl<C> RedisOnlineStore<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    fn redis_key(&self, entity_key: &HashEntityKey) -> Result<Vec<u8>, AdapterError> {
        let mut key = serialize_key(&entity_key.0)?;
        key.extend_from_slice(self.project.as_bytes());
        Ok(key)
    }
}

/// Hash fields removed when a view's data is deleted. Views without declared features only
/// lose their `_ts:<view>` field; their value fields then read as not found.
fn view_fields(feature_view: &FeatureView) -> Vec<Vec<u8>> {
    std::iter::once(timestamp_field(&feature_view.name))
        .chain(
            feature_view
                .features
                .iter()
                .map(|field| feature_redis_key(&feature_view.name, &field.name)),
        )
        .collect()
}

/// Every write stores the view timestamp alongside its values, so a value without one is
/// left over from a delete.
fn feature_row(
    key: HashEntityKey,
    feature: &FeatureRef,
    value: Option<Vec<u8>>,
    event_ts: Option<DateTime<Utc>>,
) -> Result<ReadResult, AdapterError> {
    match (value, event_ts) {
        (Some(bytes), Some(event_ts)) => {
            let decoded = Value::decode(bytes.as_slice()).map_err(|e| {
                AdapterError::schema(format!(
                    "Failed to decode value for feature {}: {}",
                    feature, e
                ))
            })?;
            Ok(ReadResult::present(key, feature.clone(), decoded, event_ts))
        }
        _ => Ok(ReadResult::not_found(key, feature.clone())),
    }
}

#[async_trait]
impl<C> OnlineStore for RedisOnlineStore<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    async fn get_feature_values(
        &self,
        keys: &[HashEntityKey],
        features: &[FeatureRef],
    ) -> Result<Vec<ReadResult>, AdapterError> {
        if keys.is_empty() || features.is_empty() {
            return Ok(Vec::new());
        }
        let mut requests: Vec<RedisRequest> = vec![];
        let mut pipeline = redis::pipe();

        for (key_index, key) in keys.iter().enumerate() {
            let mut seen_views: HashSet<&str> = HashSet::default();
            let mut fields: Vec<Vec<u8>> = vec![];
            for feature in features {
                if seen_views.insert(feature.feature_view_name.as_ref()) {
                    fields.push(timestamp_field(&feature.feature_view_name));
                    requests.push(RedisRequest::TimestampRow {
                        key_index,
                        feature_view_name: &feature.feature_view_name,
                    });
                }
                fields.push(feature_redis_key(
                    &feature.feature_view_name,
                    &feature.feature_name,
                ));
                requests.push(RedisRequest::FeatureRow { key_index, feature });
            }
            pipeline.cmd("HMGET").arg(self.redis_key(key)?).arg(fields);
        }

        let mut connection = self.connection.clone();
        let results: Vec<Vec<Option<Vec<u8>>>> = pipeline.query_async(&mut connection).await?;
        let result_count: usize = results.iter().map(Vec::len).sum();
        if result_count != requests.len() {
            return Err(AdapterError::schema(format!(
                "Mismatched number of results: expected {}, got {}",
                requests.len(),
                result_count
            )));
        }

        let mut rows = Vec::with_capacity(keys.len() * features.len());
        let mut timestamps: HashMap<(usize, &str), Option<DateTime<Utc>>> = HashMap::default();
        for (request, value) in requests.into_iter().zip(results.into_iter().flatten()) {
            match request {
                RedisRequest::TimestampRow {
                    key_index,
                    feature_view_name,
                } => {
                    let ts = value
                        .map(|bytes| Timestamp::decode(bytes.as_slice()))
                        .transpose()?
                        .and_then(|ts| {
                            DateTime::<Utc>::from_timestamp(ts.seconds, ts.nanos.max(0) as u32)
                        });
                    timestamps.insert((key_index, feature_view_name), ts);
                }
                RedisRequest::FeatureRow { key_index, feature } => {
                    let event_ts = timestamps
                        .get(&(key_index, feature.feature_view_name.as_ref()))
                        .copied()
                        .flatten();
                    rows.push(feature_row(keys[key_index].clone(), feature, value, event_ts)?);
                }
            }
        }
        Ok(rows)
    }

    async fn put_feature_values(&self, rows: Vec<OnlineStoreRow>) -> Result<usize, AdapterError> {
        let written = rows.len();
        let mut rows_by_key: HashMap<HashEntityKey, Vec<OnlineStoreRow>> = HashMap::default();
        for row in rows {
            rows_by_key.entry(row.entity_key.clone()).or_default().push(row);
        }

        let mut pipeline = redis::pipe();
        for (entity_key, key_rows) in rows_by_key {
            let redis_key = self.redis_key(&entity_key)?;
            let mut latest: HashMap<&str, DateTime<Utc>> = HashMap::default();
            let mut hset = redis::cmd("HSET");
            hset.arg(&redis_key);
            for row in &key_rows {
                hset.arg(feature_redis_key(
                    &row.feature.feature_view_name,
                    &row.feature.feature_name,
                ))
                .arg(row.value.encode_to_vec());
                let ts = latest
                    .entry(row.feature.feature_view_name.as_ref())
                    .or_insert(row.event_ts);
                *ts = (*ts).max(row.event_ts);
            }
            for (view_name, ts) in latest {
                hset.arg(timestamp_field(view_name)).arg(timestamp_to_bytes(ts));
            }
            pipeline.add_command(hset).ignore();
            if let Some(ttl) = self.key_ttl_seconds {
                pipeline.cmd("EXPIRE").arg(&redis_key).arg(ttl).ignore();
            }
        }

        let mut connection = self.connection.clone();
        pipeline.query_async::<()>(&mut connection).await?;
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
        let fields = view_fields(feature_view);
        let mut pipeline = redis::pipe();
        for key in keys {
            pipeline
                .cmd("HDEL")
                .arg(self.redis_key(key)?)
                .arg(fields.clone())
                .ignore();
        }
        let mut connection = self.connection.clone();
        pipeline.query_async::<()>(&mut connection).await?;
        Ok(())
    }

    async fn drop_feature_view(&self, feature_view: &FeatureView) -> Result<(), AdapterError> {
        let fields = view_fields(feature_view);
        let pattern = format!("*{}", self.project);
        let mut connection = self.connection.clone();
        let mut cursor: u64 = 0;
        loop {
            let (next_cursor, redis_keys): (u64, Vec<Vec<u8>>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut connection)
                .await?;
            if !redis_keys.is_empty() {
                let mut pipeline = redis::pipe();
                for redis_key in redis_keys {
                    pipeline.cmd("HDEL").arg(redis_key).arg(fields.clone()).ignore();
                }
                pipeline.query_async::<()>(&mut connection).await?;
            }
            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<(), AdapterError> {
        let mut connection = self.connection.clone();
        check_redis_connection(&mut connection).await
    }

    async fn close(&self) -> Result<(), AdapterError> {
        // Connections are multiplexed and shut down once the last clone is dropped.
        Ok(())
    }
}
