use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use hybrid_store_core::HybridOnlineStore;
use hybrid_store_core::error::AdapterError;
use hybrid_store_core::hybrid_store::WriteReport;
use hybrid_store_core::model::{
    EntityIdValue, FeatureRef, FeatureStatus, HashEntityKey, OnlineStoreRow, ReadResult,
    ValueWrapper,
};
use hybrid_store_core::types::{EntityKey, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Columnar read request: `entities` maps each join key to one value per requested row.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OnlineReadRequest {
    pub entities: BTreeMap<String, Vec<EntityIdValue>>,
    /// Feature references in `<feature_view>:<feature>` form.
    pub features: Vec<String>,
    #[serde(default)]
    pub full_feature_names: bool,
}

impl OnlineReadRequest {
    pub fn entity_keys(&self) -> Result<Vec<EntityKey>> {
        let mut lengths = self.entities.values().map(Vec::len);
        let rows = lengths.next().unwrap_or(0);
        if lengths.any(|len| len != rows) {
            return Err(anyhow!("All entity columns must have the same length"));
        }
        Ok((0..rows)
            .map(|row| {
                EntityKey::new(
                    self.entities
                        .iter()
                        .map(|(join_key, values)| {
                            (join_key.clone(), Value::from(values[row].clone()))
                        }),
                )
            })
            .collect())
    }

    pub fn feature_refs(&self) -> Result<Vec<FeatureRef>> {
        self.features
            .iter()
            .map(|feature| FeatureRef::try_from(feature.as_str()))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResponseMetadata {
    pub feature_names: Vec<String>,
}

#[derive(Debug, Default, PartialEq, Serialize)]
pub struct FeatureResults {
    pub values: Vec<ValueWrapper>,
    pub statuses: Vec<FeatureStatus>,
    pub event_timestamps: Vec<DateTime<Utc>>,
    /// Per-row backend errors; omitted when every row of the column was served.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<Option<String>>,
}

#[derive(Debug, Default, PartialEq, Serialize)]
pub struct OnlineReadResponse {
    pub metadata: ResponseMetadata,
    pub results: Vec<FeatureResults>,
}

impl OnlineReadResponse {
    /// Lays out key-major `rows` as one column per entity join key followed by one column
    /// per requested feature.
    pub fn build(
        request: &OnlineReadRequest,
        features: &[FeatureRef],
        rows: Vec<ReadResult>,
    ) -> Self {
        let mut response = OnlineReadResponse::default();
        for (join_key, values) in &request.entities {
            response.metadata.feature_names.push(join_key.clone());
            response.results.push(FeatureResults {
                values: values.iter().cloned().map(|v| ValueWrapper(v.into())).collect(),
                statuses: vec![FeatureStatus::Present; values.len()],
                event_timestamps: vec![DateTime::UNIX_EPOCH; values.len()],
                errors: vec![],
            });
        }

        let mut columns: Vec<FeatureResults> =
            features.iter().map(|_| FeatureResults::default()).collect();
        let mut has_errors = vec![false; features.len()];
        if !features.is_empty() {
            for (position, row) in rows.into_iter().enumerate() {
                let column_index = position % features.len();
                let column = &mut columns[column_index];
                column.values.push(ValueWrapper(row.value));
                column.statuses.push(row.status);
                column
                    .event_timestamps
                    .push(row.event_ts.unwrap_or(DateTime::UNIX_EPOCH));
                has_errors[column_index] |= row.error.is_some();
                column.errors.push(row.error.map(|err| err.to_string()));
            }
        }

        for ((feature, mut column), has_errors) in features.iter().zip(columns).zip(has_errors) {
            if !has_errors {
                column.errors.clear();
            }
            response.metadata.feature_names.push(if request.full_feature_names {
                feature.full_name()
            } else {
                feature.feature_name.to_string()
            });
            response.results.push(column);
        }
        response
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WriteRow {
    pub feature_view: String,
    pub entities: BTreeMap<String, EntityIdValue>,
    pub features: BTreeMap<String, ValueWrapper>,
    /// Defaults to the time the request is received.
    #[serde(default)]
    pub event_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OnlineWriteRequest {
    pub rows: Vec<WriteRow>,
}

impl OnlineWriteRequest {
    /// Flattens the request into one row per feature value. JSON numbers are narrowed to
    /// the declared field type where the store knows it.
    pub fn into_rows(self, store: &HybridOnlineStore) -> Vec<OnlineStoreRow> {
        let received_at = Utc::now();
        let mut rows = Vec::new();
        for row in self.rows {
            let entity_key = HashEntityKey::from(EntityKey::new(
                row.entities
                    .into_iter()
                    .map(|(join_key, value)| (join_key, Value::from(value))),
            ));
            let view = store.feature_view(&row.feature_view);
            let event_ts = row.event_timestamp.unwrap_or(received_at);
            for (feature_name, value) in row.features {
                let value = match view
                    .and_then(|view| view.field(&feature_name))
                    .and_then(|field| field.value_type)
                {
                    Some(value_type) => value.coerce(value_type),
                    None => value.0,
                };
                rows.push(OnlineStoreRow::new(
                    entity_key.clone(),
                    FeatureRef::new(row.feature_view.as_str(), feature_name),
                    value,
                    event_ts,
                ));
            }
        }
        rows
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendWriteResult {
    pub backend: String,
    pub rows: usize,
    pub written: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OnlineWriteResponse {
    pub rows_written: usize,
    pub backends: Vec<BackendWriteResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<&WriteReport> for OnlineWriteResponse {
    fn from(report: &WriteReport) -> Self {
        Self {
            rows_written: report.rows_written(),
            backends: report
                .outcomes
                .iter()
                .map(|outcome| BackendWriteResult {
                    backend: outcome.backend.clone(),
                    rows: outcome.rows,
                    written: outcome.written,
                    error: outcome.error.as_ref().map(AdapterError::to_string),
                })
                .collect(),
            message: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    /// "ok" or the health check error, per connected backend.
    pub backends: BTreeMap<String, String>,
}

impl HealthResponse {
    pub fn from_checks(checks: Vec<(String, Result<(), AdapterError>)>) -> Self {
        let healthy = checks.iter().all(|(_, status)| status.is_ok());
        let backends = checks
            .into_iter()
            .map(|(backend, status)| {
                let status = match status {
                    Ok(()) => "ok".to_string(),
                    Err(err) => err.to_string(),
                };
                (backend, status)
            })
            .collect();
        Self { healthy, backends }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hybrid_store_core::types::value::Val;

    fn read_request() -> OnlineReadRequest {
        OnlineReadRequest {
            entities: BTreeMap::from([(
                "driver_id".to_string(),
                vec![EntityIdValue::Int(1001), EntityIdValue::Int(1002)],
            )]),
            features: vec!["stats:conv_rate".to_string(), "session:city".to_string()],
            full_feature_names: false,
        }
    }

    #[test]
    fn entity_columns_become_keys() -> Result<()> {
        let keys = read_request().entity_keys()?;
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[1].join_keys, vec!["driver_id"]);
        assert_eq!(keys[1].entity_values, vec![Value::from(Val::Int64Val(1002))]);

        let mut ragged = read_request();
        ragged
            .entities
            .insert("vehicle_id".to_string(), vec![EntityIdValue::Int(1)]);
        assert!(ragged.entity_keys().is_err());
        Ok(())
    }

    #[test]
    fn malformed_feature_reference_is_rejected() {
        let mut request = read_request();
        request.features.push("no_view_separator".to_string());
        assert!(request.feature_refs().is_err());
    }

    #[test]
    fn response_is_columnar() -> Result<()> {
        let request = read_request();
        let keys: Vec<HashEntityKey> = request
            .entity_keys()?
            .into_iter()
            .map(HashEntityKey::from)
            .collect();
        let features = request.feature_refs()?;
        let ts = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let rows = vec![
            ReadResult::present(
                keys[0].clone(),
                features[0].clone(),
                Val::DoubleVal(0.5).into(),
                ts,
            ),
            ReadResult::backend_error(keys[0].clone(), features[1].clone(), "redis down".into()),
            ReadResult::not_found(keys[1].clone(), features[0].clone()),
            ReadResult::backend_error(keys[1].clone(), features[1].clone(), "redis down".into()),
        ];
        let response = OnlineReadResponse::build(&request, &features, rows);
        assert_eq!(
            response.metadata.feature_names,
            vec!["driver_id", "conv_rate", "city"]
        );
        assert_eq!(response.results.len(), 3);
        let conv_rate = &response.results[1];
        assert_eq!(
            conv_rate.statuses,
            vec![FeatureStatus::Present, FeatureStatus::NotFound]
        );
        assert_eq!(conv_rate.event_timestamps, vec![ts, DateTime::UNIX_EPOCH]);
        assert!(conv_rate.errors.is_empty());
        let city = &response.results[2];
        assert_eq!(city.statuses, vec![FeatureStatus::BackendError; 2]);
        assert_eq!(city.errors, vec![Some("redis down".to_string()); 2]);
        Ok(())
    }
}
