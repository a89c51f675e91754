use crate::types::value::Val;
use crate::types::{EntityKey, Value, ValueType};
use anyhow::{Error, Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use serde::de::Deserializer;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::fmt::Formatter;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Entity identifier as it appears in JSON requests.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum EntityIdValue {
    String(String),
    Int(i64),
}

impl From<EntityIdValue> for Value {
    fn from(value: EntityIdValue) -> Self {
        match value {
            EntityIdValue::Int(v) => Val::Int64Val(v).into(),
            EntityIdValue::String(v) => Val::StringVal(v).into(),
        }
    }
}

/// JSON view of a feature value.
#[derive(PartialEq, Clone)]
pub struct ValueWrapper(pub Value);

impl Serialize for ValueWrapper {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match &self.0.val {
            None => serializer.serialize_none(),
            Some(v) => match v {
                Val::Int32Val(i) => serializer.serialize_i32(*i),
                Val::Int64Val(i) => serializer.serialize_i64(*i),
                Val::FloatVal(f) => serializer.serialize_f32(*f),
                Val::DoubleVal(d) => serializer.serialize_f64(*d),
                Val::StringVal(s) => serializer.serialize_str(s),
                Val::BytesVal(b) => serializer.serialize_bytes(b),
                Val::BoolVal(b) => serializer.serialize_bool(*b),
                Val::UnixTimestampVal(ts) => serializer.serialize_i64(*ts),
            },
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonScalar {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
}

impl<'de> Deserialize<'de> for ValueWrapper {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let scalar = Option::<JsonScalar>::deserialize(deserializer)?;
        let val = scalar.map(|scalar| match scalar {
            JsonScalar::Bool(b) => Val::BoolVal(b),
            JsonScalar::Int(i) => Val::Int64Val(i),
            JsonScalar::Double(d) => Val::DoubleVal(d),
            JsonScalar::String(s) => Val::StringVal(s),
        });
        Ok(Self(Value { val }))
    }
}

impl fmt::Debug for ValueWrapper {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl ValueWrapper {
    /// Coerces a JSON-decoded value to the declared type of a field.
    ///
    /// JSON has a single integer and a single float type, so narrower declared types are
    /// reached by conversion. Anything else is left as is for the schema check to report.
    pub fn coerce(self, value_type: ValueType) -> Value {
        let val = match (self.0.val, value_type) {
            (Some(Val::Int64Val(i)), ValueType::Int32) => match i32::try_from(i) {
                Ok(narrow) => Some(Val::Int32Val(narrow)),
                Err(_) => Some(Val::Int64Val(i)),
            },
            (Some(Val::Int64Val(i)), ValueType::Double) => Some(Val::DoubleVal(i as f64)),
            (Some(Val::Int64Val(i)), ValueType::Float) => Some(Val::FloatVal(i as f32)),
            (Some(Val::Int64Val(i)), ValueType::UnixTimestamp) => Some(Val::UnixTimestampVal(i)),
            (Some(Val::DoubleVal(d)), ValueType::Float) => Some(Val::FloatVal(d as f32)),
            (Some(Val::StringVal(s)), ValueType::Bytes) => Some(Val::BytesVal(s.into_bytes())),
            (other, _) => other,
        };
        Value { val }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeatureStatus {
    Present,
    NotFound,
    OutsideMaxAge,
    BackendError,
}

#[derive(Debug, Clone, Default)]
pub struct Field {
    pub name: Arc<str>,
    pub value_type: Option<ValueType>,
}

impl Field {
    pub fn new(name: impl Into<Arc<str>>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type: Some(value_type),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeatureView {
    pub name: Arc<str>,
    pub features: Vec<Field>,
    pub ttl: Duration,
    pub backend: Option<String>,
    pub tags: HashMap<String, String>,
}

impl Default for FeatureView {
    fn default() -> Self {
        Self {
            name: Arc::<str>::from(""),
            features: Vec::new(),
            ttl: Duration::zero(),
            backend: None,
            tags: HashMap::new(),
        }
    }
}

impl FeatureView {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_features(mut self, features: Vec<Field>) -> Self {
        self.features = features;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(&self, feature_name: &str) -> Option<&Field> {
        self.features
            .iter()
            .find(|field| field.name.as_ref() == feature_name)
    }

    /// A zero TTL means values never expire.
    pub fn is_expired(&self, event_ts: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.ttl > Duration::zero()
            && event_ts
                .checked_add_signed(self.ttl)
                .is_some_and(|expiry| expiry < now)
    }
}

/// Implement custom hashing for EntityKey to support using it as a key in HashMap.
struct HashValue<'a>(&'a Value);

/// Floats are hashed by their bit representation. Entity keys are not expected to carry
/// floating point values, this only keeps hashing total.
impl<'a> Hash for HashValue<'a> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match &self.0.val {
            None => 0u8.hash(state),
            Some(v) => match v {
                Val::Int32Val(i) => {
                    1u8.hash(state);
                    i.hash(state);
                }
                Val::Int64Val(i) => {
                    2u8.hash(state);
                    i.hash(state);
                }
                Val::StringVal(s) => {
                    5u8.hash(state);
                    s.hash(state);
                }
                Val::BytesVal(b) => {
                    6u8.hash(state);
                    b.hash(state);
                }
                Val::BoolVal(b) => {
                    7u8.hash(state);
                    b.hash(state);
                }
                Val::UnixTimestampVal(ts) => {
                    8u8.hash(state);
                    ts.hash(state);
                }
                Val::FloatVal(f) => {
                    9u8.hash(state);
                    f.to_bits().hash(state);
                }
                Val::DoubleVal(d) => {
                    10u8.hash(state);
                    d.to_bits().hash(state);
                }
            },
        }
    }
}

/// Shared, hashable entity key handed to every backend. Equality and hashing ignore the
/// order of the join keys, matching the sorted key serialization of the persistent stores.
#[derive(Debug, Clone)]
pub struct HashEntityKey(pub Arc<EntityKey>);

impl HashEntityKey {
    fn sorted_pairs(&self) -> Vec<(&str, &Value)> {
        let mut pairs: Vec<(&str, &Value)> = self
            .0
            .join_keys
            .iter()
            .map(String::as_str)
            .zip(self.0.entity_values.iter())
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));
        pairs
    }
}

impl PartialEq for HashEntityKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.join_keys.len() == other.0.join_keys.len()
            && self.0.entity_values.len() == other.0.entity_values.len()
            && self.sorted_pairs() == other.sorted_pairs()
    }
}

impl Hash for HashEntityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for (join_key, entity_value) in self.sorted_pairs() {
            join_key.hash(state);
            HashValue(entity_value).hash(state);
        }
    }
}

impl Eq for HashEntityKey {}

impl From<EntityKey> for HashEntityKey {
    fn from(key: EntityKey) -> Self {
        Self(Arc::new(key))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FeatureRef {
    pub feature_view_name: Arc<str>,
    pub feature_name: Arc<str>,
}

impl FeatureRef {
    pub fn new(feature_view_name: impl Into<Arc<str>>, feature_name: impl Into<Arc<str>>) -> Self {
        Self {
            feature_view_name: feature_view_name.into(),
            feature_name: feature_name.into(),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}__{}", self.feature_view_name, self.feature_name)
    }
}

impl fmt::Display for FeatureRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.feature_view_name, self.feature_name)
    }
}

impl TryFrom<&str> for FeatureRef {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((view, feature)) if !view.is_empty() && !feature.is_empty() => {
                Ok(Self::new(view, feature))
            }
            _ => Err(anyhow!(
                "Invalid feature reference '{}', expected '<feature_view>:<feature>'",
                s
            )),
        }
    }
}

/// One (entity, feature) cell of a read.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadResult {
    pub entity_key: HashEntityKey,
    pub feature: FeatureRef,
    pub value: Value,
    pub event_ts: Option<DateTime<Utc>>,
    pub status: FeatureStatus,
    pub error: Option<Arc<str>>,
}

impl ReadResult {
    pub fn present(
        entity_key: HashEntityKey,
        feature: FeatureRef,
        value: Value,
        event_ts: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_key,
            feature,
            value,
            event_ts: Some(event_ts),
            status: FeatureStatus::Present,
            error: None,
        }
    }

    pub fn not_found(entity_key: HashEntityKey, feature: FeatureRef) -> Self {
        Self {
            entity_key,
            feature,
            value: Value::null(),
            event_ts: None,
            status: FeatureStatus::NotFound,
            error: None,
        }
    }

    pub fn backend_error(entity_key: HashEntityKey, feature: FeatureRef, error: Arc<str>) -> Self {
        Self {
            entity_key,
            feature,
            value: Value::null(),
            event_ts: None,
            status: FeatureStatus::BackendError,
            error: Some(error),
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(
            self.status,
            FeatureStatus::Present | FeatureStatus::OutsideMaxAge
        )
    }
}

/// One feature value to be written.
#[derive(Debug, Clone)]
pub struct OnlineStoreRow {
    pub entity_key: HashEntityKey,
    pub feature: FeatureRef,
    pub value: Value,
    pub event_ts: DateTime<Utc>,
    pub created_ts: Option<DateTime<Utc>>,
}

impl OnlineStoreRow {
    pub fn new(
        entity_key: impl Into<HashEntityKey>,
        feature: FeatureRef,
        value: Value,
        event_ts: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_key: entity_key.into(),
            feature,
            value,
            event_ts,
            created_ts: None,
        }
    }
}
