use crate::error::StoreError;
use crate::model::{FeatureView, Field};
use crate::types::ValueType;
use anyhow::{Result, anyhow};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub const DEFAULT_BATCH_SIZE: usize = 1000;

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RedisType {
    #[default]
    SingleNode,
    RedisCluster,
}

/// One backend kind together with its connection parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    Memory,
    Sqlite {
        path: String,
        #[serde(default)]
        max_connections: Option<u32>,
    },
    Redis {
        #[serde(default)]
        redis_type: RedisType,
        connection_string: String,
        #[serde(default)]
        key_ttl_seconds: Option<u64>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HybridStoreConfig {
    /// Backend used for feature views without a binding.
    #[serde(default)]
    pub default_backend: Option<String>,
    /// Name of the feature view tag whose value selects the backend.
    #[serde(default)]
    pub routing_tag: Option<String>,
    /// Maximum number of entity keys (reads) or rows (writes) per backend call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,
    pub backends: BTreeMap<String, BackendConfig>,
    #[serde(default)]
    pub bindings: BTreeMap<String, String>,
}

impl Default for HybridStoreConfig {
    fn default() -> Self {
        Self {
            default_backend: None,
            routing_tag: None,
            batch_size: DEFAULT_BATCH_SIZE,
            read_timeout_ms: None,
            backends: BTreeMap::new(),
            bindings: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldConfig {
    pub name: String,
    #[serde(default)]
    pub dtype: Option<ValueType>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureViewConfig {
    pub name: String,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub features: Vec<FieldConfig>,
}

impl FeatureViewConfig {
    /// `None` when `ttl_seconds` is past what a `Duration` can hold.
    fn ttl(&self) -> Option<Duration> {
        match self.ttl_seconds {
            None => Some(Duration::zero()),
            Some(secs) => i64::try_from(secs).ok().and_then(Duration::try_seconds),
        }
    }
}

impl From<FeatureViewConfig> for FeatureView {
    fn from(value: FeatureViewConfig) -> Self {
        let ttl = value.ttl().unwrap_or(Duration::MAX);
        FeatureView {
            name: value.name.into(),
            features: value
                .features
                .into_iter()
                .map(|field| Field {
                    name: field.name.into(),
                    value_type: field.dtype,
                })
                .collect(),
            ttl,
            backend: value.backend,
            tags: value.tags,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepoConfig {
    pub project: String,
    pub online_store: HybridStoreConfig,
    #[serde(default)]
    pub feature_views: Vec<FeatureViewConfig>,
}

impl RepoConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Err(anyhow!("Empty configuration file"));
        }
        let config: RepoConfig = serde_saphyr::from_str(yaml).map_err(|err| anyhow!(err))?;
        config.validate()?;
        Ok(config)
    }

    pub fn feature_views(&self) -> Vec<FeatureView> {
        self.feature_views
            .iter()
            .cloned()
            .map(FeatureView::from)
            .collect()
    }

    /// Reports every problem at once rather than stopping at the first.
    pub fn validate(&self) -> Result<(), StoreError> {
        let store = &self.online_store;
        let mut problems = vec![];
        if store.backends.is_empty() {
            problems.push("no backends are configured".to_string());
        }
        if store.batch_size == 0 {
            problems.push("batch_size must be greater than zero".to_string());
        }
        if let Some(default_backend) = &store.default_backend
            && !store.backends.contains_key(default_backend)
        {
            problems.push(format!(
                "default_backend '{}' is not a configured backend",
                default_backend
            ));
        }
        for (view, backend) in &store.bindings {
            if !store.backends.contains_key(backend) {
                problems.push(format!(
                    "feature view '{}' is bound to unknown backend '{}'",
                    view, backend
                ));
            }
        }
        for view in &self.feature_views {
            if view.ttl().is_none() {
                problems.push(format!(
                    "feature view '{}' has an out of range ttl_seconds {}",
                    view.name,
                    view.ttl_seconds.unwrap_or_default()
                ));
            }
            if let Some(backend) = &view.backend
                && !store.backends.contains_key(backend)
            {
                problems.push(format!(
                    "feature view '{}' declares unknown backend '{}'",
                    view.name, backend
                ));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(StoreError::Config { problems })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    #[test]
    fn parse_config_hybrid_store() -> Result<()> {
        let project_dir = env!("CARGO_MANIFEST_DIR");
        let config_path = format!("{}/test_data/hybrid_store.yaml", project_dir);
        let yaml_str = fs::read_to_string(config_path)?;
        let repo_config = RepoConfig::from_yaml_str(&yaml_str)?;
        assert_eq!(repo_config.project, "hybrid_demo");

        let online_store = &repo_config.online_store;
        assert_eq!(online_store.default_backend.as_deref(), Some("redis"));
        assert_eq!(online_store.routing_tag.as_deref(), Some("tribe"));
        assert_eq!(online_store.batch_size, 500);
        assert_eq!(online_store.read_timeout_ms, Some(2000));
        assert_eq!(
            online_store.backends.get("redis"),
            Some(&BackendConfig::Redis {
                redis_type: RedisType::SingleNode,
                connection_string: "localhost:6379".to_string(),
                key_ttl_seconds: None,
            })
        );
        assert_eq!(
            online_store.backends.get("sqlite"),
            Some(&BackendConfig::Sqlite {
                path: "data/online_store.db".to_string(),
                max_connections: None,
            })
        );
        assert_eq!(online_store.backends.get("scratch"), Some(&BackendConfig::Memory));
        assert_eq!(
            online_store.bindings.get("viewA").map(String::as_str),
            Some("redis")
        );

        let views = repo_config.feature_views();
        assert_eq!(views.len(), 2);
        let stats = &views[0];
        assert_eq!(stats.name.as_ref(), "driver_hourly_stats");
        assert_eq!(stats.ttl, Duration::seconds(86400));
        assert_eq!(stats.backend.as_deref(), Some("sqlite"));
        assert_eq!(
            stats.field("conv_rate").and_then(|f| f.value_type),
            Some(ValueType::Double)
        );
        assert_eq!(views[1].tags.get("tribe").map(String::as_str), Some("scratch"));
        Ok(())
    }

    #[test]
    fn batch_size_defaults() -> Result<()> {
        let yaml = "project: p\nonline_store:\n  backends:\n    mem:\n      type: memory\n";
        let repo_config = RepoConfig::from_yaml_str(yaml)?;
        assert_eq!(repo_config.online_store.batch_size, DEFAULT_BATCH_SIZE);
        assert!(repo_config.online_store.default_backend.is_none());
        assert!(repo_config.feature_views.is_empty());
        Ok(())
    }

    #[test]
    fn validation_reports_every_problem() {
        let mut online_store = HybridStoreConfig::default();
        online_store.batch_size = 0;
        online_store.default_backend = Some("missing".to_string());
        online_store
            .bindings
            .insert("viewA".to_string(), "nowhere".to_string());
        let config = RepoConfig {
            project: "p".to_string(),
            online_store,
            feature_views: vec![],
        };
        match config.validate() {
            Err(StoreError::Config { problems }) => assert_eq!(problems.len(), 4),
            other => panic!("unexpected validation result {:?}", other),
        }
    }

    #[test]
    fn out_of_range_ttl_is_reported() {
        let yaml = r#"
project: p
online_store:
  backends:
    mem:
      type: memory
feature_views:
  - name: forever
    ttl_seconds: 10000000000000
  - name: overflow
    ttl_seconds: 18000000000000000000
"#;
        match RepoConfig::from_yaml_str(yaml) {
            Err(err) => {
                let message = err.to_string();
                assert!(message.contains("overflow"), "{}", message);
                assert!(!message.contains("forever"), "{}", message);
            }
            Ok(_) => panic!("ttl past the Duration range was accepted"),
        }

        let huge = FeatureView::from(FeatureViewConfig {
            name: "forever".to_string(),
            backend: None,
            ttl_seconds: Some(10_000_000_000_000),
            tags: HashMap::new(),
            features: vec![],
        });
        assert_eq!(huge.ttl, Duration::seconds(10_000_000_000_000));
    }

    #[test]
    fn empty_config_is_rejected() {
        assert!(RepoConfig::from_yaml_str("  \n").is_err());
    }
}
