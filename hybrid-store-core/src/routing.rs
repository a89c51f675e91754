//! Feature view to backend routing.

use crate::error::StoreError;
use crate::model::FeatureView;
use rustc_hash::FxHashMap as HashMap;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    bindings: HashMap<String, String>,
    default_backend: Option<String>,
}

impl RoutingTable {
    pub fn new(bindings: HashMap<String, String>, default_backend: Option<String>) -> Self {
        Self {
            bindings,
            default_backend,
        }
    }

    /// Builds the table from configuration. A view's binding is taken from, in order, the
    /// explicit `bindings` map, the view's own `backend` field and the value of its
    /// `routing_tag` tag.
    pub fn from_config(
        bindings: &BTreeMap<String, String>,
        feature_views: &[FeatureView],
        routing_tag: Option<&str>,
        default_backend: Option<String>,
    ) -> Self {
        let mut resolved: HashMap<String, String> = HashMap::default();
        for view in feature_views {
            let tagged = routing_tag.and_then(|tag| view.tags.get(tag));
            if let Some(backend) = view.backend.as_ref().or(tagged) {
                resolved.insert(view.name.to_string(), backend.clone());
            }
        }
        for (view, backend) in bindings {
            resolved.insert(view.clone(), backend.clone());
        }
        Self::new(resolved, default_backend)
    }

    pub fn route(&self, feature_view_name: &str) -> Result<&str, StoreError> {
        self.bindings
            .get(feature_view_name)
            .or(self.default_backend.as_ref())
            .map(String::as_str)
            .ok_or_else(|| StoreError::unroutable(vec![feature_view_name.to_string()]))
    }

    pub fn default_backend(&self) -> Option<&str> {
        self.default_backend.as_deref()
    }

    /// Every backend name this table can route to.
    pub fn backends(&self) -> impl Iterator<Item = &str> {
        self.bindings
            .values()
            .chain(self.default_backend.iter())
            .map(String::as_str)
    }

    /// Checks that every routed-to backend is known, listing all unknown ones.
    pub fn validate<F>(&self, is_registered: F) -> Result<(), StoreError>
    where
        F: Fn(&str) -> bool,
    {
        let mut problems: Vec<String> = self
            .bindings
            .iter()
            .filter(|(_, backend)| !is_registered(backend.as_str()))
            .map(|(view, backend)| {
                format!(
                    "feature view '{}' is routed to unregistered backend '{}'",
                    view, backend
                )
            })
            .collect();
        if let Some(default_backend) = &self.default_backend
            && !is_registered(default_backend)
        {
            problems.push(format!(
                "default backend '{}' is not registered",
                default_backend
            ));
        }
        if problems.is_empty() {
            Ok(())
        } else {
            problems.sort();
            Err(StoreError::Config { problems })
        }
    }
}
