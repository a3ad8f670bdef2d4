//! Dot-path field sets and clears.

use serde::Deserialize;
use serde_yaml::Value;

use super::Filter;
use crate::krm::KrmError;

#[derive(Debug, Clone, Deserialize)]
pub struct FieldSet {
    /// Dot-separated path, e.g. `spec.replicas`.
    pub path: String,
    pub value: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldsSpec {
    #[serde(default)]
    pub set: Vec<FieldSet>,
    #[serde(default)]
    pub clear: Vec<String>,
}

/// Sets and clears scalar fields addressed by dot path. Intermediate
/// mappings are created on set; clears of absent paths are no-ops.
pub struct FieldsFilter {
    spec: FieldsSpec,
}

impl FieldsFilter {
    pub fn new(spec: FieldsSpec) -> Self {
        Self { spec }
    }

    fn set_path(doc: &mut Value, path: &str, value: &Value) {
        let mut current = doc;
        let segments: Vec<&str> = path.split('.').collect();
        for (i, segment) in segments.iter().enumerate() {
            let Some(map) = current.as_mapping_mut() else {
                return;
            };
            let key = Value::String((*segment).to_string());
            if i == segments.len() - 1 {
                map.insert(key, value.clone());
                return;
            }
            let child = map
                .entry(key)
                .or_insert_with(|| Value::Mapping(serde_yaml::Mapping::new()));
            if !child.is_mapping() {
                *child = Value::Mapping(serde_yaml::Mapping::new());
            }
            current = child;
        }
    }

    fn clear_path(doc: &mut Value, path: &str) {
        let mut current = doc;
        let segments: Vec<&str> = path.split('.').collect();
        for (i, segment) in segments.iter().enumerate() {
            let Some(map) = current.as_mapping_mut() else {
                return;
            };
            let key = Value::String((*segment).to_string());
            if i == segments.len() - 1 {
                map.remove(&key);
                return;
            }
            match map.get_mut(&key) {
                Some(child) => current = child,
                None => return,
            }
        }
    }
}

impl Filter for FieldsFilter {
    fn kind(&self) -> &'static str {
        "fields"
    }

    fn apply(&self, doc: &mut Value) -> Result<(), KrmError> {
        for set in &self.spec.set {
            Self::set_path(doc, &set.path, &set.value);
        }
        for path in &self.spec.clear {
            Self::clear_path(doc, path);
        }
        Ok(())
    }
}
