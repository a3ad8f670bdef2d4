//! Label merging.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_yaml::Value;

use super::Filter;
use crate::krm::KrmError;

#[derive(Debug, Clone, Deserialize)]
pub struct LabelsSpec {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Merges a fixed set of labels into `metadata.labels` of every document.
/// Existing values for the same keys are overwritten.
pub struct LabelsFilter {
    spec: LabelsSpec,
}

impl LabelsFilter {
    pub fn new(spec: LabelsSpec) -> Self {
        Self { spec }
    }
}

impl Filter for LabelsFilter {
    fn kind(&self) -> &'static str {
        "labels"
    }

    fn apply(&self, doc: &mut Value) -> Result<(), KrmError> {
        if self.spec.labels.is_empty() || !doc.is_mapping() {
            return Ok(());
        }
        let Some(map) = doc.as_mapping_mut() else {
            return Ok(());
        };
        let metadata = map
            .entry(Value::String("metadata".to_string()))
            .or_insert_with(|| Value::Mapping(serde_yaml::Mapping::new()));
        if !metadata.is_mapping() {
            return Ok(());
        }
        let labels = metadata
            .as_mapping_mut()
            .expect("checked mapping")
            .entry(Value::String("labels".to_string()))
            .or_insert_with(|| Value::Mapping(serde_yaml::Mapping::new()));
        let Some(labels) = labels.as_mapping_mut() else {
            return Ok(());
        };
        for (k, v) in &self.spec.labels {
            labels.insert(Value::String(k.clone()), Value::String(v.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merges_and_overwrites() {
        let filter = LabelsFilter::new(LabelsSpec {
            labels: BTreeMap::from([
                ("env".to_string(), "prod".to_string()),
                ("team".to_string(), "platform".to_string()),
            ]),
        });
        let mut doc: Value = serde_yaml::from_str(
            r"
kind: Deployment
metadata:
  name: web
  labels: {env: dev, app: web}
",
        )
        .unwrap();
        filter.apply(&mut doc).unwrap();
        assert_eq!(crate::krm::label(&doc, "env"), Some("prod"));
        assert_eq!(crate::krm::label(&doc, "app"), Some("web"));
        assert_eq!(crate::krm::label(&doc, "team"), Some("platform"));
    }

    #[test]
    fn test_creates_metadata_when_absent() {
        let filter = LabelsFilter::new(LabelsSpec {
            labels: BTreeMap::from([("app".to_string(), "web".to_string())]),
        });
        let mut doc: Value = serde_yaml::from_str("kind: ConfigMap").unwrap();
        filter.apply(&mut doc).unwrap();
        assert_eq!(crate::krm::label(&doc, "app"), Some("web"));
    }
}
