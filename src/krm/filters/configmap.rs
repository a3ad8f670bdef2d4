//! Applying filters inside config-map data values.

use serde_yaml::Value;

use super::Filter;
use crate::krm::{kind, parse_docs, KrmError};

/// Wraps another filter so it transforms YAML *embedded in* config-map data
/// values (keys ending in `.yaml`/`.yml`) instead of documents directly.
/// The embedded stream is unwrapped, filtered, and re-serialized in place;
/// non-ConfigMap documents pass through untouched.
pub struct ConfigMapFilter {
    inner: Box<dyn Filter>,
}

impl ConfigMapFilter {
    pub fn new(inner: Box<dyn Filter>) -> Self {
        Self { inner }
    }
}

impl Filter for ConfigMapFilter {
    fn kind(&self) -> &'static str {
        "configmap"
    }

    fn apply(&self, doc: &mut Value) -> Result<(), KrmError> {
        if kind(doc) != Some("ConfigMap") {
            return Ok(());
        }
        let Some(data) = doc.get_mut("data").and_then(Value::as_mapping_mut) else {
            return Ok(());
        };
        for (key, value) in data.iter_mut() {
            let is_yaml_key = key
                .as_str()
                .is_some_and(|k| k.ends_with(".yaml") || k.ends_with(".yml"));
            if !is_yaml_key {
                continue;
            }
            let Some(raw) = value.as_str() else {
                continue;
            };
            let mut embedded = match parse_docs(raw) {
                Ok(docs) => docs,
                // Opaque data that merely looks like YAML is left alone.
                Err(_) => continue,
            };
            for inner_doc in &mut embedded {
                self.inner.apply(inner_doc)?;
            }
            let mut out = String::new();
            for (i, inner_doc) in embedded.iter().enumerate() {
                if i > 0 {
                    out.push_str("---\n");
                }
                out.push_str(&serde_yaml::to_string(inner_doc).map_err(|e| {
                    KrmError::FilterFailed {
                        kind: "configmap".to_string(),
                        path: key.as_str().unwrap_or_default().to_string(),
                        reason: e.to_string(),
                    }
                })?);
            }
            *value = Value::String(out);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::krm::filters::labels::{LabelsFilter, LabelsSpec};
    use std::collections::BTreeMap;

    fn wrapped() -> ConfigMapFilter {
        ConfigMapFilter::new(Box::new(LabelsFilter::new(LabelsSpec {
            labels: BTreeMap::from([("env".to_string(), "prod".to_string())]),
        })))
    }

    #[test]
    fn test_filters_embedded_yaml() {
        let mut doc: Value = serde_yaml::from_str(
            r#"
kind: ConfigMap
metadata: {name: manifests}
data:
  deploy.yaml: |
    kind: Deployment
    metadata:
      name: web
  readme.txt: "not yaml"
"#,
        )
        .unwrap();
        wrapped().apply(&mut doc).unwrap();

        let embedded = doc
            .get("data")
            .and_then(|d| d.get("deploy.yaml"))
            .and_then(Value::as_str)
            .unwrap();
        assert!(embedded.contains("env: prod"));
        let untouched = doc
            .get("data")
            .and_then(|d| d.get("readme.txt"))
            .and_then(Value::as_str)
            .unwrap();
        assert_eq!(untouched, "not yaml");
    }

    #[test]
    fn test_non_configmap_untouched() {
        let mut doc: Value = serde_yaml::from_str("kind: Deployment\nmetadata: {name: web}").unwrap();
        let before = serde_yaml::to_string(&doc).unwrap();
        wrapped().apply(&mut doc).unwrap();
        assert_eq!(before, serde_yaml::to_string(&doc).unwrap());
    }
}
