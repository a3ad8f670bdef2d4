//! # Transformation filters
//!
//! A filter is a typed transformation over a single KRM document, built from
//! a function document's `kind` and `spec`. The pipeline applies the ordered
//! filters of a target directory to every document of the target tree and
//! finishes with the format step (canonical re-serialization on write).

mod configmap;
mod envs;
mod fields;
mod images;
mod labels;
mod patches;
mod s3assets;

pub use configmap::ConfigMapFilter;
pub use envs::EnvsFilter;
pub use fields::FieldsFilter;
pub use images::ImagePrefixFilter;
pub use labels::LabelsFilter;
pub use patches::PatchesFilter;
pub use s3assets::S3AssetsFilter;

use serde_yaml::Value;

use super::{annotation, KrmError, CONFIGMAP_WRAP_ANNOTATION};

/// A transformation applied document by document.
pub trait Filter: Send + Sync {
    /// The `kind` this filter was built from.
    fn kind(&self) -> &'static str;

    /// Transform one document in place.
    fn apply(&self, doc: &mut Value) -> Result<(), KrmError>;
}

fn spec_of(doc: &Value, path: &str) -> Result<Value, KrmError> {
    doc.get("spec").cloned().ok_or_else(|| KrmError::InvalidFunction {
        path: path.to_string(),
        reason: "function has no spec".to_string(),
    })
}

fn from_spec<T: serde::de::DeserializeOwned>(doc: &Value, path: &str) -> Result<T, KrmError> {
    serde_yaml::from_value(spec_of(doc, path)?).map_err(|e| KrmError::InvalidFunction {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

/// Build the typed filter for a function document. Functions annotated with
/// `hydros.dev/wrap-in-configmap` are applied to YAML embedded in config-map
/// data values instead of to documents directly.
pub fn build(doc: &Value, path: &str) -> Result<Box<dyn Filter>, KrmError> {
    let kind = doc
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| KrmError::InvalidFunction {
            path: path.to_string(),
            reason: "function has no kind".to_string(),
        })?;

    let filter: Box<dyn Filter> = match kind.to_ascii_lowercase().as_str() {
        "labels" => Box::new(LabelsFilter::new(from_spec(doc, path)?)),
        "envs" => Box::new(EnvsFilter::new(from_spec(doc, path)?)),
        "images" => Box::new(ImagePrefixFilter::new(from_spec(doc, path)?)),
        "s3assets" => Box::new(S3AssetsFilter::new(from_spec(doc, path)?)),
        "patches" => Box::new(PatchesFilter::new(from_spec(doc, path)?)?),
        "fields" => Box::new(FieldsFilter::new(from_spec(doc, path)?)),
        "configmap" => {
            let inner = spec_of(doc, path)?
                .get("filter")
                .cloned()
                .ok_or_else(|| KrmError::InvalidFunction {
                    path: path.to_string(),
                    reason: "configmap function has no spec.filter".to_string(),
                })?;
            return Ok(Box::new(ConfigMapFilter::new(build(&inner, path)?)));
        }
        other => return Err(KrmError::UnknownFilterKind(other.to_string())),
    };

    if annotation(doc, CONFIGMAP_WRAP_ANNOTATION).is_some_and(|v| v == "true") {
        return Ok(Box::new(ConfigMapFilter::new(filter)));
    }
    Ok(filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_dispatches_by_kind() {
        let doc: Value = serde_yaml::from_str(
            r"
kind: labels
spec:
  labels: {app: web}
",
        )
        .unwrap();
        let filter = build(&doc, "f.yaml").unwrap();
        assert_eq!(filter.kind(), "labels");
    }

    #[test]
    fn test_build_unknown_kind_fails() {
        let doc: Value = serde_yaml::from_str("kind: sparkle\nspec: {}\n").unwrap();
        assert!(matches!(
            build(&doc, "f.yaml"),
            Err(KrmError::UnknownFilterKind(_))
        ));
    }

    #[test]
    fn test_wrap_annotation_yields_configmap_filter() {
        let doc: Value = serde_yaml::from_str(
            r"
kind: labels
metadata:
  annotations:
    hydros.dev/wrap-in-configmap: 'true'
spec:
  labels: {app: web}
",
        )
        .unwrap();
        let filter = build(&doc, "f.yaml").unwrap();
        assert_eq!(filter.kind(), "configmap");
    }
}
