//! Image prefix rewriting.

use serde::Deserialize;
use serde_yaml::Value;

use super::Filter;
use crate::krm::{kind, KrmError};

#[derive(Debug, Clone, Deserialize)]
pub struct ImageMapping {
    /// Prefix an image reference must start with.
    pub from: String,
    /// Replacement prefix.
    pub to: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImagesSpec {
    #[serde(default)]
    pub mappings: Vec<ImageMapping>,
}

/// Rewrites the registry prefix of every `image:` field. The first matching
/// mapping wins. CustomResourceDefinition documents are hard-excluded: CRD
/// schemas embed field names like `image` that must not be touched.
pub struct ImagePrefixFilter {
    spec: ImagesSpec,
}

impl ImagePrefixFilter {
    pub fn new(spec: ImagesSpec) -> Self {
        Self { spec }
    }

    fn rewrite(&self, image: &str) -> Option<String> {
        for mapping in &self.spec.mappings {
            if let Some(rest) = image.strip_prefix(&mapping.from) {
                return Some(format!("{}{}", mapping.to, rest));
            }
        }
        None
    }

    fn walk(&self, value: &mut Value) {
        match value {
            Value::Mapping(map) => {
                for (key, child) in map.iter_mut() {
                    if key.as_str() == Some("image") {
                        if let Some(image) = child.as_str() {
                            if let Some(rewritten) = self.rewrite(image) {
                                *child = Value::String(rewritten);
                                continue;
                            }
                        }
                    }
                    self.walk(child);
                }
            }
            Value::Sequence(seq) => {
                for child in seq.iter_mut() {
                    self.walk(child);
                }
            }
            _ => {}
        }
    }
}

impl Filter for ImagePrefixFilter {
    fn kind(&self) -> &'static str {
        "images"
    }

    fn apply(&self, doc: &mut Value) -> Result<(), KrmError> {
        if kind(doc) == Some("CustomResourceDefinition") {
            return Ok(());
        }
        if !self.spec.mappings.is_empty() {
            self.walk(doc);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> ImagePrefixFilter {
        ImagePrefixFilter::new(ImagesSpec {
            mappings: vec![ImageMapping {
                from: "gcr.io/my-project/".to_string(),
                to: "ghcr.io/my-org/".to_string(),
            }],
        })
    }

    #[test]
    fn test_rewrites_matching_prefix() {
        let mut doc: Value = serde_yaml::from_str(
            r"
kind: Deployment
spec:
  template:
    spec:
      containers:
        - name: web
          image: gcr.io/my-project/web:v1
        - name: other
          image: docker.io/library/nginx
",
        )
        .unwrap();
        filter().apply(&mut doc).unwrap();
        let rendered = serde_yaml::to_string(&doc).unwrap();
        assert!(rendered.contains("ghcr.io/my-org/web:v1"));
        assert!(rendered.contains("docker.io/library/nginx"));
    }

    #[test]
    fn test_crds_are_excluded() {
        let mut doc: Value = serde_yaml::from_str(
            r"
kind: CustomResourceDefinition
spec:
  schema:
    image: gcr.io/my-project/sample
",
        )
        .unwrap();
        filter().apply(&mut doc).unwrap();
        let rendered = serde_yaml::to_string(&doc).unwrap();
        assert!(rendered.contains("gcr.io/my-project/sample"));
    }
}
