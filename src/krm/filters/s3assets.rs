//! S3 asset URI rewriting.

use serde::Deserialize;
use serde_yaml::Value;

use super::Filter;
use crate::krm::KrmError;

#[derive(Debug, Clone, Deserialize)]
pub struct S3AssetsSpec {
    /// Bucket every `s3://` URI is repointed at; keys are preserved.
    pub bucket: String,
}

/// Rewrites `s3://{bucket}/{key}` strings anywhere in a document to point at
/// the target bucket.
pub struct S3AssetsFilter {
    spec: S3AssetsSpec,
}

impl S3AssetsFilter {
    pub fn new(spec: S3AssetsSpec) -> Self {
        Self { spec }
    }

    fn rewrite(&self, uri: &str) -> Option<String> {
        let rest = uri.strip_prefix("s3://")?;
        let (_, key) = rest.split_once('/')?;
        Some(format!("s3://{}/{}", self.spec.bucket, key))
    }

    fn walk(&self, value: &mut Value) {
        match value {
            Value::String(s) => {
                if let Some(rewritten) = self.rewrite(s) {
                    *s = rewritten;
                }
            }
            Value::Mapping(map) => {
                for (_, child) in map.iter_mut() {
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

impl Filter for S3AssetsFilter {
    fn kind(&self) -> &'static str {
        "s3assets"
    }

    fn apply(&self, doc: &mut Value) -> Result<(), KrmError> {
        if !self.spec.bucket.is_empty() {
            self.walk(doc);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrites_bucket_keeps_key() {
        let filter = S3AssetsFilter::new(S3AssetsSpec {
            bucket: "prod-assets".to_string(),
        });
        let mut doc: Value = serde_yaml::from_str(
            r"
kind: ConfigMap
data:
  model: s3://dev-assets/models/latest.bin
  plain: not-an-s3-uri
",
        )
        .unwrap();
        filter.apply(&mut doc).unwrap();
        let rendered = serde_yaml::to_string(&doc).unwrap();
        assert!(rendered.contains("s3://prod-assets/models/latest.bin"));
        assert!(rendered.contains("not-an-s3-uri"));
    }

    #[test]
    fn test_bucket_only_uri_untouched() {
        let filter = S3AssetsFilter::new(S3AssetsSpec {
            bucket: "prod-assets".to_string(),
        });
        let mut doc: Value = serde_yaml::from_str("data: {root: 's3://dev-assets'}").unwrap();
        filter.apply(&mut doc).unwrap();
        assert!(serde_yaml::to_string(&doc).unwrap().contains("s3://dev-assets"));
    }
}
