//! # Resource model
//!
//! All hydros resources share the Kubernetes resource envelope:
//!
//! ```yaml
//! apiVersion: hydros.dev/v1alpha1
//! kind: ManifestSync
//! metadata:
//!   name: my-sync
//! spec: ...
//! ```
//!
//! `(apiVersion, kind, namespace, name)` is the globally unique identifier of
//! a resource; the namespace may be empty. Resources are loaded from plain
//! (multi-document) YAML files and demultiplexed by kind; each reconciler
//! receives its document pre-parsed into its typed shape.

pub mod image;
pub mod manifest_sync;
pub mod releaser;
pub mod repo_config;

pub use image::{Image, ImageSpec, ReplicatedImage, ReplicatedImageSpec};
pub use manifest_sync::{ManifestSync, ManifestSyncSpec};
pub use releaser::{GitHubReleaser, GitHubReleaserSpec};
pub use repo_config::{InPlaceConfig, RepoConfig, RepoConfigSpec};

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("invalid resource {0}: {1}")]
    InvalidResource(String, String),

    #[error("document is missing {0}")]
    MissingField(&'static str),

    #[error("failed to read {path}: {source}")]
    ReadFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    ParseFailed {
        path: String,
        source: serde_yaml::Error,
    },
}

/// Standard object metadata shared by every resource kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// `(apiVersion, kind)` pair used as the registry key for reconcilers.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct GroupVersionKind {
    pub api_version: String,
    pub kind: String,
}

impl GroupVersionKind {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
        }
    }

    /// The GVK of a hydros resource at the current API version.
    pub fn hydros(kind: impl Into<String>) -> Self {
        Self::new(crate::API_VERSION, kind)
    }
}

impl fmt::Display for GroupVersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version, self.kind)
    }
}

/// Globally unique identifier of a resource instance.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResourceKey {
    pub gvk: GroupVersionKind,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.gvk.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.gvk.kind, self.namespace, self.name)
        }
    }
}

/// A YAML document with its envelope fields extracted and the full document
/// retained for typed decoding by the matching reconciler.
#[derive(Debug, Clone)]
pub struct RawResource {
    pub gvk: GroupVersionKind,
    pub metadata: Metadata,
    pub document: serde_yaml::Value,
}

impl RawResource {
    pub fn key(&self) -> ResourceKey {
        ResourceKey {
            gvk: self.gvk.clone(),
            namespace: self.metadata.namespace.clone(),
            name: self.metadata.name.clone(),
        }
    }

    /// Decode the retained document into a typed resource.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, ResourceError> {
        serde_yaml::from_value(self.document.clone()).map_err(|e| {
            ResourceError::InvalidResource(self.key().to_string(), e.to_string())
        })
    }

    fn from_document(document: serde_yaml::Value, path: &str) -> Result<Self, ResourceError> {
        let api_version = document
            .get("apiVersion")
            .and_then(serde_yaml::Value::as_str)
            .ok_or(ResourceError::MissingField("apiVersion"))?
            .to_string();
        let kind = document
            .get("kind")
            .and_then(serde_yaml::Value::as_str)
            .ok_or(ResourceError::MissingField("kind"))?
            .to_string();
        let metadata: Metadata = document
            .get("metadata")
            .cloned()
            .map(serde_yaml::from_value)
            .transpose()
            .map_err(|e| ResourceError::ParseFailed {
                path: path.to_string(),
                source: e,
            })?
            .ok_or(ResourceError::MissingField("metadata"))?;
        if metadata.name.is_empty() {
            return Err(ResourceError::MissingField("metadata.name"));
        }
        Ok(Self {
            gvk: GroupVersionKind::new(api_version, kind),
            metadata,
            document,
        })
    }
}

/// Read all resource documents from a YAML file.
///
/// The file may contain multiple documents separated by `---`. Empty
/// documents are skipped.
pub fn load_resources(path: &Path) -> Result<Vec<RawResource>, ResourceError> {
    let display = path.display().to_string();
    let raw = std::fs::read_to_string(path).map_err(|e| ResourceError::ReadFailed {
        path: display.clone(),
        source: e,
    })?;

    let mut resources = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(&raw) {
        let value = serde_yaml::Value::deserialize(doc).map_err(|e| ResourceError::ParseFailed {
            path: display.clone(),
            source: e,
        })?;
        if value.is_null() {
            continue;
        }
        resources.push(RawResource::from_document(value, &display)?);
    }
    Ok(resources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_resources_multi_document() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r"
apiVersion: hydros.dev/v1alpha1
kind: ManifestSync
metadata:
  name: first
spec:
  sourceRepo: {{org: jlewi, repo: hydros, branch: main}}
  forkRepo: {{org: bot, repo: hydros, branch: hydros/sync}}
  destRepo: {{org: jlewi, repo: hydrated, branch: main}}
  sourcePath: manifests
  destPath: manifests
---
---
apiVersion: hydros.dev/v1alpha1
kind: GitHubReleaser
metadata:
  name: second
  namespace: ci
spec:
  org: jlewi
  repo: hydros
"
        )
        .unwrap();

        let resources = load_resources(file.path()).unwrap();
        assert_eq!(resources.len(), 2);
        assert_eq!(resources[0].gvk.kind, "ManifestSync");
        assert_eq!(resources[0].metadata.name, "first");
        assert_eq!(resources[0].key().to_string(), "ManifestSync/first");
        assert_eq!(resources[1].key().to_string(), "GitHubReleaser/ci/second");
    }

    #[test]
    fn test_document_without_kind_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "apiVersion: v1\nmetadata:\n  name: nope\n").unwrap();

        let err = load_resources(file.path()).unwrap_err();
        assert!(matches!(err, ResourceError::MissingField("kind")));
    }

    #[test]
    fn test_decode_typed() {
        let doc: serde_yaml::Value = serde_yaml::from_str(
            r"
apiVersion: hydros.dev/v1alpha1
kind: GitHubReleaser
metadata:
  name: releaser
spec:
  org: jlewi
  repo: hydros
",
        )
        .unwrap();
        let raw = RawResource::from_document(doc, "inline").unwrap();
        let releaser: GitHubReleaser = raw.decode().unwrap();
        assert_eq!(releaser.spec.org, "jlewi");
        assert_eq!(releaser.spec.repo, "hydros");
    }
}
