//! # KRM packages
//!
//! A package is an unordered collection of KRM documents addressed by path.
//! Documents are plain `serde_yaml` values shaped like
//! `{apiVersion, kind, metadata, spec, status?}`; this module provides the
//! accessors the transformation pipeline needs, plus package read/write.
//!
//! Reading is forgiving: files that do not match the package globs or fail
//! YAML parsing are skipped with a debug log, never aborting the pipeline.
//! Writing re-serializes every document, which is also the pipeline's
//! terminating format step: output is canonical `serde_yaml` formatting
//! regardless of how the input was laid out.

pub mod filters;
pub mod pipeline;

pub use pipeline::Pipeline;

use std::path::{Path, PathBuf};

use globset::GlobSet;
use serde::Deserialize;
use serde_yaml::Value;
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

/// Annotation carrying a document's path relative to the package root.
pub const PATH_ANNOTATION: &str = "config.kubernetes.io/path";

/// Annotation carrying a document's index within its file.
pub const INDEX_ANNOTATION: &str = "config.kubernetes.io/index";

/// Annotation recording which function file produced a transformation.
pub const SOURCE_FUNCTION_ANNOTATION: &str = "hydros.dev/source-function-path";

/// Annotation carrying the directory a function applies to.
pub const TARGET_DIR_ANNOTATION: &str = "hydros.dev/target-dir";

/// Functions carrying this annotation are applied to YAML embedded in
/// config-map data values instead of to documents directly.
pub const CONFIGMAP_WRAP_ANNOTATION: &str = "hydros.dev/wrap-in-configmap";

/// Functions never touch CustomResourceDefinition documents unless they
/// carry this annotation with the value `"true"`. The image-prefix filter
/// excludes CRDs unconditionally.
pub const CRD_OPT_IN_ANNOTATION: &str = "hydros.dev/include-crds";

#[derive(Debug, Error)]
pub enum KrmError {
    #[error("io error under {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize {path}: {source}")]
    Serialize {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid function {path}: {reason}")]
    InvalidFunction { path: String, reason: String },

    #[error("unknown filter kind {0:?}")]
    UnknownFilterKind(String),

    #[error("filter {kind} failed on {path}: {reason}")]
    FilterFailed {
        kind: String,
        path: String,
        reason: String,
    },

    #[error("invalid glob {0:?}: {1}")]
    InvalidGlob(String, String),
}

/// `kind` of a document, when present.
pub fn kind(doc: &Value) -> Option<&str> {
    doc.get("kind").and_then(Value::as_str)
}

/// `metadata.name` of a document, when present.
pub fn name(doc: &Value) -> Option<&str> {
    doc.get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
}

/// `metadata.namespace` of a document, when present.
pub fn namespace(doc: &Value) -> Option<&str> {
    doc.get("metadata")
        .and_then(|m| m.get("namespace"))
        .and_then(Value::as_str)
}

fn metadata_section<'a>(doc: &'a Value, section: &str) -> Option<&'a Value> {
    doc.get("metadata").and_then(|m| m.get(section))
}

/// Read a single annotation.
pub fn annotation<'a>(doc: &'a Value, key: &str) -> Option<&'a str> {
    metadata_section(doc, "annotations")
        .and_then(|a| a.get(key))
        .and_then(Value::as_str)
}

/// Read a single label.
pub fn label<'a>(doc: &'a Value, key: &str) -> Option<&'a str> {
    metadata_section(doc, "labels")
        .and_then(|l| l.get(key))
        .and_then(Value::as_str)
}

fn ensure_child_mapping<'a>(map: &'a mut serde_yaml::Mapping, key: &str) -> &'a mut serde_yaml::Mapping {
    let entry = map
        .entry(Value::String(key.to_string()))
        .or_insert_with(|| Value::Mapping(serde_yaml::Mapping::new()));
    if !entry.is_mapping() {
        *entry = Value::Mapping(serde_yaml::Mapping::new());
    }
    entry.as_mapping_mut().expect("just ensured a mapping")
}

/// Set an annotation, creating `metadata.annotations` as needed.
pub fn set_annotation(doc: &mut Value, key: &str, value: &str) {
    let Some(map) = doc.as_mapping_mut() else {
        return;
    };
    let metadata = ensure_child_mapping(map, "metadata");
    let annotations = ensure_child_mapping(metadata, "annotations");
    annotations.insert(
        Value::String(key.to_string()),
        Value::String(value.to_string()),
    );
}

/// All labels of a document as owned pairs.
pub fn labels(doc: &Value) -> std::collections::BTreeMap<String, String> {
    metadata_section(doc, "labels")
        .and_then(Value::as_mapping)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| {
                    Some((k.as_str()?.to_string(), v.as_str()?.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// All annotations of a document as owned pairs.
pub fn annotations(doc: &Value) -> std::collections::BTreeMap<String, String> {
    metadata_section(doc, "annotations")
        .and_then(Value::as_mapping)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| {
                    Some((k.as_str()?.to_string(), v.as_str()?.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// One YAML file of a package: its path relative to the package root and the
/// documents it holds.
#[derive(Debug, Clone)]
pub struct PackageFile {
    pub rel_path: PathBuf,
    pub docs: Vec<Value>,
}

/// A package rooted at a directory.
#[derive(Debug)]
pub struct Package {
    pub root: PathBuf,
    pub files: Vec<PackageFile>,
}

impl Package {
    /// Read every YAML file under `root` matched by `globs` (relative
    /// paths). Non-matching files and files that fail to parse are skipped
    /// with a debug log.
    pub fn read(root: &Path, globs: &GlobSet) -> Result<Self, KrmError> {
        let mut files = Vec::new();
        for entry in WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .to_path_buf();
            if !globs.is_match(&rel) {
                continue;
            }
            let raw = match std::fs::read_to_string(entry.path()) {
                Ok(raw) => raw,
                Err(e) => {
                    debug!(path = %rel.display(), error = %e, "skipping unreadable file");
                    continue;
                }
            };
            match parse_docs(&raw) {
                Ok(docs) if !docs.is_empty() => files.push(PackageFile { rel_path: rel, docs }),
                Ok(_) => {}
                Err(e) => {
                    debug!(path = %rel.display(), error = %e, "skipping unparseable file");
                }
            }
        }
        Ok(Self {
            root: root.to_path_buf(),
            files,
        })
    }

    /// Write every file back under the package root, one document stream per
    /// file. This is the pipeline's terminating format step.
    pub fn write(&self) -> Result<(), KrmError> {
        for file in &self.files {
            let path = self.root.join(&file.rel_path);
            let io_err = |source| KrmError::Io {
                path: path.display().to_string(),
                source,
            };
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
            let mut out = String::new();
            for (i, doc) in file.docs.iter().enumerate() {
                if i > 0 {
                    out.push_str("---\n");
                }
                let rendered =
                    serde_yaml::to_string(doc).map_err(|source| KrmError::Serialize {
                        path: path.display().to_string(),
                        source,
                    })?;
                out.push_str(&rendered);
            }
            std::fs::write(&path, out).map_err(io_err)?;
        }
        Ok(())
    }
}

/// Parse a multi-document YAML stream, dropping null documents.
pub fn parse_docs(raw: &str) -> Result<Vec<Value>, serde_yaml::Error> {
    let mut docs = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(raw) {
        let value = Value::deserialize(doc)?;
        if !value.is_null() {
            docs.push(value);
        }
    }
    Ok(docs)
}

/// Build a [`GlobSet`] from patterns, failing on the first invalid one.
pub fn glob_set(patterns: &[String]) -> Result<GlobSet, KrmError> {
    let mut builder = globset::GlobSetBuilder::new();
    for pattern in patterns {
        let glob = globset::Glob::new(pattern)
            .map_err(|e| KrmError::InvalidGlob(pattern.clone(), e.to_string()))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| KrmError::InvalidGlob("<set>".to_string(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors() {
        let doc: Value = serde_yaml::from_str(
            r"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
  namespace: prod
  labels: {app: web}
  annotations: {note: hello}
",
        )
        .unwrap();
        assert_eq!(kind(&doc), Some("Deployment"));
        assert_eq!(name(&doc), Some("web"));
        assert_eq!(namespace(&doc), Some("prod"));
        assert_eq!(label(&doc, "app"), Some("web"));
        assert_eq!(annotation(&doc, "note"), Some("hello"));
    }

    #[test]
    fn test_set_annotation_creates_metadata() {
        let mut doc: Value = serde_yaml::from_str("kind: ConfigMap").unwrap();
        set_annotation(&mut doc, PATH_ANNOTATION, "cfg.yaml");
        assert_eq!(annotation(&doc, PATH_ANNOTATION), Some("cfg.yaml"));
    }

    #[test]
    fn test_package_read_skips_unparseable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("good.yaml"), "kind: ConfigMap\n").unwrap();
        std::fs::write(dir.path().join("bad.yaml"), "kind: [unterminated\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not yaml\n").unwrap();

        let globs = glob_set(&["**/*.yaml".to_string()]).unwrap();
        let package = Package::read(dir.path(), &globs).unwrap();
        assert_eq!(package.files.len(), 1);
        assert_eq!(package.files[0].rel_path, PathBuf::from("good.yaml"));
    }

    #[test]
    fn test_package_write_is_canonical() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("cfg.yaml"),
            "kind:    ConfigMap\nmetadata:\n    name:   cfg\n",
        )
        .unwrap();
        let globs = glob_set(&["*.yaml".to_string()]).unwrap();
        let package = Package::read(dir.path(), &globs).unwrap();
        package.write().unwrap();

        let first = std::fs::read_to_string(dir.path().join("cfg.yaml")).unwrap();
        let package = Package::read(dir.path(), &globs).unwrap();
        package.write().unwrap();
        let second = std::fs::read_to_string(dir.path().join("cfg.yaml")).unwrap();
        assert_eq!(first, second);
    }
}
