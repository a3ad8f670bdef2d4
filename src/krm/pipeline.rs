//! # Transformation pipeline
//!
//! A pipeline is an ordered sequence of filters over a package of KRM
//! documents. Function documents are collected from the configured function
//! paths, ordered deepest-target-first, and dispatched by kind; each function
//! transforms the documents under its target directory. Applying a pipeline
//! to its own output yields the same output, up to formatting.

use std::path::{Path, PathBuf};

use globset::GlobSet;
use serde_yaml::Value;
use tracing::debug;
use walkdir::WalkDir;

use super::filters;
use super::{
    annotation, glob_set, kind, parse_docs, set_annotation, KrmError, Package,
    CRD_OPT_IN_ANNOTATION, INDEX_ANNOTATION, PATH_ANNOTATION, SOURCE_FUNCTION_ANNOTATION,
    TARGET_DIR_ANNOTATION,
};

/// Directory names that are overlay leaves: a function living in one targets
/// the leaf's parent tree, not just the leaf.
const OVERLAY_LEAVES: &[&str] = &["base", "dev", "staging", "prod", "production"];

/// Directories literally named `functions` hold the functions of their
/// parent; they borrow the parent's depth and target.
const FUNCTIONS_DIR: &str = "functions";

/// A function document found under a function path.
#[derive(Debug, Clone)]
pub struct Function {
    pub doc: Value,
    /// Path of the function file, relative to the package root.
    pub source_path: PathBuf,
    /// Directory whose tree this function transforms, relative to the root.
    pub target_dir: PathBuf,
    /// Position of the document within its file.
    pub index: usize,
    /// Depth used for ordering; `functions` directories borrow their
    /// parent's depth.
    depth: usize,
}

/// An ordered set of filters over the package rooted at `root`.
pub struct Pipeline {
    root: PathBuf,
    function_paths: Vec<String>,
    globs: GlobSet,
}

impl Pipeline {
    pub fn new(
        root: impl Into<PathBuf>,
        function_paths: &[String],
        globs: &[String],
    ) -> Result<Self, KrmError> {
        Ok(Self {
            root: root.into(),
            function_paths: function_paths.to_vec(),
            globs: glob_set(globs)?,
        })
    }

    /// Collect function documents from the function paths, annotate them,
    /// and order them deepest path first (lexical tie-break by path, then by
    /// index when paths are equal).
    pub fn discover_functions(&self) -> Result<Vec<Function>, KrmError> {
        let mut functions = Vec::new();
        for function_path in &self.function_paths {
            let dir = self.root.join(function_path);
            if !dir.is_dir() {
                debug!(path = %dir.display(), "function path does not exist; skipping");
                continue;
            }
            for entry in WalkDir::new(&dir)
                .sort_by_file_name()
                .into_iter()
                .filter_map(Result::ok)
            {
                if !entry.file_type().is_file() || !is_yaml(entry.path()) {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(&self.root)
                    .unwrap_or(entry.path())
                    .to_path_buf();
                let raw = match std::fs::read_to_string(entry.path()) {
                    Ok(raw) => raw,
                    Err(e) => {
                        debug!(path = %rel.display(), error = %e, "skipping unreadable function file");
                        continue;
                    }
                };
                let docs = match parse_docs(&raw) {
                    Ok(docs) => docs,
                    Err(e) => {
                        debug!(path = %rel.display(), error = %e, "skipping unparseable function file");
                        continue;
                    }
                };
                for (index, mut doc) in docs.into_iter().enumerate() {
                    if doc.get("kind").and_then(Value::as_str).is_none() {
                        debug!(path = %rel.display(), index, "skipping document without kind");
                        continue;
                    }
                    let effective = effective_dir(&rel);
                    let target = target_dir(&effective);
                    set_annotation(&mut doc, PATH_ANNOTATION, &rel.display().to_string());
                    set_annotation(&mut doc, INDEX_ANNOTATION, &index.to_string());
                    set_annotation(
                        &mut doc,
                        SOURCE_FUNCTION_ANNOTATION,
                        &rel.display().to_string(),
                    );
                    set_annotation(
                        &mut doc,
                        TARGET_DIR_ANNOTATION,
                        &target.display().to_string(),
                    );
                    functions.push(Function {
                        depth: effective.components().count(),
                        doc,
                        source_path: rel.clone(),
                        target_dir: target,
                        index,
                    });
                }
            }
        }

        functions.sort_by(|a, b| {
            b.depth
                .cmp(&a.depth)
                .then_with(|| a.source_path.cmp(&b.source_path))
                .then_with(|| a.index.cmp(&b.index))
        });
        Ok(functions)
    }

    /// Run every function over its target tree and write the result back.
    /// Returns the paths of the files that were rewritten, relative to the
    /// root.
    pub fn run(&self) -> Result<Vec<PathBuf>, KrmError> {
        let functions = self.discover_functions()?;
        if functions.is_empty() {
            debug!(root = %self.root.display(), "no functions found; nothing to render");
            return Ok(Vec::new());
        }

        let mut package = Package::read(&self.root, &self.globs)?;
        let mut touched = vec![false; package.files.len()];

        for function in &functions {
            let path = function.source_path.display().to_string();
            let filter = filters::build(&function.doc, &path)?;
            let include_crds =
                annotation(&function.doc, CRD_OPT_IN_ANNOTATION).is_some_and(|v| v == "true");
            for (i, file) in package.files.iter_mut().enumerate() {
                if !file.rel_path.starts_with(&function.target_dir) {
                    continue;
                }
                for doc in &mut file.docs {
                    if kind(doc) == Some("CustomResourceDefinition") && !include_crds {
                        continue;
                    }
                    filter.apply(doc).map_err(|e| KrmError::FilterFailed {
                        kind: filter.kind().to_string(),
                        path: file.rel_path.display().to_string(),
                        reason: e.to_string(),
                    })?;
                }
                touched[i] = true;
            }
        }

        // Terminating format step: only files a filter visited are
        // re-serialized.
        let written: Vec<PathBuf> = package
            .files
            .iter()
            .zip(&touched)
            .filter(|(_, t)| **t)
            .map(|(f, _)| f.rel_path.clone())
            .collect();
        package.files.retain({
            let mut keep = touched.into_iter();
            move |_| keep.next().unwrap_or(false)
        });
        package.write()?;
        Ok(written)
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml")
    )
}

/// The directory whose depth and target a function file inherits: its parent,
/// or its grandparent when the parent is a `functions` directory.
fn effective_dir(rel_file: &Path) -> PathBuf {
    let parent = rel_file.parent().unwrap_or(Path::new(""));
    if parent.file_name().and_then(|n| n.to_str()) == Some(FUNCTIONS_DIR) {
        parent.parent().unwrap_or(Path::new("")).to_path_buf()
    } else {
        parent.to_path_buf()
    }
}

/// Strip one overlay component only when the directory is a known leaf;
/// otherwise the function targets its full parent directory.
fn target_dir(effective: &Path) -> PathBuf {
    let leaf = effective.file_name().and_then(|n| n.to_str());
    if leaf.is_some_and(|l| OVERLAY_LEAVES.contains(&l)) {
        effective.parent().unwrap_or(Path::new("")).to_path_buf()
    } else {
        effective.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_dir_borrows_parent_of_functions() {
        assert_eq!(
            effective_dir(Path::new("apps/web/functions/labels.yaml")),
            PathBuf::from("apps/web")
        );
        assert_eq!(
            effective_dir(Path::new("apps/web/labels.yaml")),
            PathBuf::from("apps/web")
        );
    }

    #[test]
    fn test_target_dir_strips_known_overlay_leaf() {
        assert_eq!(target_dir(Path::new("apps/web/prod")), PathBuf::from("apps/web"));
        assert_eq!(target_dir(Path::new("apps/web")), PathBuf::from("apps/web"));
    }

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    fn sample_package(root: &Path) {
        write(
            root,
            "manifests/app/deploy.yaml",
            "kind: Deployment\nmetadata:\n  name: web\n",
        );
        write(
            root,
            "manifests/other.yaml",
            "kind: ConfigMap\nmetadata:\n  name: cfg\n",
        );
        write(
            root,
            "manifests/app/functions/labels.yaml",
            "kind: labels\nmetadata:\n  name: app-labels\nspec:\n  labels: {tier: app}\n",
        );
        write(
            root,
            "manifests/functions/labels.yaml",
            "kind: labels\nmetadata:\n  name: common-labels\nspec:\n  labels: {org: hydros, tier: common}\n",
        );
    }

    fn pipeline(root: &Path) -> Pipeline {
        Pipeline::new(
            root,
            &["manifests".to_string()],
            &["manifests/**/*.yaml".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn test_discovery_orders_deepest_first() {
        let dir = tempfile::tempdir().unwrap();
        sample_package(dir.path());
        let functions = pipeline(dir.path()).discover_functions().unwrap();
        assert_eq!(functions.len(), 2);
        assert_eq!(
            functions[0].source_path,
            PathBuf::from("manifests/app/functions/labels.yaml")
        );
        assert_eq!(functions[0].target_dir, PathBuf::from("manifests/app"));
        assert_eq!(functions[1].target_dir, PathBuf::from("manifests"));
    }

    #[test]
    fn test_run_applies_in_order() {
        let dir = tempfile::tempdir().unwrap();
        sample_package(dir.path());
        let written = pipeline(dir.path()).run().unwrap();
        assert!(written.contains(&PathBuf::from("manifests/app/deploy.yaml")));

        let deploy =
            std::fs::read_to_string(dir.path().join("manifests/app/deploy.yaml")).unwrap();
        // Deeper function ran first, shallower one overwrote the shared key.
        assert!(deploy.contains("tier: common"));
        assert!(deploy.contains("org: hydros"));

        let other = std::fs::read_to_string(dir.path().join("manifests/other.yaml")).unwrap();
        assert!(other.contains("org: hydros"));
        assert!(!other.contains("tier: app"));
    }

    #[test]
    fn test_pipeline_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        sample_package(dir.path());
        pipeline(dir.path()).run().unwrap();
        let first =
            std::fs::read_to_string(dir.path().join("manifests/app/deploy.yaml")).unwrap();
        pipeline(dir.path()).run().unwrap();
        let second =
            std::fs::read_to_string(dir.path().join("manifests/app/deploy.yaml")).unwrap();
        assert_eq!(first, second);
    }
}
