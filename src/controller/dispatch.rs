//! # Resource dispatch
//!
//! Reads YAML documents, demultiplexes them by kind through the registry,
//! and invokes the matching reconciler once or periodically. One bad
//! resource never aborts the batch: per-resource errors are accumulated into
//! an aggregate and partial successes are preserved.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use super::backoff::FibonacciBackoff;
use super::Registry;
use crate::api::{load_resources, RawResource};

/// A list of per-resource errors with a summary; partial successes are
/// preserved by construction.
#[derive(Debug, Default)]
pub struct AggregateError {
    pub errors: Vec<(String, anyhow::Error)>,
}

impl AggregateError {
    pub fn push(&mut self, subject: impl Into<String>, error: anyhow::Error) {
        self.errors.push((subject.into(), error));
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_result(self) -> Result<(), AggregateError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} resource(s) failed:", self.errors.len())?;
        for (subject, error) in &self.errors {
            writeln!(f, "  {subject}: {error:#}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

/// Dispatches resources from files to their reconcilers.
pub struct ResourceDispatcher {
    registry: Registry,
}

impl ResourceDispatcher {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// Expand paths into YAML files: files pass through, directories are
    /// walked for `.yaml`/`.yml`.
    pub fn collect_files(paths: &[PathBuf]) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for path in paths {
            if path.is_file() {
                files.push(path.clone());
                continue;
            }
            for entry in WalkDir::new(path)
                .sort_by_file_name()
                .into_iter()
                .filter_map(Result::ok)
            {
                if entry.file_type().is_file() && is_yaml(entry.path()) {
                    files.push(entry.path().to_path_buf());
                }
            }
        }
        files
    }

    async fn reconcile_resource(&self, resource: &RawResource) -> anyhow::Result<()> {
        let reconciler = self.registry.get(&resource.gvk)?;
        reconciler.reconcile_node(resource).await
    }

    /// Dispatch every resource in one file, accumulating per-resource
    /// errors.
    pub async fn apply_file(&self, path: &Path) -> Result<usize, AggregateError> {
        let mut aggregate = AggregateError::default();
        let resources = match load_resources(path) {
            Ok(resources) => resources,
            Err(e) => {
                aggregate.push(path.display().to_string(), e.into());
                return Err(aggregate);
            }
        };

        let mut applied = 0;
        for resource in &resources {
            let key = resource.key().to_string();
            debug!(resource = %key, "dispatching");
            match self.reconcile_resource(resource).await {
                Ok(()) => applied += 1,
                Err(e) => {
                    error!(resource = %key, error = %format!("{e:#}"), "reconcile failed");
                    aggregate.push(key, e);
                }
            }
        }
        match aggregate.into_result() {
            Ok(()) => Ok(applied),
            Err(aggregate) => Err(aggregate),
        }
    }

    /// Dispatch every resource under `paths` once.
    pub async fn apply_paths(&self, paths: &[PathBuf]) -> Result<usize, AggregateError> {
        let files = Self::collect_files(paths);
        if files.is_empty() {
            warn!(?paths, "no YAML files found");
        }
        let mut aggregate = AggregateError::default();
        let mut applied = 0;
        for file in &files {
            match self.apply_file(file).await {
                Ok(n) => applied += n,
                Err(mut e) => aggregate.errors.append(&mut e.errors),
            }
        }
        match aggregate.into_result() {
            Ok(()) => Ok(applied),
            Err(aggregate) => Err(aggregate),
        }
    }

    /// Tick at `period` forever, re-reading the files each tick and
    /// reconciling every resource. Errors are logged and the loop continues;
    /// failing resources are paced with a Fibonacci backoff and resume the
    /// regular cadence after a success.
    pub async fn run_periodically(&self, paths: &[PathBuf], period: Duration) -> anyhow::Result<()> {
        let mut paused: HashMap<String, (FibonacciBackoff, Instant)> = HashMap::new();
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(period = ?period, "running periodically");
        loop {
            tick.tick().await;
            let files = Self::collect_files(paths);
            for file in &files {
                let resources = match load_resources(file) {
                    Ok(resources) => resources,
                    Err(e) => {
                        error!(file = %file.display(), error = %e, "skipping unreadable file");
                        continue;
                    }
                };
                for resource in &resources {
                    let key = resource.key().to_string();
                    if let Some((_, not_before)) = paused.get(&key) {
                        if Instant::now() < *not_before {
                            debug!(resource = %key, "backing off");
                            continue;
                        }
                    }
                    match self.reconcile_resource(resource).await {
                        Ok(()) => {
                            paused.remove(&key);
                        }
                        Err(e) => {
                            error!(resource = %key, error = %format!("{e:#}"), "reconcile failed");
                            let (backoff, not_before) = paused.entry(key).or_insert_with(|| {
                                (
                                    FibonacciBackoff::new(
                                        period.as_secs().max(1),
                                        period.as_secs().max(1) * 32,
                                    ),
                                    Instant::now(),
                                )
                            });
                            *not_before = Instant::now() + backoff.next_backoff();
                        }
                    }
                }
            }
        }
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::GroupVersionKind;
    use crate::controller::Reconciler;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counting {
        gvk: GroupVersionKind,
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Reconciler for Counting {
        fn gvk(&self) -> GroupVersionKind {
            self.gvk.clone()
        }

        async fn reconcile_node(&self, _resource: &RawResource) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("deliberate failure");
            }
            Ok(())
        }
    }

    fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test]
    async fn test_partial_success_is_preserved() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::new();
        registry
            .register(Arc::new(Counting {
                gvk: GroupVersionKind::hydros("GitHubReleaser"),
                calls: Arc::clone(&calls),
                fail: false,
            }))
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let file = write_file(
            dir.path(),
            "resources.yaml",
            r"
apiVersion: hydros.dev/v1alpha1
kind: GitHubReleaser
metadata: {name: good}
spec: {org: a, repo: b}
---
apiVersion: hydros.dev/v1alpha1
kind: Mystery
metadata: {name: unknown}
spec: {}
",
        );

        let dispatcher = ResourceDispatcher::new(registry);
        let err = dispatcher.apply_file(&file).await.unwrap_err();
        assert_eq!(err.errors.len(), 1);
        assert!(err.errors[0].0.contains("Mystery"));
        assert!(err.to_string().contains("1 resource(s) failed"));
        // The good resource was still reconciled.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_apply_paths_walks_directories() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::new();
        registry
            .register(Arc::new(Counting {
                gvk: GroupVersionKind::hydros("GitHubReleaser"),
                calls: Arc::clone(&calls),
                fail: false,
            }))
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let doc = "apiVersion: hydros.dev/v1alpha1\nkind: GitHubReleaser\nmetadata: {name: r}\nspec: {org: a, repo: b}\n";
        write_file(dir.path(), "one.yaml", doc);
        write_file(dir.path(), "two.yml", doc);
        write_file(dir.path(), "ignored.txt", doc);

        let dispatcher = ResourceDispatcher::new(registry);
        let applied = dispatcher
            .apply_paths(&[dir.path().to_path_buf()])
            .await
            .unwrap();
        assert_eq!(applied, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
