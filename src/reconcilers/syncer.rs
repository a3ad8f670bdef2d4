//! # Fork-PR syncer
//!
//! Produces hydrated manifests on a branch of a fork repository and opens a
//! pull request into the destination branch. The fork branch is always
//! recreated from the destination tip; `destPath` is replaced wholesale with
//! the fresh render, so files absent from the render are deleted. An open PR
//! for the sync branch means prior output is still under review: the syncer
//! leaves the branch alone and only nudges the merge along.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::work_dir;
use crate::api::manifest_sync::MANIFEST_SYNC_KIND;
use crate::api::{GroupVersionKind, ManifestSync, RawResource};
use crate::controller::Reconciler;
use crate::git::{Cloner, RepoSpec};
use crate::github::repo::CommitAuthor;
use crate::github::{MergeState, RepoHelper, TransportPool};
use crate::krm::{annotations, labels, parse_docs, Pipeline};
use crate::observability::metrics;

/// Syncs `ManifestSync` resources.
pub struct ManifestSyncReconciler {
    pool: Arc<TransportPool>,
    base_dir: PathBuf,
}

impl ManifestSyncReconciler {
    pub fn new(pool: Arc<TransportPool>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            base_dir: base_dir.into(),
        }
    }

    fn helper(&self, sync: &ManifestSync, fork_dir: &Path) -> RepoHelper {
        RepoHelper::new(
            Arc::clone(&self.pool),
            fork_dir,
            (&sync.spec.fork_repo.org, &sync.spec.fork_repo.repo),
            (&sync.spec.dest_repo.org, &sync.spec.dest_repo.repo),
            &sync.spec.fork_repo.branch,
            &sync.spec.dest_repo.branch,
            CommitAuthor::default(),
        )
    }

    fn commit_message(sync: &ManifestSync) -> String {
        format!(
            "Sync {}:{} to {}\n\nHydrated from {} branch {}.",
            sync.spec.source_repo.full_name(),
            sync.spec.source_path,
            sync.spec.dest_path,
            sync.spec.source_repo.full_name(),
            sync.spec.source_repo.branch,
        )
    }

    /// Run one sync.
    pub async fn sync(&self, sync: &ManifestSync) -> anyhow::Result<()> {
        sync.validate()?;
        let fork_dir = work_dir(
            &self.base_dir,
            "manifestsync",
            &sync.spec.fork_repo.org,
            &sync.spec.fork_repo.repo,
        );
        let helper = self.helper(sync, &fork_dir);

        // Do not touch the branch while its PR is open; just try to move the
        // merge along. A blocked merge is left for the next tick.
        if let Some(pr) = helper.pull_request_for_branch().await? {
            info!(pr = pr.number, url = %pr.url, "sync PR already open");
            let state = helper.merge_pr(pr.number).await?;
            match state {
                MergeState::Blocked(reason) => {
                    warn!(pr = pr.number, %reason, "merge blocked; will retry next cycle");
                }
                state => info!(pr = pr.number, ?state, "merge state"),
            }
            return Ok(());
        }

        let source_spec = RepoSpec {
            host: "github.com".to_string(),
            owner: sync.spec.source_repo.org.clone(),
            repo: sync.spec.source_repo.repo.clone(),
            branch: sync.spec.source_repo.branch.clone(),
            sha: String::new(),
        };
        let source_dir = Cloner::new(self.base_dir.join("manifestsync-sources"))
            .with_transports(Arc::clone(&self.pool))
            .ensure(&source_spec)
            .await
            .context("failed to clone source repository")?;

        helper
            .prepare_branch(true)
            .await
            .context("failed to prepare fork branch")?;

        let copied = copy_package(
            &source_dir.join(&sync.spec.source_path),
            &fork_dir.join(&sync.spec.dest_path),
            sync,
        )
        .context("failed to copy rendered package")?;
        info!(files = copied, dest = %sync.spec.dest_path, "package copied");

        let globs = [
            format!("{}/**/*.yaml", sync.spec.dest_path),
            format!("{}/**/*.yml", sync.spec.dest_path),
        ];
        Pipeline::new(&fork_dir, std::slice::from_ref(&sync.spec.dest_path), &globs)?
            .run()
            .context("pipeline failed over the fork tree")?;

        let message = Self::commit_message(sync);
        if !helper.commit_and_push(&message, true).await? {
            info!(sync = %sync.metadata.name, "destination already up to date");
            return Ok(());
        }

        let pr = helper.create_pr(&message, &[]).await?;
        metrics::prs_opened_inc();
        let timeout = Duration::from_secs(sync.spec.merge_timeout_seconds);
        let state = helper.merge_and_wait(pr.number, timeout).await?;
        match state {
            MergeState::Merged => info!(pr = pr.number, "sync merged"),
            MergeState::Blocked(reason) => {
                warn!(pr = pr.number, %reason, "merge blocked; will retry next cycle");
            }
            state => info!(pr = pr.number, ?state, "merge pending"),
        }
        Ok(())
    }

    /// Push the local working tree as-is to the fork branch and drive the PR
    /// through. Used by operators taking over a broken sync by hand.
    pub async fn takeover(&self, sync: &ManifestSync, repo_dir: &Path) -> anyhow::Result<()> {
        sync.validate()?;
        let helper = self.helper(sync, repo_dir);
        let message = format!(
            "Take over {} sync\n\nLocal working tree pushed as-is.",
            sync.metadata.name
        );
        helper.commit_and_push(&message, true).await?;
        let pr = helper.create_pr(&message, &[]).await?;
        metrics::prs_opened_inc();
        let timeout = Duration::from_secs(sync.spec.merge_timeout_seconds);
        let state = helper.merge_and_wait(pr.number, timeout).await?;
        info!(pr = pr.number, ?state, "takeover finished");
        Ok(())
    }
}

#[async_trait]
impl Reconciler for ManifestSyncReconciler {
    fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::hydros(MANIFEST_SYNC_KIND)
    }

    async fn reconcile_node(&self, resource: &RawResource) -> anyhow::Result<()> {
        let sync: ManifestSync = resource.decode()?;
        self.sync(&sync).await
    }
}

/// Replace `dest` with the documents from `src` that pass the sync's
/// selector, annotation, and exclude filters. Returns the number of files
/// written. Only KRM YAML survives the copy; everything previously under
/// `dest` is deleted first.
fn copy_package(src: &Path, dest: &Path, sync: &ManifestSync) -> anyhow::Result<usize> {
    if !src.is_dir() {
        anyhow::bail!("source path {} does not exist", src.display());
    }
    if dest.exists() {
        std::fs::remove_dir_all(dest)
            .with_context(|| format!("failed to clear {}", dest.display()))?;
    }
    std::fs::create_dir_all(dest)?;

    let excludes = crate::krm::glob_set(&sync.spec.excludes)?;
    let mut written = 0;
    for entry in walkdir::WalkDir::new(src)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        if excludes.is_match(rel) {
            debug!(path = %rel.display(), "excluded from sync");
            continue;
        }
        let is_yaml = matches!(
            entry.path().extension().and_then(|e| e.to_str()),
            Some("yaml" | "yml")
        );
        if !is_yaml {
            continue;
        }
        let raw = std::fs::read_to_string(entry.path())?;
        let docs = match parse_docs(&raw) {
            Ok(docs) => docs,
            Err(e) => {
                debug!(path = %rel.display(), error = %e, "skipping unparseable file");
                continue;
            }
        };
        let kept: Vec<_> = docs
            .into_iter()
            .filter(|doc| document_matches(doc, sync))
            .collect();
        if kept.is_empty() {
            continue;
        }

        let target = dest.join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = String::new();
        for (i, doc) in kept.iter().enumerate() {
            if i > 0 {
                out.push_str("---\n");
            }
            out.push_str(&serde_yaml::to_string(doc)?);
        }
        std::fs::write(&target, out)?;
        written += 1;
    }
    Ok(written)
}

fn document_matches(doc: &serde_yaml::Value, sync: &ManifestSync) -> bool {
    if let Some(selector) = &sync.spec.selector {
        if !selector.matches(&labels(doc)) {
            return false;
        }
    }
    let doc_annotations = annotations(doc);
    sync.spec
        .match_annotations
        .iter()
        .all(|(k, v)| doc_annotations.get(k) == Some(v))
}
