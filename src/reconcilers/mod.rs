//! # Reconcilers
//!
//! One reconciler per resource kind: the in-place renderer (`RepoConfig`),
//! the fork-PR syncer (`ManifestSync`), the image replicator
//! (`ReplicatedImage`), the image builder (`Image`), and the releaser
//! (`GitHubReleaser`). Each reconciler owns a dedicated working directory
//! under the configured base, keyed by reconciler kind and repository; no
//! two reconcilers share one.

pub mod image_build;
pub mod releaser;
pub mod renderer;
pub mod replicator;
pub mod syncer;

pub use image_build::ImageReconciler;
pub use releaser::ReleaserReconciler;
pub use renderer::{RenderEvent, Renderer, RepoConfigReconciler};
pub use replicator::ReplicatedImageReconciler;
pub use syncer::ManifestSyncReconciler;

use std::path::{Path, PathBuf};

/// Working directory exclusively owned by one reconciler:
/// `{base}/{reconciler-kind}/github.com/{owner}/{repo}`.
pub(crate) fn work_dir(base: &Path, kind: &str, owner: &str, repo: &str) -> PathBuf {
    base.join(kind).join("github.com").join(owner).join(repo)
}
