//! # GitHub releaser
//!
//! Cuts `vMAJOR.MINOR.PATCH` releases: the next version is the
//! highest-sorted semver tag with its last numeric segment incremented, or
//! `v0.0.1` when the repository has no prior semver releases. Releases
//! target the tip of the default branch and carry generated notes.

use std::sync::Arc;

use async_trait::async_trait;
use semver::Version;
use tracing::info;

use crate::api::releaser::GITHUB_RELEASER_KIND;
use crate::api::{GitHubReleaser, GroupVersionKind, RawResource};
use crate::controller::Reconciler;
use crate::github::client::RepoClient;
use crate::github::TransportPool;

/// Reconciles `GitHubReleaser` resources.
pub struct ReleaserReconciler {
    pool: Arc<TransportPool>,
}

impl ReleaserReconciler {
    pub fn new(pool: Arc<TransportPool>) -> Self {
        Self { pool }
    }

    pub async fn release(&self, releaser: &GitHubReleaser) -> anyhow::Result<()> {
        releaser.validate()?;
        let transport = self
            .pool
            .get(&releaser.spec.org, &releaser.spec.repo)
            .await?;
        let client = RepoClient::new(transport);

        let releases = client.list_releases().await?;
        let tags: Vec<String> = releases.into_iter().map(|r| r.tag_name).collect();
        let tag = next_version(&tags);

        let default_branch = client.repo_info().await?.default_branch;
        client.create_release(&tag, &default_branch).await?;
        info!(
            repo = format!("{}/{}", releaser.spec.org, releaser.spec.repo),
            tag,
            target = default_branch,
            "release created"
        );
        Ok(())
    }
}

#[async_trait]
impl Reconciler for ReleaserReconciler {
    fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::hydros(GITHUB_RELEASER_KIND)
    }

    async fn reconcile_node(&self, resource: &RawResource) -> anyhow::Result<()> {
        let releaser: GitHubReleaser = resource.decode()?;
        self.release(&releaser).await
    }
}

/// The next release tag given existing release tags. Tags that do not parse
/// as `v`-prefixed semver are ignored.
pub(crate) fn next_version(tags: &[String]) -> String {
    let highest = tags
        .iter()
        .filter_map(|tag| Version::parse(tag.strip_prefix('v')?).ok())
        .max();
    match highest {
        Some(version) => format!(
            "v{}.{}.{}",
            version.major,
            version.minor,
            version.patch + 1
        ),
        None => "v0.0.1".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(raw: &[&str]) -> Vec<String> {
        raw.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_first_release_is_v0_0_1() {
        assert_eq!(next_version(&[]), "v0.0.1");
        assert_eq!(next_version(&tags(&["nightly", "not-semver"])), "v0.0.1");
    }

    #[test]
    fn test_increments_last_numeric_segment() {
        assert_eq!(next_version(&tags(&["v0.0.1", "v0.0.2"])), "v0.0.3");
        assert_eq!(next_version(&tags(&["v1.2.9", "v1.2.10"])), "v1.2.11");
    }

    #[test]
    fn test_highest_sorted_wins() {
        assert_eq!(
            next_version(&tags(&["v0.9.9", "v1.0.0", "v0.10.3"])),
            "v1.0.1"
        );
    }

    #[test]
    fn test_non_semver_tags_ignored() {
        assert_eq!(
            next_version(&tags(&["release-2024", "v0.3.1", "v0.3"])),
            "v0.3.2"
        );
    }
}
