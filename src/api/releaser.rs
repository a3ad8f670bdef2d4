//! `GitHubReleaser` resources.

use serde::{Deserialize, Serialize};

use super::{Metadata, ResourceError};

pub const GITHUB_RELEASER_KIND: &str = "GitHubReleaser";

/// Cuts `vMAJOR.MINOR.PATCH` releases for a repository by incrementing the
/// last numeric segment of the highest semver tag, starting at `v0.0.1` when
/// the repository has no prior releases.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitHubReleaser {
    pub api_version: String,
    pub kind: String,
    pub metadata: Metadata,
    pub spec: GitHubReleaserSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitHubReleaserSpec {
    pub org: String,
    pub repo: String,
}

impl GitHubReleaser {
    pub fn validate(&self) -> Result<(), ResourceError> {
        if self.spec.org.is_empty() || self.spec.repo.is_empty() {
            return Err(ResourceError::InvalidResource(
                format!("GitHubReleaser/{}", self.metadata.name),
                "spec.org and spec.repo must be set".to_string(),
            ));
        }
        Ok(())
    }
}
