//! `ManifestSync` resources: fork-PR syncing of hydrated manifests.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Metadata, ResourceError};

pub const MANIFEST_SYNC_KIND: &str = "ManifestSync";

/// Declares that the rendered KRM package under `sourcePath` of the source
/// repository should be kept in sync with `destPath` of the destination
/// repository, by pushing hydrated trees to a branch on the fork repository
/// and opening a pull request into the destination branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSync {
    pub api_version: String,
    pub kind: String,
    pub metadata: Metadata,
    pub spec: ManifestSyncSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSyncSpec {
    /// Repository containing the source package.
    pub source_repo: GitHubRepoRef,
    /// Repository the hydrated branch is pushed to. May be the same
    /// repository as `destRepo`.
    pub fork_repo: GitHubRepoRef,
    /// Repository and branch the pull request is opened against.
    pub dest_repo: GitHubRepoRef,
    /// Path of the package inside the source repository.
    pub source_path: String,
    /// Path the rendered package is written to inside the destination tree.
    pub dest_path: String,
    /// Only documents carrying all of these annotations are synced.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_annotations: BTreeMap<String, String>,
    /// Glob patterns (relative to `sourcePath`) excluded from the sync.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excludes: Vec<String>,
    /// Label selector applied to documents before syncing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
    /// How long to wait for the pull request to merge. Seconds; defaults to
    /// 600.
    #[serde(default = "default_merge_timeout_seconds")]
    pub merge_timeout_seconds: u64,
}

fn default_merge_timeout_seconds() -> u64 {
    600
}

/// Reference to a branch of a GitHub repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitHubRepoRef {
    pub org: String,
    pub repo: String,
    #[serde(default = "default_branch")]
    pub branch: String,
}

fn default_branch() -> String {
    "main".to_string()
}

impl GitHubRepoRef {
    /// `org/repo` as used in forge API paths and log lines.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.org, self.repo)
    }

    /// Anonymous HTTPS clone URL.
    pub fn clone_url(&self) -> String {
        format!("https://github.com/{}/{}.git", self.org, self.repo)
    }
}

/// Subset of the Kubernetes label selector: equality matches only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }
}

impl ManifestSync {
    pub fn validate(&self) -> Result<(), ResourceError> {
        let fail = |msg: &str| {
            Err(ResourceError::InvalidResource(
                format!("ManifestSync/{}", self.metadata.name),
                msg.to_string(),
            ))
        };
        if self.spec.source_path.is_empty() {
            return fail("spec.sourcePath must be set");
        }
        if self.spec.dest_path.is_empty() {
            return fail("spec.destPath must be set");
        }
        for (field, repo) in [
            ("sourceRepo", &self.spec.source_repo),
            ("forkRepo", &self.spec.fork_repo),
            ("destRepo", &self.spec.dest_repo),
        ] {
            if repo.org.is_empty() || repo.repo.is_empty() {
                return fail(&format!("spec.{field} must name an org and repo"));
            }
        }
        if self.spec.fork_repo.branch == self.spec.dest_repo.branch
            && self.spec.fork_repo.org == self.spec.dest_repo.org
            && self.spec.fork_repo.repo == self.spec.dest_repo.repo
        {
            return fail("spec.forkRepo.branch must differ from spec.destRepo.branch");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sync() -> ManifestSync {
        serde_yaml::from_str(
            r"
apiVersion: hydros.dev/v1alpha1
kind: ManifestSync
metadata:
  name: hydrate
spec:
  sourceRepo: {org: jlewi, repo: hydros, branch: main}
  forkRepo: {org: hydros-bot, repo: hydros-hydrated, branch: hydros/hydrate}
  destRepo: {org: jlewi, repo: hydros-hydrated, branch: main}
  sourcePath: manifests
  destPath: rendered
",
        )
        .unwrap()
    }

    #[test]
    fn test_valid_sync() {
        let s = sync();
        assert!(s.validate().is_ok());
        assert_eq!(s.spec.merge_timeout_seconds, 600);
        assert_eq!(s.spec.source_repo.clone_url(), "https://github.com/jlewi/hydros.git");
    }

    #[test]
    fn test_same_fork_and_dest_branch_rejected() {
        let mut s = sync();
        s.spec.fork_repo = s.spec.dest_repo.clone();
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_selector_matches() {
        let selector = LabelSelector {
            match_labels: BTreeMap::from([("env".to_string(), "prod".to_string())]),
        };
        let mut labels = BTreeMap::from([("env".to_string(), "prod".to_string())]);
        assert!(selector.matches(&labels));
        labels.insert("env".to_string(), "dev".to_string());
        assert!(!selector.matches(&labels));
    }
}
