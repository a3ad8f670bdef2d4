//! `RepoConfig` resources: in-place rendering of a repository's branches.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::manifest_sync::GitHubRepoRef;
use super::{Metadata, ResourceError};

pub const REPO_CONFIG_KIND: &str = "RepoConfig";

/// Configures the in-place renderer for a repository: which branches trigger
/// hydration, which files are transformed, and where the KRM functions live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoConfig {
    pub api_version: String,
    pub kind: String,
    pub metadata: Metadata,
    pub spec: RepoConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoConfigSpec {
    pub repo: GitHubRepoRef,
    #[serde(default)]
    pub in_place_configs: Vec<InPlaceConfig>,
}

/// One renderable branch. `baseBranch` is unique within a resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InPlaceConfig {
    /// Branch whose pushes trigger a render, and whose tip the working branch
    /// is reset to.
    pub base_branch: String,
    /// Branch the hydrated commit is pushed to. Defaults to `baseBranch`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pr_branch: String,
    /// Files matched by these globs are fed through the pipeline.
    pub globs: Vec<String>,
    /// Directories containing KRM transformation functions.
    pub function_paths: Vec<String>,
}

impl InPlaceConfig {
    /// Branch the rendered commit lands on.
    pub fn publish_branch(&self) -> &str {
        if self.pr_branch.is_empty() {
            &self.base_branch
        } else {
            &self.pr_branch
        }
    }
}

impl RepoConfig {
    pub fn validate(&self) -> Result<(), ResourceError> {
        let fail = |msg: String| {
            Err(ResourceError::InvalidResource(
                format!("RepoConfig/{}", self.metadata.name),
                msg,
            ))
        };
        if self.spec.repo.org.is_empty() || self.spec.repo.repo.is_empty() {
            return fail("spec.repo must name an org and repo".to_string());
        }
        let mut seen = BTreeSet::new();
        for cfg in &self.spec.in_place_configs {
            if cfg.base_branch.is_empty() {
                return fail("spec.inPlaceConfigs[].baseBranch must be set".to_string());
            }
            if !seen.insert(cfg.base_branch.as_str()) {
                return fail(format!(
                    "duplicate baseBranch {:?} in spec.inPlaceConfigs",
                    cfg.base_branch
                ));
            }
            if cfg.globs.is_empty() {
                return fail(format!(
                    "inPlaceConfig for branch {:?} has no globs",
                    cfg.base_branch
                ));
            }
        }
        Ok(())
    }

    /// The config whose base branch matches, if any.
    pub fn config_for_branch(&self, branch: &str) -> Option<&InPlaceConfig> {
        self.spec
            .in_place_configs
            .iter()
            .find(|c| c.base_branch == branch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RepoConfig {
        serde_yaml::from_str(
            r"
apiVersion: hydros.dev/v1alpha1
kind: RepoConfig
metadata:
  name: hydros
spec:
  repo: {org: jlewi, repo: hydros, branch: main}
  inPlaceConfigs:
    - baseBranch: main
      globs: ['manifests/**/*.yaml']
      functionPaths: ['functions']
    - baseBranch: staging
      prBranch: staging-hydrated
      globs: ['manifests/**/*.yaml']
      functionPaths: ['functions']
",
        )
        .unwrap()
    }

    #[test]
    fn test_publish_branch_defaults_to_base() {
        let cfg = config();
        assert_eq!(cfg.spec.in_place_configs[0].publish_branch(), "main");
        assert_eq!(cfg.spec.in_place_configs[1].publish_branch(), "staging-hydrated");
    }

    #[test]
    fn test_duplicate_base_branch_rejected() {
        let mut cfg = config();
        cfg.spec.in_place_configs[1].base_branch = "main".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_config_for_branch() {
        let cfg = config();
        assert!(cfg.config_for_branch("staging").is_some());
        assert!(cfg.config_for_branch("release").is_none());
    }
}
