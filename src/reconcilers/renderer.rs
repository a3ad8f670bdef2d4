//! # In-place renderer
//!
//! For a repository branch with an `inPlaceConfig`, the renderer prepares
//! the branch, applies the transformation pipeline to the configured globs,
//! and commits the hydrated result back - to the base branch itself, or to a
//! dedicated PR branch when one is configured. The outcome is reported as a
//! forge check run (`success`, `skipped`, or `failure`).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{info, warn};

use super::work_dir;
use crate::api::repo_config::REPO_CONFIG_KIND;
use crate::api::{GroupVersionKind, InPlaceConfig, RawResource, RepoConfig};
use crate::controller::manager::NamedReconciler;
use crate::controller::Reconciler;
use crate::github::client::{CheckConclusion, RepoClient};
use crate::github::repo::CommitAuthor;
use crate::github::{RepoHelper, TransportPool};
use crate::krm::Pipeline;

/// Name of the check run the renderer reports under.
const CHECK_NAME: &str = "hydros-render";

/// A render request: the commit that triggered it and the branch config to
/// apply. Events for the same repository coalesce in the manager, latest
/// wins.
#[derive(Debug, Clone)]
pub struct RenderEvent {
    pub commit: String,
    pub branch_config: InPlaceConfig,
}

/// Renders one repository in place.
pub struct Renderer {
    pool: Arc<TransportPool>,
    config: RepoConfig,
    work_dir: PathBuf,
}

impl Renderer {
    pub fn new(pool: Arc<TransportPool>, base_dir: &std::path::Path, config: RepoConfig) -> Self {
        let work_dir = work_dir(
            base_dir,
            "repoconfig",
            &config.spec.repo.org,
            &config.spec.repo.repo,
        );
        Self {
            pool,
            config,
            work_dir,
        }
    }

    fn helper(&self, cfg: &InPlaceConfig) -> RepoHelper {
        let repo = (
            self.config.spec.repo.org.as_str(),
            self.config.spec.repo.repo.as_str(),
        );
        RepoHelper::new(
            Arc::clone(&self.pool),
            &self.work_dir,
            repo,
            repo,
            cfg.publish_branch(),
            &cfg.base_branch,
            CommitAuthor::default(),
        )
    }

    /// Render one branch config at `commit` (empty = the remote base tip).
    pub async fn run_once(&self, cfg: &InPlaceConfig, commit: &str) -> anyhow::Result<()> {
        let helper = self.helper(cfg);

        // An open PR for a dedicated publish branch means a human is still
        // looking at prior output; leave the branch alone.
        if cfg.publish_branch() != cfg.base_branch {
            if let Some(pr) = helper.pull_request_for_branch().await? {
                info!(
                    repo = %self.config.spec.repo.full_name(),
                    branch = cfg.publish_branch(),
                    pr = pr.number,
                    "open PR exists; skipping render"
                );
                return Ok(());
            }
        }

        helper
            .prepare_branch(true)
            .await
            .context("failed to prepare branch")?;
        if !commit.is_empty() {
            helper
                .reset_to(commit)
                .await
                .with_context(|| format!("failed to reset to {commit}"))?;
        }
        let base_sha = helper.head_sha().await?;

        let outcome = self.hydrate(cfg, &helper).await;
        let conclusion = match &outcome {
            Ok(true) => CheckConclusion::Success,
            Ok(false) => CheckConclusion::Skipped,
            Err(_) => CheckConclusion::Failure,
        };
        self.report(&base_sha, conclusion, &outcome).await;
        outcome.map(|_| ())
    }

    /// Apply the pipeline and publish; returns whether a commit was pushed.
    async fn hydrate(&self, cfg: &InPlaceConfig, helper: &RepoHelper) -> anyhow::Result<bool> {
        let pipeline = Pipeline::new(&self.work_dir, &cfg.function_paths, &cfg.globs)?;
        let written = pipeline.run()?;
        info!(
            repo = %self.config.spec.repo.full_name(),
            branch = %cfg.base_branch,
            files = written.len(),
            "pipeline applied"
        );

        let message = format!(
            "Hydrate {} onto {}",
            cfg.base_branch,
            cfg.publish_branch()
        );
        let pushed = helper.commit_and_push(&message, true).await?;
        if !pushed {
            info!(repo = %self.config.spec.repo.full_name(), "render produced no changes");
        }
        Ok(pushed)
    }

    async fn report(
        &self,
        head_sha: &str,
        conclusion: CheckConclusion,
        outcome: &anyhow::Result<bool>,
    ) {
        let summary = match outcome {
            Ok(true) => "hydrated manifests committed".to_string(),
            Ok(false) => "no changes to commit".to_string(),
            Err(e) => format!("render failed: {e:#}"),
        };
        let transport = match self
            .pool
            .get(&self.config.spec.repo.org, &self.config.spec.repo.repo)
            .await
        {
            Ok(transport) => transport,
            Err(e) => {
                warn!(error = %e, "cannot report check run");
                return;
            }
        };
        if let Err(e) = RepoClient::new(transport)
            .create_check_run(CHECK_NAME, head_sha, conclusion, &summary)
            .await
        {
            warn!(error = %e, "failed to create check run");
        }
    }

    /// Render for an event, or every configured branch when there is none
    /// (periodic resync and one-shot apply).
    pub async fn handle(&self, event: Option<RenderEvent>) -> anyhow::Result<()> {
        match event {
            Some(event) => self.run_once(&event.branch_config, &event.commit).await,
            None => {
                for cfg in &self.config.spec.in_place_configs {
                    self.run_once(cfg, "").await?;
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl NamedReconciler<RenderEvent> for Renderer {
    fn name(&self) -> String {
        format!("RepoConfig/{}", self.config.spec.repo.full_name())
    }

    async fn reconcile(&self, event: Option<RenderEvent>) -> anyhow::Result<()> {
        self.handle(event).await
    }
}

/// Registry-facing reconciler: decodes `RepoConfig` documents and renders
/// every configured branch once.
pub struct RepoConfigReconciler {
    pool: Arc<TransportPool>,
    base_dir: PathBuf,
}

impl RepoConfigReconciler {
    pub fn new(pool: Arc<TransportPool>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            base_dir: base_dir.into(),
        }
    }
}

#[async_trait]
impl Reconciler for RepoConfigReconciler {
    fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::hydros(REPO_CONFIG_KIND)
    }

    async fn reconcile_node(&self, resource: &RawResource) -> anyhow::Result<()> {
        let config: RepoConfig = resource.decode()?;
        config.validate()?;
        Renderer::new(Arc::clone(&self.pool), &self.base_dir, config)
            .handle(None)
            .await
    }
}
