//! # Repo helper
//!
//! Prepares working branches, commits, pushes, and drives PR creation and
//! merging for one repository pair: the repository commits are pushed to
//! (possibly a fork) and the repository pull requests are opened against.
//!
//! Commit-rewriting invariant: [`RepoHelper::prepare_branch`] always resets
//! the working branch to the remote base-branch tip. A prior hydros-authored
//! branch is stale work to be overwritten, never reused; an open PR on the
//! branch is what signals "do not touch", and the callers skip preparation
//! while one exists.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::client::RepoClient;
use super::merge::{MergeOptions, MergeState, Merger};
use super::transport::TransportPool;
use super::{ForgeError, PullRequest};
use crate::git::cloner::auth_header_args;
use crate::git::{git_ok, has_tracked_changes, run_git, GitError};

/// Identity a commit is authored as.
#[derive(Debug, Clone)]
pub struct CommitAuthor {
    pub name: String,
    pub email: String,
}

impl Default for CommitAuthor {
    fn default() -> Self {
        Self {
            name: "hydros".to_string(),
            email: "hydros@hydros.dev".to_string(),
        }
    }
}

/// Branch + PR workflow for one repository checkout.
pub struct RepoHelper {
    pool: Arc<TransportPool>,
    work_dir: PathBuf,
    /// Repository the working branch is pushed to.
    push_org: String,
    push_repo: String,
    /// Repository PRs are opened against; equal to the push repository
    /// unless the flow goes through a fork.
    base_org: String,
    base_repo: String,
    branch: String,
    base_branch: String,
    author: CommitAuthor,
}

impl RepoHelper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Arc<TransportPool>,
        work_dir: impl Into<PathBuf>,
        push_repo: (&str, &str),
        base_repo: (&str, &str),
        branch: impl Into<String>,
        base_branch: impl Into<String>,
        author: CommitAuthor,
    ) -> Self {
        Self {
            pool,
            work_dir: work_dir.into(),
            push_org: push_repo.0.to_string(),
            push_repo: push_repo.1.to_string(),
            base_org: base_repo.0.to_string(),
            base_repo: base_repo.1.to_string(),
            branch: branch.into(),
            base_branch: base_branch.into(),
            author,
        }
    }

    pub fn work_dir(&self) -> &PathBuf {
        &self.work_dir
    }

    fn is_fork_flow(&self) -> bool {
        (self.push_org.as_str(), self.push_repo.as_str())
            != (self.base_org.as_str(), self.base_repo.as_str())
    }

    /// `owner:branch` label of the working branch as the forge reports it.
    /// For fork PRs the owner is the fork owner, never the bare branch.
    pub fn head_label(&self) -> String {
        format!("{}:{}", self.push_org, self.branch)
    }

    /// Head parameter for PR creation against the base repository.
    fn head_param(&self) -> String {
        if self.is_fork_flow() {
            self.head_label()
        } else {
            self.branch.clone()
        }
    }

    /// Remote tracking ref the working branch is reset to.
    fn base_remote_ref(&self) -> String {
        if self.is_fork_flow() {
            format!("upstream/{}", self.base_branch)
        } else {
            format!("origin/{}", self.base_branch)
        }
    }

    async fn auth_args(&self) -> Result<Vec<String>, ForgeError> {
        let transport = self.pool.get(&self.push_org, &self.push_repo).await?;
        let token = transport.token().await?;
        Ok(auth_header_args("github.com", &token))
    }

    async fn client_for_base(&self) -> Result<RepoClient, ForgeError> {
        let transport = self.pool.get(&self.base_org, &self.base_repo).await?;
        Ok(RepoClient::new(transport))
    }

    /// Ensure the repository is cloned, fetch remotes, and reset the working
    /// branch to the remote base-branch tip. A dirty worktree fails unless
    /// `drop_changes` is set.
    pub async fn prepare_branch(&self, drop_changes: bool) -> Result<(), ForgeError> {
        let auth = self.auth_args().await?;

        if !self.work_dir.join(".git").exists() {
            if let Some(parent) = self.work_dir.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(GitError::Spawn)?;
            }
            let url = format!(
                "https://github.com/{}/{}.git",
                self.push_org, self.push_repo
            );
            info!(repo = %url, dir = %self.work_dir.display(), "cloning");
            let mut args = auth.clone();
            args.extend([
                "clone".to_string(),
                url.clone(),
                self.work_dir.display().to_string(),
            ]);
            let output = run_git::<String>(None, &args).await.map_err(ForgeError::Git)?;
            if !output.status.success() {
                return Err(GitError::CloneFailed {
                    url,
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                }
                .into());
            }
            if self.is_fork_flow() {
                let upstream = format!(
                    "https://github.com/{}/{}.git",
                    self.base_org, self.base_repo
                );
                git_ok(
                    Some(&self.work_dir),
                    &["remote", "add", "upstream", &upstream],
                )
                .await
                .map_err(ForgeError::Git)?;
            }
        }

        let mut fetch = auth.clone();
        fetch.extend(["fetch".to_string(), "origin".to_string()]);
        git_ok(Some(&self.work_dir), &fetch).await.map_err(ForgeError::Git)?;
        if self.is_fork_flow() {
            let mut fetch_upstream = auth;
            fetch_upstream.extend(["fetch".to_string(), "upstream".to_string()]);
            git_ok(Some(&self.work_dir), &fetch_upstream)
                .await
                .map_err(ForgeError::Git)?;
        }

        if !drop_changes && has_tracked_changes(&self.work_dir).await? {
            return Err(GitError::DirtyWorktree {
                dir: self.work_dir.display().to_string(),
            }
            .into());
        }

        // -B deletes any stale local branch and recreates it at the base
        // tip; --force discards whatever the worktree held.
        let base_ref = self.base_remote_ref();
        git_ok(
            Some(&self.work_dir),
            &["checkout", "--force", "-B", &self.branch, &base_ref],
        )
        .await
        .map_err(ForgeError::Git)?;
        debug!(branch = %self.branch, base = %base_ref, "branch prepared");
        Ok(())
    }

    /// Tracked-file dirtiness only; untracked files are ignored and
    /// `.gitignore` patterns apply before the test.
    pub async fn has_changes(&self) -> Result<bool, ForgeError> {
        Ok(has_tracked_changes(&self.work_dir).await?)
    }

    /// Stage everything, commit as the configured author, and push the
    /// working branch. A no-op when there is nothing to commit. Returns
    /// whether a commit was pushed.
    pub async fn commit_and_push(&self, message: &str, force: bool) -> Result<bool, ForgeError> {
        git_ok(Some(&self.work_dir), &["add", "-A"])
            .await
            .map_err(ForgeError::Git)?;
        let staged = run_git(Some(&self.work_dir), &["diff", "--cached", "--quiet"])
            .await
            .map_err(ForgeError::Git)?;
        if staged.status.success() {
            debug!(branch = %self.branch, "nothing to commit");
            return Ok(false);
        }

        git_ok(
            Some(&self.work_dir),
            &[
                "-c",
                &format!("user.name={}", self.author.name),
                "-c",
                &format!("user.email={}", self.author.email),
                "commit",
                "-m",
                message,
            ],
        )
        .await
        .map_err(ForgeError::Git)?;

        let mut push = self.auth_args().await?;
        push.push("push".to_string());
        if force {
            push.push("--force".to_string());
        }
        push.push("origin".to_string());
        push.push(format!(
            "refs/heads/{branch}:refs/heads/{branch}",
            branch = self.branch
        ));
        git_ok(Some(&self.work_dir), &push).await.map_err(ForgeError::Git)?;
        info!(branch = %self.branch, force, "pushed");
        Ok(true)
    }

    /// Hard-reset the working branch to a specific commit. Used when a
    /// render is pinned to the commit that triggered it rather than the
    /// branch tip.
    pub async fn reset_to(&self, sha: &str) -> Result<(), ForgeError> {
        git_ok(Some(&self.work_dir), &["reset", "--hard", sha])
            .await
            .map_err(ForgeError::Git)?;
        Ok(())
    }

    /// Commit hash of the current HEAD.
    pub async fn head_sha(&self) -> Result<String, ForgeError> {
        Ok(git_ok(Some(&self.work_dir), &["rev-parse", "HEAD"])
            .await
            .map_err(ForgeError::Git)?)
    }

    /// Open a PR from the working branch into the base branch. The message's
    /// first line is the title, the rest the body. Missing labels are logged
    /// and skipped. If a PR already exists for this head, it is returned.
    pub async fn create_pr(
        &self,
        message: &str,
        labels: &[String],
    ) -> Result<PullRequest, ForgeError> {
        let client = self.client_for_base().await?;
        let pr = client
            .create_pull(message, &self.head_param(), &self.base_branch)
            .await?;
        if !labels.is_empty() {
            client.add_labels(pr.number, labels).await?;
        }
        info!(number = pr.number, url = %pr.url, "pull request ready");
        Ok(pr)
    }

    /// The open PR for the working branch whose base matches, if any.
    pub async fn pull_request_for_branch(&self) -> Result<Option<PullRequest>, ForgeError> {
        let client = self.client_for_base().await?;
        client
            .pull_for_head(&self.head_label(), &self.base_branch)
            .await
    }

    /// Attempt to merge PR `number` once.
    pub async fn merge_pr(&self, number: u64) -> Result<MergeState, ForgeError> {
        let client = self.client_for_base().await?;
        Merger::new(&client)
            .with_merge_queue(true)
            .with_options(MergeOptions {
                author_email: Some(self.author.email.clone()),
                expected_head_oid: None,
            })
            .merge_pr(number)
            .await
    }

    /// Poll until PR `number` merges or closes, or the timeout expires.
    pub async fn merge_and_wait(
        &self,
        number: u64,
        timeout: Duration,
    ) -> Result<MergeState, ForgeError> {
        let client = self.client_for_base().await?;
        Merger::new(&client)
            .with_merge_queue(true)
            .with_options(MergeOptions {
                author_email: Some(self.author.email.clone()),
                expected_head_oid: None,
            })
            .merge_and_wait(number, timeout)
            .await
    }
}
