//! # Git operations
//!
//! All git operations shell out to the `git` CLI through
//! [`tokio::process::Command`]. Command-line git keeps the crate free of
//! libgit2 and works with any credential helper the host has configured;
//! hydros only adds an HTTP extraheader when it holds forge credentials.

pub mod cloner;

pub use cloner::{Cloner, RepoSpec};

use std::path::Path;
use std::process::Output;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to clone {url}: {stderr}")]
    CloneFailed { url: String, stderr: String },

    #[error("failed to fetch origin in {dir}: {stderr}")]
    FetchFailed { dir: String, stderr: String },

    #[error("failed to checkout {rev} in {dir}: {stderr}")]
    CheckoutFailed {
        rev: String,
        dir: String,
        stderr: String,
    },

    #[error("revision {rev} not found in {dir}")]
    RefNotFound { rev: String, dir: String },

    #[error("working tree at {dir} has uncommitted changes")]
    DirtyWorktree { dir: String },

    #[error("git {args:?} failed: {stderr}")]
    CommandFailed { args: Vec<String>, stderr: String },

    #[error("failed to run git: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Run `git` with the given arguments, returning the raw output.
pub(crate) async fn run_git<S: AsRef<str>>(
    dir: Option<&Path>,
    args: &[S],
) -> Result<Output, GitError> {
    let mut cmd = tokio::process::Command::new("git");
    if let Some(dir) = dir {
        cmd.arg("-C").arg(dir);
    }
    for arg in args {
        cmd.arg(arg.as_ref());
    }
    Ok(cmd.output().await?)
}

/// Run `git` and fail with [`GitError::CommandFailed`] on a nonzero exit,
/// returning trimmed stdout otherwise.
pub(crate) async fn git_ok<S: AsRef<str>>(
    dir: Option<&Path>,
    args: &[S],
) -> Result<String, GitError> {
    let output = run_git(dir, args).await?;
    if !output.status.success() {
        return Err(GitError::CommandFailed {
            args: args.iter().map(|a| a.as_ref().to_string()).collect(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Whether tracked files in the working tree differ from HEAD. Untracked
/// files are ignored and `.gitignore` patterns apply before the test.
pub(crate) async fn has_tracked_changes(dir: &Path) -> Result<bool, GitError> {
    let stdout = git_ok(
        Some(dir),
        &["status", "--porcelain", "--untracked-files=no"],
    )
    .await?;
    Ok(!stdout.is_empty())
}

/// Resolve a revision to a commit hash, if it exists.
pub(crate) async fn rev_parse(dir: &Path, rev: &str) -> Result<Option<String>, GitError> {
    let output = run_git(
        Some(dir),
        &["rev-parse", "--verify", "--quiet", &format!("{rev}^{{commit}}")],
    )
    .await?;
    if !output.status.success() {
        return Ok(None);
    }
    Ok(Some(
        String::from_utf8_lossy(&output.stdout).trim().to_string(),
    ))
}
