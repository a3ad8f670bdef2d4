//! # GitHub forge integration
//!
//! Hand-built typed clients over `reqwest`, in the same shape as the GCP
//! Secret Manager REST client this crate's secret resolver descends from:
//! explicit request/response structs, no vendor SDK.
//!
//! - [`transport`] mints and caches per-repository installation tokens from a
//!   single GitHub App credential.
//! - [`client`] wraps the REST and GraphQL endpoints hydros needs: pull
//!   requests, labels, releases, and check runs.
//! - [`repo`] prepares working branches and drives commit/push/PR flows.
//! - [`merge`] implements the merge-state machine (direct squash, auto-merge,
//!   merge queue).

pub mod client;
pub mod merge;
pub mod repo;
pub mod transport;

pub use client::{PullRequest, RepoClient};
pub use merge::{MergeState, Merger};
pub use repo::RepoHelper;
pub use transport::{Transport, TransportPool};

use thiserror::Error;

/// Default REST endpoint; override with `GITHUB_API_URL` for tests.
pub(crate) fn api_base_url() -> String {
    std::env::var("GITHUB_API_URL").unwrap_or_else(|_| "https://api.github.com".to_string())
}

#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("no GitHub App installation found for {owner}/{repo}")]
    InstallationNotFound { owner: String, repo: String },

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("invalid GitHub App private key: {0}")]
    InvalidKey(String),

    #[error("GitHub returned {status} for {operation}: {message}")]
    Api {
        operation: String,
        status: u16,
        message: String,
    },

    #[error("merge blocked: {0}")]
    MergeBlocked(String),

    #[error("timed out waiting for PR #{0} to merge")]
    TimedOut(u64),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Git(#[from] crate::git::GitError),
}
