//! # Pull-request merger
//!
//! Merge state is derived from the forge's `mergeStateStatus` plus an
//! `isInMergeQueue` bit. Immediately mergeable PRs are squash-merged
//! directly; blocked PRs either fail with a reason or, when a merge queue is
//! configured, are handed to auto-merge. The merge method is always squash,
//! for linear history; any deviation is a design change, not a flag.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::client::RepoClient;
use super::ForgeError;

/// Poll interval for [`Merger::merge_and_wait`].
const MERGE_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Outcome of a merge attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeState {
    Merged,
    /// Waiting in the merge queue (auto-merge enabled or already queued).
    Enqueued,
    Closed,
    /// Not mergeable right now; the reason is user-visible.
    Blocked(String),
    Unknown,
}

impl MergeState {
    /// Terminal states stop [`Merger::merge_and_wait`] polling.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MergeState::Merged | MergeState::Closed)
    }
}

/// Optional constraints on the merge mutation.
#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    /// Commit author email recorded on the squash commit.
    pub author_email: Option<String>,
    /// Abort if the head has moved past this OID.
    pub expected_head_oid: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MergeInfo {
    id: String,
    state: String,
    #[serde(default)]
    merge_state_status: String,
    #[serde(default)]
    is_in_merge_queue: bool,
    #[serde(default)]
    head_ref_oid: String,
}

const MERGE_INFO_QUERY: &str = r"
query($owner: String!, $name: String!, $number: Int!) {
  repository(owner: $owner, name: $name) {
    pullRequest(number: $number) {
      id
      state
      mergeStateStatus
      isInMergeQueue
      headRefOid
    }
  }
}";

const MERGE_MUTATION: &str = r"
mutation($id: ID!, $expectedHeadOid: GitObjectID, $authorEmail: String) {
  mergePullRequest(input: {
    pullRequestId: $id,
    mergeMethod: SQUASH,
    expectedHeadOid: $expectedHeadOid,
    authorEmail: $authorEmail
  }) {
    pullRequest { state }
  }
}";

const AUTO_MERGE_MUTATION: &str = r"
mutation($id: ID!) {
  enablePullRequestAutoMerge(input: {pullRequestId: $id, mergeMethod: SQUASH}) {
    pullRequest { number }
  }
}";

/// Drives a single repository's PRs to the merged state.
pub struct Merger<'a> {
    client: &'a RepoClient,
    /// Whether the target branch is protected by a merge queue; when true,
    /// blocked PRs are enqueued through auto-merge instead of failing.
    merge_queue: bool,
    options: MergeOptions,
}

impl<'a> Merger<'a> {
    pub fn new(client: &'a RepoClient) -> Self {
        Self {
            client,
            merge_queue: false,
            options: MergeOptions::default(),
        }
    }

    pub fn with_merge_queue(mut self, merge_queue: bool) -> Self {
        self.merge_queue = merge_queue;
        self
    }

    pub fn with_options(mut self, options: MergeOptions) -> Self {
        self.options = options;
        self
    }

    /// Attempt to merge PR `number` once, returning the resulting state.
    pub async fn merge_pr(&self, number: u64) -> Result<MergeState, ForgeError> {
        let info = self.merge_info(number).await?;

        match info.state.as_str() {
            "MERGED" => return Ok(MergeState::Merged),
            "CLOSED" => return Ok(MergeState::Closed),
            _ => {}
        }
        if info.is_in_merge_queue {
            debug!(number, "PR already in merge queue");
            return Ok(MergeState::Enqueued);
        }

        match info.merge_state_status.as_str() {
            // Immediately mergeable; hooks and flaky checks do not block a
            // direct squash.
            "CLEAN" | "HAS_HOOKS" | "UNSTABLE" => {
                self.squash_merge(&info).await?;
                info!(number, "merged");
                Ok(MergeState::Merged)
            }
            status @ ("BLOCKED" | "BEHIND" | "DIRTY") => {
                if self.merge_queue {
                    self.enqueue(number, &info).await
                } else {
                    Ok(MergeState::Blocked(blocked_reason(status).to_string()))
                }
            }
            "DRAFT" => Ok(MergeState::Blocked("the pull request is a draft".to_string())),
            other => {
                debug!(number, status = other, "indeterminate merge state");
                Ok(MergeState::Unknown)
            }
        }
    }

    /// Poll [`Self::merge_pr`] every 10 s until the PR is merged or closed,
    /// or the timeout expires (then [`MergeState::Unknown`]).
    pub async fn merge_and_wait(
        &self,
        number: u64,
        timeout: Duration,
    ) -> Result<MergeState, ForgeError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let state = self.merge_pr(number).await?;
            if state.is_terminal() {
                return Ok(state);
            }
            if tokio::time::Instant::now() + MERGE_POLL_INTERVAL > deadline {
                warn!(number, error = %ForgeError::TimedOut(number), "giving up on merge");
                return Ok(MergeState::Unknown);
            }
            debug!(number, state = ?state, "waiting for merge");
            tokio::time::sleep(MERGE_POLL_INTERVAL).await;
        }
    }

    async fn merge_info(&self, number: u64) -> Result<MergeInfo, ForgeError> {
        let data = self
            .client
            .graphql(
                MERGE_INFO_QUERY,
                json!({
                    "owner": self.client.owner(),
                    "name": self.client.repo(),
                    "number": number,
                }),
            )
            .await?;
        let node = data
            .pointer("/repository/pullRequest")
            .cloned()
            .unwrap_or_default();
        if node.is_null() {
            return Err(ForgeError::Api {
                operation: format!("merge info for PR #{number}"),
                status: 404,
                message: "pull request not found".to_string(),
            });
        }
        serde_json::from_value(node).map_err(|e| ForgeError::Api {
            operation: format!("merge info for PR #{number}"),
            status: 200,
            message: e.to_string(),
        })
    }

    async fn squash_merge(&self, info: &MergeInfo) -> Result<(), ForgeError> {
        let expected = self
            .options
            .expected_head_oid
            .clone()
            .unwrap_or_else(|| info.head_ref_oid.clone());
        self.client
            .graphql(
                MERGE_MUTATION,
                json!({
                    "id": info.id,
                    "expectedHeadOid": expected,
                    "authorEmail": self.options.author_email,
                }),
            )
            .await?;
        Ok(())
    }

    /// Enable auto-merge so the merge queue picks the PR up. Enabling races
    /// with a just-cleaned status; the forge reports that with a "clean
    /// status" error, and the merger falls back to the direct path.
    async fn enqueue(&self, number: u64, info: &MergeInfo) -> Result<MergeState, ForgeError> {
        match self
            .client
            .graphql(AUTO_MERGE_MUTATION, json!({"id": info.id}))
            .await
        {
            Ok(_) => {
                info!(number, "auto-merge enabled");
                Ok(MergeState::Enqueued)
            }
            Err(ForgeError::Api { message, .. }) if message.contains("clean status") => {
                debug!(number, "auto-merge raced a clean status; merging directly");
                self.squash_merge(info).await?;
                Ok(MergeState::Merged)
            }
            Err(ForgeError::Api { message, .. })
                if message.contains("already enabled") || message.contains("merge queue") =>
            {
                Ok(MergeState::Enqueued)
            }
            Err(e) => Err(e),
        }
    }
}

fn blocked_reason(status: &str) -> &'static str {
    match status {
        "BEHIND" => "the head branch is not up to date with the base branch",
        "DIRTY" => "the head branch has conflicts with the base branch",
        _ => "the merge is blocked by branch protections",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_reasons() {
        assert_eq!(
            blocked_reason("BEHIND"),
            "the head branch is not up to date with the base branch"
        );
        assert_eq!(
            blocked_reason("DIRTY"),
            "the head branch has conflicts with the base branch"
        );
        assert_eq!(
            blocked_reason("BLOCKED"),
            "the merge is blocked by branch protections"
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(MergeState::Merged.is_terminal());
        assert!(MergeState::Closed.is_terminal());
        assert!(!MergeState::Enqueued.is_terminal());
        assert!(!MergeState::Blocked("x".to_string()).is_terminal());
        assert!(!MergeState::Unknown.is_terminal());
    }

    #[test]
    fn test_merge_info_decodes() {
        let info: MergeInfo = serde_json::from_value(serde_json::json!({
            "id": "PR_x",
            "state": "OPEN",
            "mergeStateStatus": "BEHIND",
            "isInMergeQueue": false,
            "headRefOid": "9fa5bc0",
        }))
        .unwrap();
        assert_eq!(info.merge_state_status, "BEHIND");
        assert!(!info.is_in_merge_queue);
    }
}
