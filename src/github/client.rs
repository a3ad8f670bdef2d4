//! Typed GitHub REST and GraphQL client bound to one repository's transport.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::transport::Transport;
use super::{api_base_url, ForgeError};

/// Merge mutations only expose `mergeStateStatus` behind this preview media
/// type; the client injects it on every GraphQL call.
const MERGE_INFO_PREVIEW: &str = "application/vnd.github.merge-info-preview+json";

/// A pull request as hydros sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub number: u64,
    /// GraphQL node id, needed by merge mutations.
    pub node_id: String,
    pub url: String,
    pub state: String,
    pub head_ref: String,
    /// `owner:branch`; for cross-repository PRs the owner is the fork owner.
    pub head_label: String,
    pub base_ref: String,
}

#[derive(Debug, Deserialize)]
struct RestPull {
    number: u64,
    node_id: String,
    html_url: String,
    state: String,
    head: RestRef,
    base: RestRef,
}

#[derive(Debug, Deserialize)]
struct RestRef {
    #[serde(rename = "ref")]
    ref_name: String,
    #[serde(default)]
    label: String,
}

impl From<RestPull> for PullRequest {
    fn from(p: RestPull) -> Self {
        Self {
            number: p.number,
            node_id: p.node_id,
            url: p.html_url,
            state: p.state,
            head_ref: p.head.ref_name,
            head_label: p.head.label,
            base_ref: p.base.ref_name,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RepoInfo {
    pub default_branch: String,
}

#[derive(Debug, Deserialize)]
pub struct Release {
    pub tag_name: String,
}

/// Check-run conclusions hydros reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckConclusion {
    Success,
    Skipped,
    Failure,
    Neutral,
}

/// REST + GraphQL operations against one repository.
pub struct RepoClient {
    transport: Arc<Transport>,
    http: reqwest::Client,
    base_url: String,
}

impl RepoClient {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self {
            transport,
            http: reqwest::Client::new(),
            base_url: api_base_url(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.transport.owner
    }

    pub fn repo(&self) -> &str {
        &self.transport.repo
    }

    fn repo_url(&self, tail: &str) -> String {
        format!(
            "{}/repos/{}/{}{tail}",
            self.base_url, self.transport.owner, self.transport.repo
        )
    }

    async fn request(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response, ForgeError> {
        let token = self.transport.token().await?;
        let mut req = self
            .http
            .request(method, url)
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "hydros");
        if let Some(body) = body {
            req = req.json(&body);
        }
        Ok(req.send().await?)
    }

    async fn expect_success(
        resp: reqwest::Response,
        operation: &str,
    ) -> Result<reqwest::Response, ForgeError> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let message = resp.text().await.unwrap_or_default();
        Err(ForgeError::Api {
            operation: operation.to_string(),
            status,
            message,
        })
    }

    pub async fn repo_info(&self) -> Result<RepoInfo, ForgeError> {
        let resp = self
            .request(reqwest::Method::GET, &self.repo_url(""), None)
            .await?;
        Ok(Self::expect_success(resp, "get repository")
            .await?
            .json()
            .await?)
    }

    /// Open a PR from `head` into `base`. The message's first line becomes
    /// the title and the remainder the body. If the forge reports that a PR
    /// already exists for this head, the existing PR is fetched and returned.
    pub async fn create_pull(
        &self,
        message: &str,
        head: &str,
        base: &str,
    ) -> Result<PullRequest, ForgeError> {
        let (title, body) = split_message(message);
        let resp = self
            .request(
                reqwest::Method::POST,
                &self.repo_url("/pulls"),
                Some(json!({
                    "title": title,
                    "body": body,
                    "head": head,
                    "base": base,
                })),
            )
            .await?;

        if resp.status() == 422 {
            let message = resp.text().await.unwrap_or_default();
            if message.contains("already exists") {
                debug!(head, base, "PR already exists; fetching it");
                if let Some(existing) = self.pull_for_head(head, base).await? {
                    return Ok(existing);
                }
            }
            return Err(ForgeError::Api {
                operation: format!("create PR {head} -> {base}"),
                status: 422,
                message,
            });
        }

        let pull: RestPull =
            Self::expect_success(resp, &format!("create PR {head} -> {base}"))
                .await?
                .json()
                .await?;
        Ok(pull.into())
    }

    /// Open PR whose head matches `head` and whose base branch matches
    /// `base`. A qualified `owner:branch` head is matched against the
    /// forge's head label (the form cross-repository PRs report); a bare
    /// branch is matched against the head ref.
    pub async fn pull_for_head(
        &self,
        head: &str,
        base: &str,
    ) -> Result<Option<PullRequest>, ForgeError> {
        let url = format!("{}?state=open&head={head}", self.repo_url("/pulls"));
        let resp = self.request(reqwest::Method::GET, &url, None).await?;
        let pulls: Vec<RestPull> = Self::expect_success(resp, "list open PRs")
            .await?
            .json()
            .await?;
        let qualified = head.contains(':');
        Ok(pulls
            .into_iter()
            .map(PullRequest::from)
            .find(|p| {
                let head_matches = if qualified {
                    p.head_label == head
                } else {
                    p.head_ref == head
                };
                head_matches && p.base_ref == base
            }))
    }

    pub async fn get_pull(&self, number: u64) -> Result<PullRequest, ForgeError> {
        let resp = self
            .request(
                reqwest::Method::GET,
                &self.repo_url(&format!("/pulls/{number}")),
                None,
            )
            .await?;
        let pull: RestPull = Self::expect_success(resp, &format!("get PR #{number}"))
            .await?
            .json()
            .await?;
        Ok(pull.into())
    }

    /// Apply labels to a PR. Labels that do not exist in the repository are
    /// logged and skipped, never fatal.
    pub async fn add_labels(&self, number: u64, labels: &[String]) -> Result<(), ForgeError> {
        let mut existing = Vec::new();
        for label in labels {
            let resp = self
                .request(
                    reqwest::Method::GET,
                    &self.repo_url(&format!("/labels/{label}")),
                    None,
                )
                .await?;
            if resp.status().is_success() {
                existing.push(label.clone());
            } else {
                warn!(label, "label not defined in repository; skipping");
            }
        }
        if existing.is_empty() {
            return Ok(());
        }
        let resp = self
            .request(
                reqwest::Method::POST,
                &self.repo_url(&format!("/issues/{number}/labels")),
                Some(json!({ "labels": existing })),
            )
            .await?;
        Self::expect_success(resp, &format!("label PR #{number}")).await?;
        Ok(())
    }

    pub async fn list_releases(&self) -> Result<Vec<Release>, ForgeError> {
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("{}?per_page=100", self.repo_url("/releases")),
                None,
            )
            .await?;
        Ok(Self::expect_success(resp, "list releases")
            .await?
            .json()
            .await?)
    }

    /// Cut a release with generated notes, tagging `target_commitish`.
    pub async fn create_release(
        &self,
        tag: &str,
        target_commitish: &str,
    ) -> Result<(), ForgeError> {
        let resp = self
            .request(
                reqwest::Method::POST,
                &self.repo_url("/releases"),
                Some(json!({
                    "tag_name": tag,
                    "target_commitish": target_commitish,
                    "name": tag,
                    "generate_release_notes": true,
                })),
            )
            .await?;
        Self::expect_success(resp, &format!("create release {tag}")).await?;
        Ok(())
    }

    /// Report a check run for a commit; the user-visible outcome of a render.
    pub async fn create_check_run(
        &self,
        name: &str,
        head_sha: &str,
        conclusion: CheckConclusion,
        summary: &str,
    ) -> Result<(), ForgeError> {
        let resp = self
            .request(
                reqwest::Method::POST,
                &self.repo_url("/check-runs"),
                Some(json!({
                    "name": name,
                    "head_sha": head_sha,
                    "status": "completed",
                    "conclusion": conclusion,
                    "output": {"title": name, "summary": summary},
                })),
            )
            .await?;
        Self::expect_success(resp, &format!("create check run {name}")).await?;
        Ok(())
    }

    /// Execute a GraphQL query or mutation, returning the `data` payload.
    /// GraphQL errors are surfaced as [`ForgeError::Api`] with the first
    /// error's message.
    pub async fn graphql(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<serde_json::Value, ForgeError> {
        #[derive(Debug, Deserialize)]
        struct GraphQlResponse {
            #[serde(default)]
            data: serde_json::Value,
            #[serde(default)]
            errors: Vec<GraphQlError>,
        }

        #[derive(Debug, Deserialize)]
        struct GraphQlError {
            message: String,
        }

        let token = self.transport.token().await?;
        let url = format!("{}/graphql", self.base_url);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(token)
            .header("Accept", MERGE_INFO_PREVIEW)
            .header("User-Agent", "hydros")
            .json(&json!({"query": query, "variables": variables}))
            .send()
            .await?;
        let resp = Self::expect_success(resp, "graphql").await?;
        let parsed: GraphQlResponse = resp.json().await?;
        if let Some(err) = parsed.errors.first() {
            return Err(ForgeError::Api {
                operation: "graphql".to_string(),
                status: 200,
                message: err.message.clone(),
            });
        }
        Ok(parsed.data)
    }
}

/// Split a commit-style message into a PR title (first line) and body.
pub(crate) fn split_message(message: &str) -> (String, String) {
    match message.split_once('\n') {
        Some((title, body)) => (title.trim().to_string(), body.trim().to_string()),
        None => (message.trim().to_string(), String::new()),
    }
}
