//! Idempotent cloning of repositories into a shared working directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};
use url::Url;

use super::{rev_parse, run_git, GitError};
use crate::github::transport::TransportPool;

/// Default branch checked out when a URI names neither `ref` nor `sha`.
pub const DEFAULT_BRANCH: &str = "main";

/// A parsed clone URI of the form
/// `https://{host}/{owner}/{repo}.git?ref={branch}&sha={commit}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSpec {
    pub host: String,
    pub owner: String,
    pub repo: String,
    pub branch: String,
    pub sha: String,
}

impl RepoSpec {
    /// Parse a clone URI. `sha` wins over `ref` when both are present.
    pub fn parse(uri: &str) -> Result<Self, GitError> {
        let url = Url::parse(uri).map_err(|e| GitError::CloneFailed {
            url: uri.to_string(),
            stderr: e.to_string(),
        })?;
        let host = url.host_str().unwrap_or_default().to_string();
        let mut segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|p| !p.is_empty()).collect())
            .unwrap_or_default();
        if host.is_empty() || segments.len() != 2 {
            return Err(GitError::CloneFailed {
                url: uri.to_string(),
                stderr: "expected https://{host}/{owner}/{repo}.git".to_string(),
            });
        }
        let repo = segments
            .pop()
            .unwrap_or_default()
            .trim_end_matches(".git")
            .to_string();
        let owner = segments.pop().unwrap_or_default().to_string();

        let mut branch = String::new();
        let mut sha = String::new();
        for (k, v) in url.query_pairs() {
            match k.as_ref() {
                "ref" => branch = v.into_owned(),
                "sha" => sha = v.into_owned(),
                other => debug!(uri, param = other, "ignoring unknown clone URI parameter"),
            }
        }
        if !sha.is_empty() && !branch.is_empty() {
            warn!(uri, %branch, %sha, "both ref and sha given; sha wins, ref ignored");
            branch.clear();
        }
        if sha.is_empty() && branch.is_empty() {
            branch = DEFAULT_BRANCH.to_string();
        }
        Ok(Self {
            host,
            owner,
            repo,
            branch,
            sha,
        })
    }

    /// Anonymous HTTPS clone URL, query stripped.
    pub fn clone_url(&self) -> String {
        format!("https://{}/{}/{}.git", self.host, self.owner, self.repo)
    }

    /// Working directory of this repository under `base`.
    pub fn work_dir(&self, base: &Path) -> PathBuf {
        base.join(&self.host).join(&self.owner).join(&self.repo)
    }
}

/// Clones or refreshes a set of repositories under a base directory.
///
/// [`Cloner::run`] is idempotent: repeated calls with the same URI yield the
/// same checkout regardless of prior working-tree state. A dirty working
/// tree is discarded by the forced checkout.
pub struct Cloner {
    base_dir: PathBuf,
    transports: Option<Arc<TransportPool>>,
}

impl Cloner {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            transports: None,
        }
    }

    /// Authenticate clones and fetches of github.com repositories through the
    /// transport pool.
    pub fn with_transports(mut self, transports: Arc<TransportPool>) -> Self {
        self.transports = Some(transports);
        self
    }

    /// Clone (or refresh) every repository named by `uris` and check out the
    /// requested revision.
    pub async fn run<S: AsRef<str>>(&self, uris: &[S]) -> Result<Vec<PathBuf>, GitError> {
        let mut dirs = Vec::with_capacity(uris.len());
        for uri in uris {
            let spec = RepoSpec::parse(uri.as_ref())?;
            dirs.push(self.ensure(&spec).await?);
        }
        Ok(dirs)
    }

    /// Ensure a single repository is present and checked out per its spec.
    /// Returns its working directory.
    pub async fn ensure(&self, spec: &RepoSpec) -> Result<PathBuf, GitError> {
        let work_dir = spec.work_dir(&self.base_dir);
        let auth = self.auth_args(spec).await;

        if work_dir.join(".git").exists() {
            debug!(dir = %work_dir.display(), "repository already cloned");
        } else {
            self.clone(spec, &work_dir, &auth).await?;
        }

        // "Already up to date" exits zero, so it is success by construction.
        let mut fetch: Vec<String> = auth.clone();
        fetch.extend(["fetch".to_string(), "origin".to_string()]);
        run_ok_or(&work_dir, &fetch, |stderr| GitError::FetchFailed {
            dir: work_dir.display().to_string(),
            stderr,
        })
        .await?;

        let rev = if spec.sha.is_empty() {
            format!("origin/{}", spec.branch)
        } else {
            spec.sha.clone()
        };
        if rev_parse(&work_dir, &rev).await?.is_none() {
            return Err(GitError::RefNotFound {
                rev,
                dir: work_dir.display().to_string(),
            });
        }
        // Forced, detached checkout: prior working-tree state is discarded.
        let checkout = ["checkout", "--force", "--detach", rev.as_str()];
        run_ok_or(&work_dir, &checkout, |stderr| GitError::CheckoutFailed {
            rev: rev.clone(),
            dir: work_dir.display().to_string(),
            stderr,
        })
        .await?;

        info!(repo = %spec.clone_url(), %rev, dir = %work_dir.display(), "checked out");
        Ok(work_dir)
    }

    async fn clone(
        &self,
        spec: &RepoSpec,
        work_dir: &Path,
        auth: &[String],
    ) -> Result<(), GitError> {
        if let Some(parent) = work_dir.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(GitError::Spawn)?;
        }
        let url = spec.clone_url();
        info!(repo = %url, dir = %work_dir.display(), "cloning");
        let mut args: Vec<String> = auth.to_vec();
        args.extend([
            "clone".to_string(),
            url.clone(),
            work_dir.display().to_string(),
        ]);
        let output = run_git::<String>(None, &args).await?;
        if !output.status.success() {
            return Err(GitError::CloneFailed {
                url,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// `-c http.<url>.extraheader=...` arguments carrying an installation
    /// token, when the pool can mint one for this repository.
    async fn auth_args(&self, spec: &RepoSpec) -> Vec<String> {
        let Some(pool) = &self.transports else {
            return Vec::new();
        };
        if spec.host != "github.com" {
            return Vec::new();
        }
        match pool.get(&spec.owner, &spec.repo).await {
            Ok(transport) => match transport.token().await {
                Ok(token) => auth_header_args(&spec.host, &token),
                Err(e) => {
                    warn!(repo = %spec.clone_url(), error = %e, "token mint failed; cloning anonymously");
                    Vec::new()
                }
            },
            Err(e) => {
                warn!(repo = %spec.clone_url(), error = %e, "no transport; cloning anonymously");
                Vec::new()
            }
        }
    }
}

/// Basic-auth extraheader for git-over-HTTP with an installation token.
pub(crate) fn auth_header_args(host: &str, token: &str) -> Vec<String> {
    use base64::{engine::general_purpose, Engine as _};
    let basic = general_purpose::STANDARD.encode(format!("x-access-token:{token}"));
    vec![
        "-c".to_string(),
        format!("http.https://{host}/.extraheader=AUTHORIZATION: basic {basic}"),
    ]
}

async fn run_ok_or<S: AsRef<str>>(
    dir: &Path,
    args: &[S],
    err: impl FnOnce(String) -> GitError,
) -> Result<(), GitError> {
    let output = run_git(Some(dir), args).await?;
    if !output.status.success() {
        return Err(err(
            String::from_utf8_lossy(&output.stderr).trim().to_string()
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ref_uri() {
        let spec =
            RepoSpec::parse("https://github.com/jlewi/hydros-hydrated.git?ref=jlewi/cicd").unwrap();
        assert_eq!(spec.host, "github.com");
        assert_eq!(spec.owner, "jlewi");
        assert_eq!(spec.repo, "hydros-hydrated");
        assert_eq!(spec.branch, "jlewi/cicd");
        assert!(spec.sha.is_empty());
        assert_eq!(
            spec.clone_url(),
            "https://github.com/jlewi/hydros-hydrated.git"
        );
    }

    #[test]
    fn test_parse_sha_uri_without_git_suffix() {
        let spec = RepoSpec::parse("https://github.com/jlewi/hydros-hydrated?sha=9fa5bc0").unwrap();
        assert_eq!(spec.repo, "hydros-hydrated");
        assert_eq!(spec.sha, "9fa5bc0");
        assert!(spec.branch.is_empty());
    }

    #[test]
    fn test_sha_wins_over_ref() {
        let spec =
            RepoSpec::parse("https://github.com/a/b.git?ref=feature&sha=abc123").unwrap();
        assert_eq!(spec.sha, "abc123");
        assert!(spec.branch.is_empty());
    }

    #[test]
    fn test_default_branch() {
        let spec = RepoSpec::parse("https://github.com/a/b.git").unwrap();
        assert_eq!(spec.branch, DEFAULT_BRANCH);
    }

    #[test]
    fn test_work_dir_layout() {
        let spec = RepoSpec::parse("https://github.com/jlewi/hydros.git").unwrap();
        assert_eq!(
            spec.work_dir(Path::new("/tmp/x")),
            PathBuf::from("/tmp/x/github.com/jlewi/hydros")
        );
    }

    #[test]
    fn test_malformed_uri_rejected() {
        assert!(RepoSpec::parse("https://github.com/onlyowner").is_err());
        assert!(RepoSpec::parse("not a url").is_err());
    }
}
