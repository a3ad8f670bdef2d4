//! # Secret/URI resolver
//!
//! Reads bytes from a URI. Recognized schemes:
//!
//! - empty and `file:` - local filesystem read
//! - `gcpsecretmanager://projects/{P}/secrets/{S}/versions/{V}` - GCP Secret
//!   Manager REST API v1 `:access`
//!
//! Readers are stream-valued; callers consume to EOF. The resolver does not
//! cache; callers that need caching wrap it.

use std::io::Cursor;
use std::pin::Pin;

use anyhow::Context;
use base64::{engine::general_purpose, Engine as _};
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("unsupported URI scheme in {0:?}")]
    UnsupportedScheme(String),

    #[error("malformed secret URI {0:?}: {1}")]
    MalformedUri(String, String),

    #[error("failed to read {uri}: {source}")]
    ReadFailed {
        uri: String,
        #[source]
        source: anyhow::Error,
    },
}

type Reader = Pin<Box<dyn AsyncRead + Send>>;

/// Open a reader for the given URI.
pub async fn open(uri: &str) -> Result<Reader, SecretError> {
    match scheme_of(uri) {
        "" | "file" => {
            let path = uri.strip_prefix("file://").unwrap_or(uri);
            let file = tokio::fs::File::open(path)
                .await
                .map_err(|e| SecretError::ReadFailed {
                    uri: uri.to_string(),
                    source: e.into(),
                })?;
            Ok(Box::pin(file))
        }
        "gcpsecretmanager" => {
            let bytes = access_gcp_secret(uri).await?;
            Ok(Box::pin(Cursor::new(bytes)))
        }
        _ => Err(SecretError::UnsupportedScheme(uri.to_string())),
    }
}

/// Read the entire contents behind the URI.
pub async fn read(uri: &str) -> Result<Vec<u8>, SecretError> {
    let mut reader = open(uri).await?;
    let mut buf = Vec::new();
    reader
        .read_to_end(&mut buf)
        .await
        .map_err(|e| SecretError::ReadFailed {
            uri: uri.to_string(),
            source: e.into(),
        })?;
    Ok(buf)
}

fn scheme_of(uri: &str) -> &str {
    match uri.split_once("://") {
        Some((scheme, _)) => scheme,
        None => "",
    }
}

/// Resource path of a GCP Secret Manager version,
/// `projects/{P}/secrets/{S}/versions/{V}`.
fn gcp_resource_path(uri: &str) -> Result<String, SecretError> {
    let path = uri
        .strip_prefix("gcpsecretmanager://")
        .ok_or_else(|| SecretError::MalformedUri(uri.to_string(), "bad scheme".to_string()))?;
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() != 6 || parts[0] != "projects" || parts[2] != "secrets" || parts[4] != "versions"
    {
        return Err(SecretError::MalformedUri(
            uri.to_string(),
            "expected projects/{P}/secrets/{S}/versions/{V}".to_string(),
        ));
    }
    Ok(path.to_string())
}

#[derive(Debug, Deserialize)]
struct AccessSecretVersionResponse {
    payload: SecretPayload,
}

#[derive(Debug, Deserialize)]
struct SecretPayload {
    /// Base64-encoded secret data.
    data: String,
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
}

/// Bearer token for the Secret Manager API: `GOOGLE_OAUTH_ACCESS_TOKEN` when
/// set, otherwise the GCE metadata server.
async fn gcp_access_token() -> anyhow::Result<String> {
    if let Ok(token) = std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN") {
        if !token.is_empty() {
            return Ok(token);
        }
    }
    let resp = reqwest::Client::new()
        .get("http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token")
        .header("Metadata-Flavor", "Google")
        .send()
        .await
        .context("failed to reach the GCE metadata server")?
        .error_for_status()
        .context("metadata server rejected the token request")?;
    let token: MetadataToken = resp
        .json()
        .await
        .context("failed to decode metadata token response")?;
    Ok(token.access_token)
}

async fn access_gcp_secret(uri: &str) -> Result<Vec<u8>, SecretError> {
    let resource = gcp_resource_path(uri)?;
    let read_failed = |source: anyhow::Error| SecretError::ReadFailed {
        uri: uri.to_string(),
        source,
    };

    let token = gcp_access_token().await.map_err(read_failed)?;
    let base = std::env::var("GCP_SECRETMANAGER_BASE_URL")
        .unwrap_or_else(|_| "https://secretmanager.googleapis.com".to_string());
    let url = format!("{base}/v1/{resource}:access");
    debug!(uri, "accessing GCP secret version");

    let resp = reqwest::Client::new()
        .get(&url)
        .bearer_auth(token)
        .send()
        .await
        .map_err(|e| read_failed(e.into()))?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(read_failed(anyhow::anyhow!(
            "secretmanager returned {status}: {body}"
        )));
    }
    let access: AccessSecretVersionResponse =
        resp.json().await.map_err(|e| read_failed(e.into()))?;
    general_purpose::STANDARD
        .decode(access.payload.data.as_bytes())
        .map_err(|e| read_failed(anyhow::anyhow!("payload is not valid base64: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_read_local_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hunter2").unwrap();

        let bare = read(file.path().to_str().unwrap()).await.unwrap();
        assert_eq!(bare, b"hunter2");

        let with_scheme = read(&format!("file://{}", file.path().display()))
            .await
            .unwrap();
        assert_eq!(with_scheme, b"hunter2");
    }

    #[tokio::test]
    async fn test_unknown_scheme_fails() {
        let err = read("vault://secret/thing").await.unwrap_err();
        assert!(matches!(err, SecretError::UnsupportedScheme(_)));
    }

    #[test]
    fn test_gcp_resource_path() {
        let path =
            gcp_resource_path("gcpsecretmanager://projects/p/secrets/s/versions/latest").unwrap();
        assert_eq!(path, "projects/p/secrets/s/versions/latest");

        assert!(gcp_resource_path("gcpsecretmanager://projects/p/secrets/s").is_err());
        assert!(gcp_resource_path("gcpsecretmanager://foo/p/bar/s/versions/1").is_err());
    }
}
