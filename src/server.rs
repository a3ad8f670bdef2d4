//! # HTTP server
//!
//! Serves the webhook intake and operational endpoints:
//!
//! - `GET /healthz` - liveness, `200 {"status":"running"}`
//! - `GET /metrics` - Prometheus metrics in text format
//! - `POST /api/github/webhook` - HMAC-verified GitHub webhook intake; push
//!   events are decoded and dispatched to the in-place renderer
//! - anything else - `404`

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::api::RepoConfig;
use crate::controller::Manager;
use crate::github::TransportPool;
use crate::observability::metrics;
use crate::reconcilers::{RenderEvent, Renderer};

type HmacSha256 = Hmac<Sha256>;

pub struct ServerState {
    pub webhook_secret: Vec<u8>,
    pub pool: Arc<TransportPool>,
    pub manager: Arc<Manager<RenderEvent>>,
    pub base_dir: PathBuf,
    /// Repo configs eligible for webhook-triggered renders.
    pub configs: Vec<RepoConfig>,
}

pub async fn start_server(port: u16, state: Arc<ServerState>) -> anyhow::Result<()> {
    let app = router(state);
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("HTTP server listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/github/webhook", post(webhook_handler))
        .fallback(|| async { StatusCode::NOT_FOUND })
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz_handler() -> impl IntoResponse {
    Json(json!({"status": "running"}))
}

async fn metrics_handler() -> impl IntoResponse {
    match metrics::gather_text() {
        Ok(text) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            text,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Subset of the GitHub push event hydros consumes.
#[derive(Debug, Deserialize)]
struct PushEvent {
    /// `refs/heads/{branch}` for branch pushes.
    #[serde(rename = "ref")]
    git_ref: String,
    /// Commit the branch now points at.
    after: String,
    repository: PushRepository,
}

#[derive(Debug, Deserialize)]
struct PushRepository {
    name: String,
    owner: PushOwner,
}

#[derive(Debug, Deserialize)]
struct PushOwner {
    login: String,
}

async fn webhook_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let signature = headers
        .get("X-Hub-Signature-256")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !verify_signature(&state.webhook_secret, signature, &body) {
        warn!("webhook signature verification failed");
        return (StatusCode::FORBIDDEN, "bad signature").into_response();
    }

    let event = headers
        .get("X-GitHub-Event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if event != "push" {
        debug!(event, "ignoring webhook event");
        return (StatusCode::OK, "ignored").into_response();
    }

    let push: PushEvent = match serde_json::from_slice(&body) {
        Ok(push) => push,
        Err(e) => {
            warn!(error = %e, "push event did not decode");
            return (StatusCode::BAD_REQUEST, "bad payload").into_response();
        }
    };
    match dispatch_push(&state, &push).await {
        Ok(dispatched) => {
            let status = if dispatched { "dispatched" } else { "ignored" };
            (StatusCode::OK, status).into_response()
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "failed to dispatch push");
            (StatusCode::INTERNAL_SERVER_ERROR, "dispatch failed").into_response()
        }
    }
}

/// Route a push to the renderer for its repository, when the pushed branch
/// has an `inPlaceConfig`. Other pushes are acknowledged and dropped.
async fn dispatch_push(state: &Arc<ServerState>, push: &PushEvent) -> anyhow::Result<bool> {
    let Some(branch) = push.git_ref.strip_prefix("refs/heads/") else {
        debug!(git_ref = %push.git_ref, "not a branch push");
        return Ok(false);
    };
    let owner = &push.repository.owner.login;
    let repo = &push.repository.name;

    let Some(config) = state
        .configs
        .iter()
        .find(|c| c.spec.repo.org == *owner && c.spec.repo.repo == *repo)
    else {
        debug!(owner, repo, "no RepoConfig for repository");
        return Ok(false);
    };
    let Some(branch_config) = config.config_for_branch(branch) else {
        debug!(owner, repo, branch, "branch has no inPlaceConfig");
        return Ok(false);
    };

    let renderer = Arc::new(Renderer::new(
        Arc::clone(&state.pool),
        &state.base_dir,
        config.clone(),
    ));
    let name = crate::controller::manager::NamedReconciler::name(renderer.as_ref());
    if !state.manager.has_reconciler(&name).await {
        // Racing webhooks may both try to add; the duplicate is benign.
        match state.manager.add_reconciler(renderer).await {
            Ok(()) | Err(crate::controller::ControllerError::DuplicateReconciler(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }
    info!(owner, repo, branch, commit = %push.after, "render enqueued");
    state
        .manager
        .enqueue(
            &name,
            Some(RenderEvent {
                commit: push.after.clone(),
                branch_config: branch_config.clone(),
            }),
        )
        .await?;
    Ok(true)
}

/// Constant-time verification of `X-Hub-Signature-256: sha256=<hex>`.
fn verify_signature(secret: &[u8], signature: &str, body: &[u8]) -> bool {
    let Some(hex_digest) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &[u8], body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_valid_signature_accepted() {
        let secret = b"s3cret";
        let body = br#"{"ref":"refs/heads/main"}"#;
        let signature = sign(secret, body);
        assert!(verify_signature(secret, &signature, body));
    }

    #[test]
    fn test_tampered_body_rejected() {
        let secret = b"s3cret";
        let signature = sign(secret, b"original");
        assert!(!verify_signature(secret, &signature, b"tampered"));
        assert!(!verify_signature(secret, "sha256=zz", b"original"));
        assert!(!verify_signature(secret, "", b"original"));
    }

    #[test]
    fn test_push_event_decodes() {
        let push: PushEvent = serde_json::from_value(serde_json::json!({
            "ref": "refs/heads/jlewi/cicd",
            "after": "9fa5bc0",
            "repository": {"name": "hydros", "owner": {"login": "jlewi"}},
        }))
        .unwrap();
        assert_eq!(push.git_ref, "refs/heads/jlewi/cicd");
        assert_eq!(push.repository.owner.login, "jlewi");
    }
}
