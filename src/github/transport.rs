//! # Transport pool
//!
//! Produces per-`(owner, repo)` authenticated transports from a single GitHub
//! App credential. For a fresh pair the pool resolves the repository's
//! installation id with an app JWT, then hands out a [`Transport`] that mints
//! installation tokens and re-mints them ahead of expiry. Entries are cached
//! indefinitely and are read-only after construction.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use super::{api_base_url, ForgeError};

/// Installation tokens live an hour; re-mint this far ahead of expiry so a
/// token handed to a long git push cannot lapse mid-flight.
const REFRESH_MARGIN_SECS: i64 = 300;

/// App JWTs are short-lived by protocol; ten minutes is the GitHub maximum.
const APP_JWT_LIFETIME_SECS: i64 = 540;

#[derive(Debug, Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

struct Shared {
    app_id: u64,
    key: EncodingKey,
    http: reqwest::Client,
    base_url: String,
}

impl Shared {
    /// RS256 JWT authenticating as the app itself, used only to look up
    /// installations and mint installation tokens.
    fn app_jwt(&self) -> Result<String, ForgeError> {
        let now = Utc::now();
        let claims = AppClaims {
            // Backdated to absorb clock skew between us and the forge.
            iat: (now - Duration::seconds(60)).timestamp(),
            exp: (now + Duration::seconds(APP_JWT_LIFETIME_SECS)).timestamp(),
            iss: self.app_id.to_string(),
        };
        encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .map_err(|e| ForgeError::AuthFailed(format!("failed to sign app JWT: {e}")))
    }
}

/// Pool of per-repository transports.
pub struct TransportPool {
    shared: Arc<Shared>,
    entries: Mutex<HashMap<(String, String), Arc<Transport>>>,
}

impl TransportPool {
    /// Build a pool from a GitHub App id and its RSA private key in PEM form.
    pub fn new(app_id: u64, private_key_pem: &[u8]) -> Result<Self, ForgeError> {
        let key = EncodingKey::from_rsa_pem(private_key_pem)
            .map_err(|e| ForgeError::InvalidKey(e.to_string()))?;
        Ok(Self {
            shared: Arc::new(Shared {
                app_id,
                key,
                http: reqwest::Client::new(),
                base_url: api_base_url(),
            }),
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Return the transport for `(owner, repo)`, constructing and caching it
    /// on first sight.
    pub async fn get(&self, owner: &str, repo: &str) -> Result<Arc<Transport>, ForgeError> {
        let key = (owner.to_string(), repo.to_string());
        let mut entries = self.entries.lock().await;
        if let Some(transport) = entries.get(&key) {
            return Ok(Arc::clone(transport));
        }

        let installation_id = self.lookup_installation(owner, repo).await?;
        let transport = Arc::new(Transport {
            owner: owner.to_string(),
            repo: repo.to_string(),
            installation_id,
            shared: Arc::clone(&self.shared),
            token: Mutex::new(None),
        });
        entries.insert(key, Arc::clone(&transport));
        Ok(transport)
    }

    async fn lookup_installation(&self, owner: &str, repo: &str) -> Result<u64, ForgeError> {
        #[derive(Debug, Deserialize)]
        struct Installation {
            id: u64,
        }

        let jwt = self.shared.app_jwt()?;
        let url = format!("{}/repos/{owner}/{repo}/installation", self.shared.base_url);
        let resp = self
            .shared
            .http
            .get(&url)
            .bearer_auth(jwt)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "hydros")
            .send()
            .await?;
        match resp.status().as_u16() {
            200 => {
                let installation: Installation = resp.json().await?;
                debug!(owner, repo, id = installation.id, "resolved installation");
                Ok(installation.id)
            }
            404 => Err(ForgeError::InstallationNotFound {
                owner: owner.to_string(),
                repo: repo.to_string(),
            }),
            401 | 403 => Err(ForgeError::AuthFailed(format!(
                "installation lookup for {owner}/{repo} was rejected"
            ))),
            status => Err(ForgeError::Api {
                operation: format!("installation lookup for {owner}/{repo}"),
                status,
                message: resp.text().await.unwrap_or_default(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Authenticated session bound to one `(owner, repo)`.
pub struct Transport {
    pub owner: String,
    pub repo: String,
    installation_id: u64,
    shared: Arc<Shared>,
    token: Mutex<Option<CachedToken>>,
}

impl Transport {
    /// A bearer token valid for this repository. Tokens carry expiry; the
    /// transport re-mints on its own clock rather than per request.
    pub async fn token(&self) -> Result<String, ForgeError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at - Utc::now() > Duration::seconds(REFRESH_MARGIN_SECS) {
                return Ok(token.token.clone());
            }
        }
        let fresh = self.mint().await?;
        let token = fresh.token.clone();
        *cached = Some(fresh);
        Ok(token)
    }

    async fn mint(&self) -> Result<CachedToken, ForgeError> {
        #[derive(Debug, Deserialize)]
        struct AccessToken {
            token: String,
            expires_at: DateTime<Utc>,
        }

        let jwt = self.shared.app_jwt()?;
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.shared.base_url, self.installation_id
        );
        let resp = self
            .shared
            .http
            .post(&url)
            .bearer_auth(jwt)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "hydros")
            .send()
            .await?;
        if resp.status() == 401 || resp.status() == 403 {
            return Err(ForgeError::AuthFailed(format!(
                "token mint for {}/{} was rejected",
                self.owner, self.repo
            )));
        }
        if !resp.status().is_success() {
            return Err(ForgeError::Api {
                operation: format!("token mint for {}/{}", self.owner, self.repo),
                status: resp.status().as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }
        let minted: AccessToken = resp.json().await?;
        debug!(owner = %self.owner, repo = %self.repo, expires_at = %minted.expires_at, "minted installation token");
        Ok(CachedToken {
            token: minted.token,
            expires_at: minted.expires_at,
        })
    }
}
