//! # Image replicator
//!
//! Copies a container image from a source registry to one or more
//! destination registries: resolve the source `latest` tag to a digest,
//! capture every tag that points at that digest, then push the image and
//! apply each captured tag at every destination. The tag set is captured
//! once at the start of a reconcile; tags added concurrently wait for the
//! next cycle, keeping each run deterministic.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use oci_client::client::{linux_amd64_resolver, ClientConfig, ImageData};
use oci_client::manifest;
use oci_client::secrets::RegistryAuth;
use oci_client::{Client, Reference};
use tracing::{debug, info, warn};

use crate::api::image::REPLICATED_IMAGE_KIND;
use crate::api::{GroupVersionKind, RawResource, ReplicatedImage};
use crate::controller::Reconciler;
use crate::github::TransportPool;
use crate::observability::metrics;

/// Layer media types accepted when pulling regular container images.
const IMAGE_MEDIA_TYPES: &[&str] = &[
    manifest::IMAGE_LAYER_MEDIA_TYPE,
    manifest::IMAGE_LAYER_GZIP_MEDIA_TYPE,
    manifest::IMAGE_DOCKER_LAYER_TAR_MEDIA_TYPE,
    manifest::IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE,
];

/// Registry auth: GitHub installation tokens for `ghcr.io` when a transport
/// pool is configured, anonymous otherwise.
pub(crate) struct RegistryKeychain {
    pool: Option<Arc<TransportPool>>,
}

impl RegistryKeychain {
    pub(crate) fn new(pool: Option<Arc<TransportPool>>) -> Self {
        Self { pool }
    }

    pub(crate) async fn auth_for(&self, reference: &Reference) -> RegistryAuth {
        if reference.registry() != "ghcr.io" {
            return RegistryAuth::Anonymous;
        }
        let Some(pool) = &self.pool else {
            return RegistryAuth::Anonymous;
        };
        let mut parts = reference.repository().splitn(2, '/');
        let (Some(owner), Some(repo)) = (parts.next(), parts.next()) else {
            return RegistryAuth::Anonymous;
        };
        // Package repositories are keyed like source repositories on GHCR.
        match pool.get(owner, repo).await {
            Ok(transport) => match transport.token().await {
                Ok(token) => RegistryAuth::Basic("x-access-token".to_string(), token),
                Err(e) => {
                    warn!(registry = reference.registry(), error = %e, "token mint failed; anonymous");
                    RegistryAuth::Anonymous
                }
            },
            Err(e) => {
                debug!(registry = reference.registry(), error = %e, "no installation; anonymous");
                RegistryAuth::Anonymous
            }
        }
    }
}

/// Reconciles `ReplicatedImage` resources.
pub struct ReplicatedImageReconciler {
    client: Client,
    keychain: RegistryKeychain,
}

impl ReplicatedImageReconciler {
    pub fn new(pool: Option<Arc<TransportPool>>) -> Self {
        let config = ClientConfig {
            // Multi-arch sources are resolved to the platform hydros runs
            // its workloads on.
            platform_resolver: Some(Box::new(linux_amd64_resolver)),
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            keychain: RegistryKeychain::new(pool),
        }
    }

    /// Resolve `latest`, capture the matching tag set, and copy to every
    /// destination. Per-tag errors accumulate; the reconcile succeeds only
    /// when every destination received the image and every tag was applied.
    pub async fn replicate(&self, resource: &ReplicatedImage) -> anyhow::Result<()> {
        resource.validate()?;
        let source = &resource.spec.source.repository;
        let latest: Reference = Reference::try_from(format!("{source}:latest"))
            .with_context(|| format!("invalid source repository {source:?}"))?;
        let source_auth = self.keychain.auth_for(&latest).await;

        let digest = self
            .client
            .fetch_manifest_digest(&latest, &source_auth)
            .await
            .with_context(|| format!("failed to resolve {source}:latest"))?;
        let tags = self.matching_tags(&latest, &source_auth, &digest).await?;
        info!(%source, %digest, ?tags, "captured tag set");

        let image = self
            .client
            .pull(&latest, &source_auth, IMAGE_MEDIA_TYPES.to_vec())
            .await
            .with_context(|| format!("failed to pull {source}:latest"))?;

        let mut errors: Vec<String> = Vec::new();
        for destination in &resource.spec.destinations {
            if let Err(e) = self.push_all_tags(destination, &image, &tags).await {
                errors.push(format!("{destination}: {e:#}"));
            } else {
                metrics::images_replicated_inc();
            }
        }
        if !errors.is_empty() {
            anyhow::bail!(
                "replication of {source} failed for {} destination(s):\n  {}",
                errors.len(),
                errors.join("\n  ")
            );
        }
        Ok(())
    }

    /// Every tag on the source whose manifest digest equals `digest`,
    /// captured once.
    async fn matching_tags(
        &self,
        latest: &Reference,
        auth: &RegistryAuth,
        digest: &str,
    ) -> anyhow::Result<Vec<String>> {
        let listed = self
            .client
            .list_tags(latest, auth, None, None)
            .await
            .context("failed to list source tags")?;
        let mut tags = Vec::new();
        for tag in listed.tags {
            let reference = Reference::with_tag(
                latest.registry().to_string(),
                latest.repository().to_string(),
                tag.clone(),
            );
            match self.client.fetch_manifest_digest(&reference, auth).await {
                Ok(tag_digest) if tag_digest == digest => tags.push(tag),
                Ok(_) => debug!(tag, "tag points elsewhere; skipping"),
                Err(e) => warn!(tag, error = %e, "could not resolve tag; skipping"),
            }
        }
        if !tags.iter().any(|t| t == "latest") {
            tags.push("latest".to_string());
        }
        tags.sort();
        Ok(tags)
    }

    async fn push_all_tags(
        &self,
        destination: &str,
        image: &ImageData,
        tags: &[String],
    ) -> anyhow::Result<()> {
        let mut errors: Vec<String> = Vec::new();
        for tag in tags {
            let reference: Reference =
                Reference::try_from(format!("{destination}:{tag}"))
                    .with_context(|| format!("invalid destination {destination:?}"))?;
            let auth = self.keychain.auth_for(&reference).await;
            match self
                .client
                .push(
                    &reference,
                    &image.layers,
                    image.config.clone(),
                    &auth,
                    image.manifest.clone(),
                )
                .await
            {
                Ok(_) => debug!(destination, %tag, "tag applied"),
                Err(e) => errors.push(format!("tag {tag}: {e}")),
            }
        }
        if !errors.is_empty() {
            anyhow::bail!("{}", errors.join("; "));
        }
        info!(destination, tags = tags.len(), "image replicated");
        Ok(())
    }
}

#[async_trait]
impl Reconciler for ReplicatedImageReconciler {
    fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::hydros(REPLICATED_IMAGE_KIND)
    }

    async fn reconcile_node(&self, resource: &RawResource) -> anyhow::Result<()> {
        let replicated: ReplicatedImage = resource.decode()?;
        self.replicate(&replicated).await
    }
}
