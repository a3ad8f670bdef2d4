//! # Image builder
//!
//! Builds `Image` resources: clones the declared source trees, assembles the
//! mapped files into a single deterministic gzipped tar layer, and pushes
//! the result to the target repository tagged with the source commit and
//! `latest`. A tag that already exists for the source commit short-circuits
//! the build, so repeated reconciles of an unchanged tree are cheap.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use oci_client::client::{Client, ClientConfig, Config, ImageLayer};
use oci_client::manifest;
use oci_client::Reference;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::replicator::RegistryKeychain;
use crate::api::image::{Image, ImageSource, IMAGE_KIND};
use crate::api::{GroupVersionKind, RawResource};
use crate::controller::Reconciler;
use crate::git::{Cloner, RepoSpec};
use crate::github::TransportPool;

/// Reconciles `Image` resources.
pub struct ImageReconciler {
    client: Client,
    keychain: RegistryKeychain,
    cloner: Cloner,
    force: bool,
}

impl ImageReconciler {
    pub fn new(pool: Option<Arc<TransportPool>>, base_dir: impl Into<PathBuf>) -> Self {
        let mut cloner = Cloner::new(base_dir.into().join("imagebuild"));
        if let Some(pool) = &pool {
            cloner = cloner.with_transports(Arc::clone(pool));
        }
        Self {
            client: Client::new(ClientConfig::default()),
            keychain: RegistryKeychain::new(pool),
            cloner,
            force: false,
        }
    }

    /// Rebuild and push even when a tag for the source commit already
    /// exists.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Build and push one image. Returns the source commit the image was
    /// built from, recorded on the resource's advisory status by the caller.
    pub async fn build(&self, image: &Image) -> anyhow::Result<String> {
        image.validate()?;

        let mut layer_files: Vec<(PathBuf, Vec<u8>)> = Vec::new();
        let mut source_commit = String::new();
        for source in &image.spec.source {
            let spec = RepoSpec::parse(&source.uri)?;
            let repo_dir = self
                .cloner
                .ensure(&spec)
                .await
                .with_context(|| format!("failed to clone {}", source.uri))?;
            if source_commit.is_empty() {
                source_commit = head_commit(&repo_dir).await?;
            }
            collect_mapped_files(&repo_dir, source, &mut layer_files)?;
        }
        if layer_files.is_empty() {
            anyhow::bail!(
                "Image/{}: source mappings matched no files",
                image.metadata.name
            );
        }
        let commit_tag = short_sha(&source_commit);

        let tagged = Reference::try_from(format!("{}:{}", image.spec.image, commit_tag))
            .with_context(|| format!("invalid target image {:?}", image.spec.image))?;
        let auth = self.keychain.auth_for(&tagged).await;
        if !self.force
            && self
                .client
                .fetch_manifest_digest(&tagged, &auth)
                .await
                .is_ok()
        {
            info!(image = %image.spec.image, tag = %commit_tag, "image already built");
            return Ok(source_commit);
        }

        let (layer, diff_id) = build_layer(&layer_files)?;
        let config_json = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "config": {},
            "rootfs": {"type": "layers", "diff_ids": [diff_id]},
            // Fixed so the same tree always produces the same image.
            "created": "1970-01-01T00:00:00Z",
        });
        let config = Config::new(
            serde_json::to_vec(&config_json)?,
            manifest::IMAGE_CONFIG_MEDIA_TYPE.to_string(),
            None,
        );
        let layers = vec![ImageLayer::new(
            layer,
            manifest::IMAGE_LAYER_GZIP_MEDIA_TYPE.to_string(),
            None,
        )];

        for tag in [commit_tag.as_str(), "latest"] {
            let reference = Reference::with_tag(
                tagged.registry().to_string(),
                tagged.repository().to_string(),
                tag.to_string(),
            );
            self.client
                .push(&reference, &layers, config.clone(), &auth, None)
                .await
                .with_context(|| format!("failed to push {}:{tag}", image.spec.image))?;
            debug!(image = %image.spec.image, tag, "pushed");
        }
        info!(image = %image.spec.image, commit = %source_commit, "image built");
        Ok(source_commit)
    }
}

#[async_trait]
impl Reconciler for ImageReconciler {
    fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::hydros(IMAGE_KIND)
    }

    async fn reconcile_node(&self, resource: &RawResource) -> anyhow::Result<()> {
        let mut image: Image = resource.decode()?;
        let commit = self.build(&image).await?;
        // Advisory only; status is held in process, never persisted.
        let status = image.status.get_or_insert_with(Default::default);
        status.source_commit = commit;
        status.uri = image.spec.image.clone();
        Ok(())
    }
}

async fn head_commit(repo_dir: &Path) -> anyhow::Result<String> {
    let output = tokio::process::Command::new("git")
        .arg("-C")
        .arg(repo_dir)
        .args(["rev-parse", "HEAD"])
        .output()
        .await?;
    if !output.status.success() {
        anyhow::bail!(
            "failed to resolve HEAD in {}: {}",
            repo_dir.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn short_sha(commit: &str) -> String {
    commit.chars().take(12).collect()
}

/// Collect the files a source's mappings select, keyed by their path inside
/// the layer.
fn collect_mapped_files(
    repo_dir: &Path,
    source: &ImageSource,
    out: &mut Vec<(PathBuf, Vec<u8>)>,
) -> anyhow::Result<()> {
    for mapping in &source.mappings {
        let globs = crate::krm::glob_set(std::slice::from_ref(&mapping.src))?;
        for entry in walkdir::WalkDir::new(repo_dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(repo_dir).unwrap_or(entry.path());
            if rel.starts_with(".git") || !globs.is_match(rel) {
                continue;
            }
            let stripped = rel
                .strip_prefix(&mapping.strip_prefix)
                .unwrap_or(rel)
                .to_path_buf();
            let layer_path = if mapping.dest.is_empty() {
                stripped
            } else {
                Path::new(&mapping.dest).join(stripped)
            };
            let data = std::fs::read(entry.path())
                .with_context(|| format!("failed to read {}", entry.path().display()))?;
            out.push((layer_path, data));
        }
    }
    Ok(())
}

/// Assemble a gzipped tar layer with fixed metadata so identical inputs
/// produce identical bytes. Returns the layer and its uncompressed diff id.
fn build_layer(files: &[(PathBuf, Vec<u8>)]) -> anyhow::Result<(Vec<u8>, String)> {
    let mut sorted: Vec<&(PathBuf, Vec<u8>)> = files.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    sorted.dedup_by(|a, b| a.0 == b.0);

    let mut tarball = tar::Builder::new(Vec::new());
    for (path, data) in sorted {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_cksum();
        tarball.append_data(&mut header, path, data.as_slice())?;
    }
    let tar_bytes = tarball.into_inner()?;
    let diff_id = format!("sha256:{}", hex::encode(Sha256::digest(&tar_bytes)));

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    std::io::Write::write_all(&mut encoder, &tar_bytes)?;
    let gz = encoder.finish()?;
    Ok((gz, diff_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_sha() {
        assert_eq!(short_sha("9fa5bc0123456789abcdef"), "9fa5bc012345");
        assert_eq!(short_sha("9fa5bc0"), "9fa5bc0");
    }

    #[test]
    fn test_layer_is_deterministic() {
        let files = vec![
            (PathBuf::from("b.txt"), b"bee".to_vec()),
            (PathBuf::from("a.txt"), b"ay".to_vec()),
        ];
        let (first, diff_first) = build_layer(&files).unwrap();
        let reordered = vec![files[1].clone(), files[0].clone()];
        let (second, diff_second) = build_layer(&reordered).unwrap();
        assert_eq!(first, second);
        assert_eq!(diff_first, diff_second);
    }

    #[test]
    fn test_collect_mapped_files_strips_prefix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("app/static")).unwrap();
        std::fs::write(dir.path().join("app/static/index.html"), "<html/>").unwrap();
        std::fs::write(dir.path().join("README.md"), "readme").unwrap();

        let source: ImageSource = serde_yaml::from_str(
            r"
uri: https://github.com/a/b.git
mappings:
  - src: 'app/static/**'
    stripPrefix: app
    dest: srv
",
        )
        .unwrap();
        let mut out = Vec::new();
        collect_mapped_files(dir.path(), &source, &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, PathBuf::from("srv/static/index.html"));
    }
}
