//! `Image` and `ReplicatedImage` resources.

use serde::{Deserialize, Serialize};

use super::{Metadata, ResourceError};

pub const IMAGE_KIND: &str = "Image";
pub const REPLICATED_IMAGE_KIND: &str = "ReplicatedImage";

/// Declarative build of a source tree into a registry tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    pub api_version: String,
    pub kind: String,
    pub metadata: Metadata,
    pub spec: ImageSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ImageStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    /// Target repository, without digest or tag,
    /// e.g. `ghcr.io/jlewi/hydros`.
    pub image: String,
    /// Source trees whose files become image layers.
    pub source: Vec<ImageSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSource {
    /// Clone URI of the repository providing the files,
    /// `https://{host}/{owner}/{repo}.git?ref={branch}`.
    pub uri: String,
    /// Files copied into the layer.
    #[serde(default)]
    pub mappings: Vec<SourceMapping>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMapping {
    /// Glob relative to the repository root.
    pub src: String,
    /// Leading path components stripped before placing the file.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub strip_prefix: String,
    /// Directory inside the layer the files land in.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dest: String,
}

/// Advisory status; held in process, never persisted centrally.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uri: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_commit: String,
}

impl Image {
    pub fn validate(&self) -> Result<(), ResourceError> {
        let fail = |msg: &str| {
            Err(ResourceError::InvalidResource(
                format!("Image/{}", self.metadata.name),
                msg.to_string(),
            ))
        };
        if self.spec.image.is_empty() {
            return fail("spec.image must be set");
        }
        if self.spec.image.contains('@') || self.spec.image.rsplit('/').next().is_some_and(|last| last.contains(':')) {
            return fail("spec.image must be a bare repository without tag or digest");
        }
        if self.spec.source.is_empty() {
            return fail("spec.source must list at least one source tree");
        }
        Ok(())
    }
}

/// Copies an image, digest-pinned with all of its tags, from a source
/// registry to one or more destination registries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicatedImage {
    pub api_version: String,
    pub kind: String,
    pub metadata: Metadata,
    pub spec: ReplicatedImageSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicatedImageSpec {
    pub source: ReplicatedImageSource,
    /// Destination repositories, without digest or tag.
    pub destinations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicatedImageSource {
    /// Source repository, without digest or tag. The reconciler resolves its
    /// `latest` tag.
    pub repository: String,
}

impl ReplicatedImage {
    pub fn validate(&self) -> Result<(), ResourceError> {
        let fail = |msg: &str| {
            Err(ResourceError::InvalidResource(
                format!("ReplicatedImage/{}", self.metadata.name),
                msg.to_string(),
            ))
        };
        if self.spec.source.repository.is_empty() {
            return fail("spec.source.repository must be set");
        }
        if self.spec.source.repository.contains('@') {
            return fail("spec.source.repository must not carry a digest");
        }
        if self.spec.destinations.is_empty() {
            return fail("spec.destinations must list at least one repository");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replicated_image_round_trip() {
        let r: ReplicatedImage = serde_yaml::from_str(
            r"
apiVersion: hydros.dev/v1alpha1
kind: ReplicatedImage
metadata:
  name: vscode-ext
spec:
  source:
    repository: us-west1-docker.pkg.dev/foyle-public/images/foyle-vscode-ext
  destinations:
    - ghcr.io/jlewi/foyle-vscode-ext
",
        )
        .unwrap();
        assert!(r.validate().is_ok());
        assert_eq!(r.spec.destinations.len(), 1);
    }

    #[test]
    fn test_digest_in_source_rejected() {
        let mut r: ReplicatedImage = serde_yaml::from_str(
            r"
apiVersion: hydros.dev/v1alpha1
kind: ReplicatedImage
metadata: {name: bad}
spec:
  source: {repository: 'ghcr.io/a/b'}
  destinations: ['ghcr.io/c/d']
",
        )
        .unwrap();
        r.spec.source.repository = "ghcr.io/a/b@sha256:abc".to_string();
        assert!(r.validate().is_err());
    }

    #[test]
    fn test_image_tag_in_target_rejected() {
        let img: Image = serde_yaml::from_str(
            r"
apiVersion: hydros.dev/v1alpha1
kind: Image
metadata: {name: bad}
spec:
  image: ghcr.io/jlewi/hydros:latest
  source:
    - uri: https://github.com/jlewi/hydros.git?ref=main
",
        )
        .unwrap();
        assert!(img.validate().is_err());
    }
}
