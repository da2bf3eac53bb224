//! Wire documents retrieved from the registry

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Partial implementation of the OCI image manifest / image index schema.
///
/// The same struct covers both document kinds: a plain manifest carries
/// `layers` (and usually `config`), while an index carries `manifests`.
/// Fields we do not consume are ignored on read; layer order is preserved.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Manifest {
    #[serde(default)]
    pub config: Option<Layer>,
    #[serde(default)]
    pub layers: Vec<Layer>,
    #[serde(default)]
    pub manifests: Vec<PlatformManifest>,
}

/// Descriptor of one content-addressed blob inside a manifest
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Layer {
    pub digest: String,
    pub size: u64,
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// One entry of a multi-arch image index
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct PlatformManifest {
    pub digest: String,
    #[serde(default)]
    pub size: u64,
    pub platform: Platform,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Platform {
    pub architecture: String,
}

impl Manifest {
    /// True when this document is a multi-arch index rather than a plain
    /// manifest
    pub fn is_index(&self) -> bool {
        !self.manifests.is_empty()
    }

    /// Find the index entry matching a platform architecture
    pub fn platform_entry(&self, architecture: &str) -> Option<&PlatformManifest> {
        self.manifests
            .iter()
            .find(|entry| entry.platform.architecture == architecture)
    }
}

pub mod media_types {
    pub const MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const MANIFEST_LIST: &str = "application/vnd.oci.image.index.v1+json";
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";

    /// Accept header value for requests that may resolve to either a plain
    /// manifest or a multi-arch index
    pub const ACCEPT_MANIFEST_OR_LIST: &str = concat!(
        "application/vnd.oci.image.manifest.v1+json, ",
        "application/vnd.oci.image.index.v1+json, ",
        "application/vnd.docker.distribution.manifest.v2+json, ",
        "application/vnd.docker.distribution.manifest.list.v2+json"
    );
}

/// Annotation key marking a layer that carries per-layer size metadata
/// rather than content, used for update-size estimates downstream
pub const LAYERS_META_ANNOTATION: &str = "layers-meta";
