//! Docker image manifest types.
//!
//! Wire types for the Docker Registry HTTP API v2 manifest documents:
//! <https://github.com/docker/distribution/blob/master/docs/spec/manifest-v2-2.md>

use std::fmt;

use serde::Deserialize;

/// Media type used to get the manifest list.
pub const MANIFEST_LIST_MIME_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// Media type used to get the manifest.
pub const MANIFEST_MIME_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// The platform description in a manifest-list entry.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)
    }
}

/// The Docker manifest list (fat manifest), mapping platforms to
/// per-platform manifest digests.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestList {
    pub manifests: Vec<PlatformManifest>,
}

/// An entry in a manifest list.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformManifest {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub size: u64,
    pub digest: String,
    pub platform: Platform,
}

/// A Docker image manifest.
///
/// The digest is the identifier the manifest was fetched under; it is not
/// part of the JSON body.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    #[serde(skip)]
    pub digest: String,
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub layers: Vec<LayerDescriptor>,
}

/// A single layer of a Docker image manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct LayerDescriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub size: u64,
    pub digest: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_display() {
        let p = Platform {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
        };
        assert_eq!(p.to_string(), "linux/amd64");
    }

    #[test]
    fn test_manifest_list_parses() {
        let body = r#"{
            "schemaVersion": 2,
            "mediaType": "application/vnd.docker.distribution.manifest.list.v2+json",
            "manifests": [
                {
                    "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                    "size": 123,
                    "digest": "sha256:aaa",
                    "platform": {"architecture": "amd64", "os": "linux"}
                }
            ]
        }"#;

        let list: ManifestList = serde_json::from_str(body).unwrap();
        assert_eq!(list.manifests.len(), 1);
        assert_eq!(list.manifests[0].digest, "sha256:aaa");
        assert_eq!(list.manifests[0].platform.architecture, "amd64");
    }

    #[test]
    fn test_manifest_parses_layers_in_order() {
        let body = r#"{
            "schemaVersion": 2,
            "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
            "config": {"mediaType": "application/vnd.docker.container.image.v1+json", "size": 1, "digest": "sha256:cfg"},
            "layers": [
                {"mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip", "size": 10, "digest": "sha256:one"},
                {"mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip", "size": 20, "digest": "sha256:two"}
            ]
        }"#;

        let manifest: Manifest = serde_json::from_str(body).unwrap();
        assert_eq!(manifest.schema_version, 2);
        assert!(manifest.digest.is_empty());

        let digests: Vec<&str> = manifest.layers.iter().map(|l| l.digest.as_str()).collect();
        assert_eq!(digests, vec!["sha256:one", "sha256:two"]);
    }
}
