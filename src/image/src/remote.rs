//! Registry client for a single image.
//!
//! A [`Remote`] binds an authenticated HTTP client to a parsed image URL and
//! speaks the Docker Registry HTTP API v2: manifest-list and manifest
//! negotiation, digest resolution and blob downloads. Platform selection is
//! opt-in through [`Remote::with_platform`].

use std::fmt;

use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use rootpull_core::{PullError, Result};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::manifest::{
    LayerDescriptor, Manifest, ManifestList, Platform, MANIFEST_LIST_MIME_TYPE, MANIFEST_MIME_TYPE,
};
use crate::provider::ProviderRegistry;
use crate::url::ImageUrl;

/// An image on a remote repository.
#[derive(Clone, Debug)]
pub struct Remote {
    client: reqwest::Client,
    url: ImageUrl,
    platform: Option<Platform>,
    cancel: CancellationToken,
}

impl fmt::Display for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.platform {
            Some(platform) => write!(f, "{} {}", self.url, platform),
            None => write!(f, "{}", self.url),
        }
    }
}

impl Remote {
    /// Connect to the repository holding the given image.
    ///
    /// Resolves a provider for the URL, obtains an authenticated client and
    /// probes the registry for v2 manifest support. An error is returned if
    /// the remote cannot be accessed due to lack of permissions or only
    /// speaks the legacy schema.
    pub async fn new(
        registry: &ProviderRegistry,
        url: ImageUrl,
        auth: &str,
        cancel: CancellationToken,
    ) -> Result<Remote> {
        let provider = registry.lookup(&url)?;
        let client = provider.client(&url, auth).await?;

        require_manifest_support(&client, &url, &cancel).await?;

        Ok(Remote {
            client,
            url,
            platform: None,
            cancel,
        })
    }

    /// The URL this remote was constructed for.
    pub fn url(&self) -> &ImageUrl {
        &self.url
    }

    /// Bind the given platform to the remote; subsequent digest and manifest
    /// queries are scoped to it.
    pub fn with_platform(&mut self, platform: Platform) {
        self.platform = Some(platform);
    }

    /// All the platforms the image supports, or `None` if the image does not
    /// have multi-platform support (i.e. there is no manifest list).
    ///
    /// If the image has platforms, bind the required one with
    /// [`with_platform`](Self::with_platform) before using other methods, as
    /// you will otherwise get whatever the registry deems to be the default,
    /// which might not be what you want.
    pub async fn platforms(&self) -> Result<Option<Vec<Platform>>> {
        let list = self.manifest_list().await?;

        // each manifest has exactly one platform
        Ok(list.map(|l| l.manifests.into_iter().map(|m| m.platform).collect()))
    }

    /// Query the remote for the manifest list.
    ///
    /// A missing manifest list is not an error and yields `None`, as most
    /// images do not have one. A list that is present but unparseable is an
    /// error however.
    pub async fn manifest_list(&self) -> Result<Option<ManifestList>> {
        let res = match self
            .request(Method::GET, MANIFEST_LIST_MIME_TYPE, &["manifests", self.url.reference()])
            .await
        {
            Ok(res) => res,
            Err(_) => return Ok(None),
        };

        let body = read_body(res, "manifest list").await?;

        let list: ManifestList = serde_json::from_slice(&body).map_err(|e| PullError::Decode {
            what: "manifest list".to_string(),
            message: e.to_string(),
        })?;

        Ok(Some(list))
    }

    /// The manifest of the image, honoring the bound platform.
    pub async fn manifest(&self) -> Result<Manifest> {
        // the digest is bound to the platform
        let digest = self.digest().await?;

        // it should almost certainly be fetchable at this point
        let res = self
            .request(Method::GET, MANIFEST_MIME_TYPE, &["manifests", &digest])
            .await?;

        // if the server responds with a manifest list, our digest is not
        // the digest of a manifest
        let content_type = header(&res, CONTENT_TYPE.as_str());
        if content_type != MANIFEST_MIME_TYPE {
            return Err(PullError::Decode {
                what: format!("manifest@{digest}"),
                message: format!("content type cannot be {content_type}"),
            });
        }

        let body = read_body(res, "manifest").await?;

        let mut manifest: Manifest =
            serde_json::from_slice(&body).map_err(|e| PullError::Decode {
                what: "manifest".to_string(),
                message: e.to_string(),
            })?;
        manifest.digest = digest;

        Ok(manifest)
    }

    /// The latest digest of the image, honoring the bound platform.
    pub async fn digest(&self) -> Result<String> {
        // due to https://github.com/docker/distribution/issues/2395 we
        // always have to request the manifest list, even if it doesn't
        // exist, as images with manifest lists on docker hub will not
        // return the expected digest otherwise
        let list = self.manifest_list().await?;

        let Some(platform) = &self.platform else {
            // if there's a list, but no platform, take the first item
            if let Some(list) = &list {
                if let Some(first) = list.manifests.first() {
                    return Ok(first.digest.clone());
                }
            }

            // if there's no list either, fall back to whatever the server
            // gives us through the docker-content-digest header
            let res = self
                .request(Method::HEAD, MANIFEST_MIME_TYPE, &["manifests", self.url.reference()])
                .await?;

            let digest = header(&res, "Docker-Content-Digest");
            if digest.is_empty() {
                return Err(PullError::Decode {
                    what: format!("digest of {}", self.url),
                    message: "missing Docker-Content-Digest header".to_string(),
                });
            }

            return Ok(digest);
        };

        // if there is a platform, we require a list
        let Some(list) = list else {
            return Err(PullError::PlatformNotFound(format!(
                "no multi-platform support: {}",
                self.url
            )));
        };

        for manifest in &list.manifests {
            if manifest.platform == *platform {
                return Ok(manifest.digest.clone());
            }
        }

        // there was no match
        Err(PullError::PlatformNotFound(format!(
            "no manifest found for {self}"
        )))
    }

    /// The layers of the image, in manifest order.
    pub async fn layers(&self) -> Result<Vec<LayerDescriptor>> {
        Ok(self.manifest().await?.layers)
    }

    /// Download a layer blob into the given writer.
    pub async fn download_layer<W: AsyncWrite + Unpin>(
        &self,
        digest: &str,
        writer: &mut W,
    ) -> Result<()> {
        let res = self.request(Method::GET, "*/*", &["blobs", digest]).await?;
        let url = res.url().to_string();

        let mut stream = res.bytes_stream();

        while let Some(chunk) = stream.next().await {
            if self.cancel.is_cancelled() {
                return Err(PullError::Interrupted);
            }

            let chunk = chunk.map_err(|e| {
                tracing::debug!(digest = %digest, error = %e, "layer download failed");
                PullError::Network {
                    method: "GET".to_string(),
                    url: url.clone(),
                    status: None,
                }
            })?;

            writer.write_all(&chunk).await?;
        }

        writer.flush().await?;

        Ok(())
    }

    /// Send a request for the given API segments, with cancellation, and
    /// require a 200 response.
    async fn request(
        &self,
        method: Method,
        accept: &str,
        segments: &[&str],
    ) -> Result<reqwest::Response> {
        let url = self.url.endpoint(segments);

        let send = self
            .client
            .request(method.clone(), &url)
            .header(ACCEPT, accept)
            .send();

        let res = tokio::select! {
            _ = self.cancel.cancelled() => return Err(PullError::Interrupted),
            res = send => res.map_err(|e| {
                tracing::debug!(url = %url, error = %e, "request failed");
                PullError::Network {
                    method: method.to_string(),
                    url: url.clone(),
                    status: None,
                }
            })?,
        };

        if res.status() != StatusCode::OK {
            return Err(PullError::Network {
                method: method.to_string(),
                url,
                status: Some(res.status().as_u16()),
            });
        }

        Ok(res)
    }
}

/// Probe the registry for v2 manifest support.
///
/// This gates out registries that only speak the schema-v1 protocol, which
/// the extraction engine does not understand.
async fn require_manifest_support(
    client: &reqwest::Client,
    url: &ImageUrl,
    cancel: &CancellationToken,
) -> Result<()> {
    let endpoint = url.endpoint(&["manifests", url.reference()]);

    let send = client
        .head(&endpoint)
        .header(ACCEPT, format!("{MANIFEST_MIME_TYPE}, */*"))
        .send();

    let res = tokio::select! {
        _ = cancel.cancelled() => return Err(PullError::Interrupted),
        res = send => res.map_err(|e| {
            tracing::debug!(url = %endpoint, error = %e, "probe failed");
            PullError::Network {
                method: "HEAD".to_string(),
                url: endpoint.clone(),
                status: None,
            }
        })?,
    };

    if res.status() != StatusCode::OK {
        return Err(PullError::Network {
            method: "HEAD".to_string(),
            url: endpoint,
            status: Some(res.status().as_u16()),
        });
    }

    let mime = header(&res, CONTENT_TYPE.as_str());
    if mime != MANIFEST_MIME_TYPE && mime != MANIFEST_LIST_MIME_TYPE {
        return Err(PullError::UnsupportedRegistry {
            url: url.to_string(),
        });
    }

    Ok(())
}

/// A response header as a string, empty when absent.
fn header(res: &reqwest::Response, name: &str) -> String {
    res.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Read a response body, attributing failures to what was being fetched.
async fn read_body(res: reqwest::Response, what: &str) -> Result<Vec<u8>> {
    Ok(res
        .bytes()
        .await
        .map_err(|e| PullError::Decode {
            what: what.to_string(),
            message: format!("error reading response body: {e}"),
        })?
        .to_vec())
}
