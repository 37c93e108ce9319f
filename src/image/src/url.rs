//! Image URL parsing.
//!
//! Parses container image references like `ubuntu:latest`,
//! `gcr.io/google-containers/etcd:3.3.10` or `foo/bar@sha256:abc...` into
//! structured components with the defaults registries assume in practice.

use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;
use rootpull_core::{PullError, Result};

lazy_static! {
    // hosts that may keep an explicit http:// scheme (local registries)
    static ref LOCAL_URL: Regex =
        Regex::new(r"(?i)^http://(127\.[\d.]+|\[?[0:]+1\]?|localhost)").unwrap();
}

/// Default host when none is specified.
const DEFAULT_HOST: &str = "registry-1.docker.io";

/// Default repository when none is specified.
const DEFAULT_REPOSITORY: &str = "library";

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Parsed container image URL.
///
/// The canonical form always carries a host, repository and tag; the digest
/// is optional and preferred over the tag for retrieval when present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageUrl {
    /// Image name (e.g., "ubuntu"); non-empty after a successful parse
    pub name: String,
    /// Registry host (e.g., "registry-1.docker.io", "gcr.io")
    pub host: String,
    /// Repository (e.g., "library", "google-containers")
    pub repository: String,
    /// Tag (e.g., "latest", "18.04")
    pub tag: String,
    /// Optional digest (e.g., "sha256:abc...")
    pub digest: Option<String>,
}

impl ImageUrl {
    /// Parse an image URL string.
    ///
    /// Supported formats:
    /// - `ubuntu` → registry-1.docker.io/library/ubuntu:latest
    /// - `ubuntu:18.04` → registry-1.docker.io/library/ubuntu:18.04
    /// - `gcr.io/google-containers/ubuntu` → gcr.io/google-containers/ubuntu:latest
    /// - `foo/bar@sha256:abc` → registry-1.docker.io/foo/bar:latest@sha256:abc
    pub fn parse(url: &str) -> Result<ImageUrl> {
        let url = url.trim();

        if url.is_empty() {
            return Err(PullError::Parse("passed an empty url".to_string()));
        }

        let mut parsed = ImageUrl::default();

        // if there's an @, we got our digest
        let url = match url.split_once('@') {
            Some((rest, digest)) => {
                parsed.digest = Some(digest.to_string());
                rest
            }
            None => url,
        };

        // before the first slash is the host, after it repository and name
        let mut parts: Vec<&str> = url.split('/').collect();

        // if there is a slash and we got a dot or a colon we found a host name
        if parts.len() > 1 && parts[0].contains(['.', ':']) {
            parsed.host = parts.remove(0).to_string();
        }

        // if there's a colon in the last part, we got a tag
        if let Some(last) = parts.last_mut() {
            if let Some((name, tag)) = last.split_once(':') {
                parsed.tag = tag.to_string();
                *last = name;
            }
        }

        // the rest should be the name and possibly the repository
        match parts.len() {
            1 => parsed.name = parts[0].to_string(),
            2 => {
                parsed.repository = parts[0].to_string();
                parsed.name = parts[1].to_string();
            }
            _ => {
                return Err(PullError::Parse(format!("too many slashes in {url}")));
            }
        }

        if parsed.name.is_empty() {
            return Err(PullError::Parse(format!("could not find a name for {url}")));
        }

        // finally, we add some defaults that are set in practice
        if parsed.host.is_empty() {
            parsed.host = DEFAULT_HOST.to_string();
        }

        if parsed.tag.is_empty() {
            parsed.tag = DEFAULT_TAG.to_string();
        }

        if parsed.repository.is_empty() {
            parsed.repository = DEFAULT_REPOSITORY.to_string();
        }

        Ok(parsed)
    }

    /// An API endpoint of the v2 registry API for this image.
    pub fn endpoint(&self, segments: &[&str]) -> String {
        // by default, no protocol is given and we force https
        let host = if LOCAL_URL.is_match(&self.host) {
            // the host may include the http protocol if it points to a
            // local address
            self.host.clone()
        } else {
            format!("https://{}", self.host)
        };

        format!(
            "{}/v2/{}/{}/{}",
            host,
            self.repository,
            self.name,
            segments.join("/")
        )
    }

    /// Either the digest or, if the digest is absent, the tag.
    pub fn reference(&self) -> &str {
        match &self.digest {
            Some(digest) => digest,
            None => &self.tag,
        }
    }
}

impl fmt::Display for ImageUrl {
    /// The normalized form of the URL, i.e. the longer form with a
    /// guaranteed host, repository and tag. An empty URL formats as
    /// `<empty>`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            return write!(f, "<empty>");
        }

        write!(
            f,
            "{}/{}/{}:{}",
            self.host, self.repository, self.name, self.tag
        )?;

        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }

        Ok(())
    }
}
