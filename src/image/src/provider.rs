//! Registry authentication providers.
//!
//! A provider turns an image URL into an HTTP client that is authenticated
//! to pull from the registry hosting it. The registry object is built once
//! at startup and injected wherever a [`Remote`](crate::Remote) is
//! constructed, so tests can use a fresh registry without teardown hooks.

use std::sync::Arc;

use async_trait::async_trait;
use rootpull_core::{PullError, Result};

use crate::providers::{DockerProvider, GcrProvider, GhcrProvider};
use crate::url::ImageUrl;

/// Provides an authenticated client for the URLs it supports.
#[async_trait]
pub trait Provider: Send + Sync + std::fmt::Debug {
    /// True if the provider supports the given URL. Multiple providers may
    /// support the same URL; the first one in registration order wins.
    fn supports(&self, url: &ImageUrl) -> bool;

    /// An HTTP client authenticated to interact with the repository behind
    /// the URL. Called once per remote; it is up to the provider to reuse
    /// clients across calls, as what they can be shared on depends on the
    /// registry.
    ///
    /// The `auth` parameter is an opaque authentication string whose meaning
    /// is determined by the provider itself: a path, a token, an empty
    /// string for anonymous access.
    async fn client(&self, url: &ImageUrl, auth: &str) -> Result<reqwest::Client>;
}

/// An ordered collection of named providers.
///
/// Lookup scans in registration order, so providers registered earlier take
/// priority. Registration is meant to happen during startup; lookups are
/// read-only and safe to share across tasks.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: Vec<(String, Arc<dyn Provider>)>,
}

impl ProviderRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under the given name, appending it to the
    /// lookup order.
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.push((name.into(), provider));
    }

    /// The first registered provider that supports the given URL.
    pub fn lookup(&self, url: &ImageUrl) -> Result<Arc<dyn Provider>> {
        for (_, provider) in &self.providers {
            if provider.supports(url) {
                return Ok(Arc::clone(provider));
            }
        }

        Err(PullError::Provider(format!("no provider for {url}")))
    }
}

/// The registry with all built-in providers registered: Docker Hub, the
/// Google Container Registry and the GitHub Container Registry.
pub fn default_registry() -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    registry.register("docker", Arc::new(DockerProvider::new()));
    registry.register("gcr", Arc::new(GcrProvider::new()));
    registry.register("gh", Arc::new(GhcrProvider::new()));
    registry
}
