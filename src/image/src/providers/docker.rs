//! Docker Hub provider.

use std::collections::HashMap;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use rootpull_core::Result;
use tokio::sync::Mutex;

use super::{bearer_client, fetch_token};
use crate::provider::Provider;
use crate::url::ImageUrl;

lazy_static! {
    static ref DOCKER_HOSTS: Regex = Regex::new(r"([a-z0-9-]+\.)?docker\.io").unwrap();
}

/// Authenticates clients against the Docker Hub.
///
/// There is no support for private repositories and `auth` is ignored. Note
/// also that the token given by Docker Hub expires after 5 minutes - renewal
/// logic has not been implemented yet.
#[derive(Default, Debug)]
pub struct DockerProvider {
    clients: Mutex<HashMap<String, reqwest::Client>>,
}

impl DockerProvider {
    pub fn new() -> Self {
        Self::default()
    }

    async fn new_client(&self, repository: &str, name: &str) -> Result<reqwest::Client> {
        // even public api connections need an authorization token
        let token_url = format!(
            "https://auth.docker.io/token?service=registry.docker.io&scope=repository:{repository}/{name}:pull"
        );

        let token = fetch_token(&token_url).await?;
        bearer_client(&token)
    }
}

#[async_trait]
impl Provider for DockerProvider {
    fn supports(&self, url: &ImageUrl) -> bool {
        DOCKER_HOSTS.is_match(&url.host)
    }

    async fn client(&self, url: &ImageUrl, _auth: &str) -> Result<reqwest::Client> {
        let mut clients = self.clients.lock().await;

        // the client for Docker Hub is bound to the repository
        if let Some(client) = clients.get(&url.repository) {
            return Ok(client.clone());
        }

        let client = self.new_client(&url.repository, &url.name).await?;
        clients.insert(url.repository.clone(), client.clone());

        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supports_docker_hosts() {
        let provider = DockerProvider::new();

        for host in ["docker.io", "registry-1.docker.io", "index.docker.io"] {
            let url = ImageUrl {
                host: host.to_string(),
                ..Default::default()
            };
            assert!(provider.supports(&url), "expected support for {host}");
        }

        let url = ImageUrl {
            host: "ghcr.io".to_string(),
            ..Default::default()
        };
        assert!(!provider.supports(&url));
    }
}
