//! GitHub Container Registry provider.

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
    static ref GHCR_HOSTS: Regex = Regex::new(r"ghcr\.io").unwrap();
}

/// Authenticates clients against the GitHub Container Registry.
///
/// There is no support for private repositories and `auth` is ignored.
#[derive(Default, Debug)]
pub struct GhcrProvider {
    clients: Mutex<HashMap<String, reqwest::Client>>,
}

impl GhcrProvider {
    pub fn new() -> Self {
        Self::default()
    }

    async fn new_client(&self, repository: &str, name: &str) -> Result<reqwest::Client> {
        // even public api connections need an authorization token
        let token_url =
            format!("https://ghcr.io/token?scope=repository:{repository}/{name}:pull");

        let token = fetch_token(&token_url).await?;
        bearer_client(&token)
    }
}

#[async_trait]
impl Provider for GhcrProvider {
    fn supports(&self, url: &ImageUrl) -> bool {
        GHCR_HOSTS.is_match(&url.host)
    }

    async fn client(&self, url: &ImageUrl, _auth: &str) -> Result<reqwest::Client> {
        let mut clients = self.clients.lock().await;

        // the client for GHCR is bound to the repository
        if let Some(client) = clients.get(&url.repository) {
            return Ok(client.clone());
        }

        let client = self.new_client(&url.repository, &url.name).await?;
        clients.insert(url.repository.clone(), client.clone());

        Ok(client)
    }
}
