//! Built-in registry providers: Docker Hub, GCR, GHCR.

mod docker;
mod github;
mod google;

pub use docker::DockerProvider;
pub use github::GhcrProvider;
pub use google::GcrProvider;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use rootpull_core::{PullError, Result};
use serde::Deserialize;

/// The token response returned by registry token endpoints.
#[derive(Deserialize)]
pub(crate) struct TokenResponse {
    #[serde(default)]
    pub token: String,
}

/// A client which sends the given bearer token with every request.
pub(crate) fn bearer_client(token: &str) -> Result<reqwest::Client> {
    let mut headers = HeaderMap::new();

    let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|e| PullError::Provider(format!("invalid bearer token: {e}")))?;
    value.set_sensitive(true);
    headers.insert(AUTHORIZATION, value);

    reqwest::Client::builder()
        .default_headers(headers)
        .build()
        .map_err(|e| PullError::Provider(format!("error building client: {e}")))
}

/// Fetch an access token from a registry token endpoint.
///
/// Even public pulls need one of these on Docker Hub and GHCR.
pub(crate) async fn fetch_token(url: &str) -> Result<String> {
    let res = reqwest::get(url)
        .await
        .map_err(|e| PullError::Provider(format!("error getting access-token via {url}: {e}")))?;

    if res.status() != reqwest::StatusCode::OK {
        return Err(PullError::Network {
            method: "GET".to_string(),
            url: url.to_string(),
            status: Some(res.status().as_u16()),
        });
    }

    let response: TokenResponse = res
        .json()
        .await
        .map_err(|e| PullError::Provider(format!("error parsing response: {e}")))?;

    if response.token.is_empty() {
        return Err(PullError::Provider(format!("{url} did not return a token")));
    }

    Ok(response.token)
}
