//! Google Container Registry provider.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use lazy_static::lazy_static;
use regex::Regex;
use rootpull_core::{PullError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::bearer_client;
use crate::provider::Provider;
use crate::url::ImageUrl;

lazy_static! {
    static ref GCR_HOSTS: Regex = Regex::new(r"([a-z]+?\.)?gcr\.io").unwrap();
}

/// The scope needed to pull blobs from GCR buckets.
const GCR_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_only";

/// Access-token lifetime requested in the JWT grant.
const TOKEN_LIFETIME_SECS: u64 = 3600;

/// The relevant parts of a service account JSON file.
#[derive(Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    token_uri: String,
}

/// Claim set of the OAuth2 JWT bearer grant.
#[derive(Serialize)]
struct GrantClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

#[derive(Deserialize)]
struct AccessTokenResponse {
    access_token: String,
}

/// Authenticates clients against the Google Cloud Registry.
///
/// The auth string is the path to a service account JSON file; an empty
/// string gives anonymous access. The required scope is limited to
/// `devstorage.read_only`.
#[derive(Default, Debug)]
pub struct GcrProvider {
    clients: Mutex<HashMap<String, reqwest::Client>>,
}

impl GcrProvider {
    pub fn new() -> Self {
        Self::default()
    }

    async fn new_client(&self, auth: &str) -> Result<reqwest::Client> {
        // unauthenticated access
        if auth.is_empty() {
            return Ok(reqwest::Client::new());
        }

        let json = std::fs::read_to_string(auth)
            .map_err(|e| PullError::Provider(format!("error reading auth file {auth}: {e}")))?;

        let key: ServiceAccountKey = serde_json::from_str(&json)
            .map_err(|e| PullError::Provider(format!("error parsing auth file {auth}: {e}")))?;

        let token = exchange_jwt(&key).await?;
        bearer_client(&token)
    }
}

/// Trade a signed service-account JWT for an access token.
async fn exchange_jwt(key: &ServiceAccountKey) -> Result<String> {
    let iat = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let claims = GrantClaims {
        iss: &key.client_email,
        scope: GCR_SCOPE,
        aud: &key.token_uri,
        iat,
        exp: iat + TOKEN_LIFETIME_SECS,
    };

    let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
        .map_err(|e| PullError::Provider(format!("error reading service account key: {e}")))?;

    let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &signing_key)
        .map_err(|e| PullError::Provider(format!("error signing token request: {e}")))?;

    let res = reqwest::Client::new()
        .post(&key.token_uri)
        .form(&[
            ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
            ("assertion", assertion.as_str()),
        ])
        .send()
        .await
        .map_err(|e| {
            PullError::Provider(format!("error authenticating with {}: {e}", key.token_uri))
        })?;

    if res.status() != reqwest::StatusCode::OK {
        return Err(PullError::Network {
            method: "POST".to_string(),
            url: key.token_uri.clone(),
            status: Some(res.status().as_u16()),
        });
    }

    let token: AccessTokenResponse = res
        .json()
        .await
        .map_err(|e| PullError::Provider(format!("error parsing token response: {e}")))?;

    Ok(token.access_token)
}

#[async_trait]
impl Provider for GcrProvider {
    fn supports(&self, url: &ImageUrl) -> bool {
        GCR_HOSTS.is_match(&url.host)
    }

    async fn client(&self, _url: &ImageUrl, auth: &str) -> Result<reqwest::Client> {
        let mut clients = self.clients.lock().await;

        // the client for GCR is only bound to the auth string
        if let Some(client) = clients.get(auth) {
            return Ok(client.clone());
        }

        let client = self.new_client(auth).await?;
        clients.insert(auth.to_string(), client.clone());

        Ok(client)
    }
}
