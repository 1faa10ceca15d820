//! Hosting-link resolution.
//!
//! Hosting services wrap files in a landing page; a resolver turns that page
//! URL into a direct download URL plus any headers the download needs.

use crate::error::SourceFetchError;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use url::Url;

/// Direct download location produced by a resolver
#[derive(Debug, Clone)]
pub struct ResolvedLink {
    /// Direct download URL
    pub url: String,
    /// Extra request headers the host requires (auth cookies etc.)
    pub headers: Vec<(String, String)>,
    /// Filename reported by the host, if any
    pub filename: Option<String>,
    /// Size reported by the host, if any
    pub size: Option<u64>,
}

/// Resolves a hosting-service page URL into a direct download
#[async_trait]
pub trait LinkResolver: Send + Sync {
    /// Whether this resolver handles the given host
    fn handles(&self, url: &Url) -> bool;

    /// Resolve the page URL; `password` unlocks protected links
    async fn resolve(
        &self,
        url: &str,
        password: Option<&str>,
    ) -> Result<ResolvedLink, SourceFetchError>;
}

/// Resolver for gofile.io links
///
/// Obtains a guest account token, then queries the contents API for the
/// direct link of the first file in the shared folder. Protected links take
/// the password as a sha256 hex digest.
pub struct GofileResolver {
    client: reqwest::Client,
    api_base: String,
}

impl GofileResolver {
    /// Create a resolver against the public gofile API
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_api_base(client, "https://api.gofile.io".to_string())
    }

    /// Create a resolver against a custom API base, for tests
    pub fn with_api_base(client: reqwest::Client, api_base: String) -> Self {
        Self { client, api_base }
    }

    async fn fetch_token(&self, url: &str) -> Result<String, SourceFetchError> {
        let response: serde_json::Value = self
            .client
            .post(format!("{}/accounts", self.api_base))
            .header("User-Agent", super::USER_AGENT)
            .send()
            .await
            .map_err(|e| resolve_failed(url, format!("token request failed: {e}"), true))?
            .json()
            .await
            .map_err(|e| resolve_failed(url, format!("token response not JSON: {e}"), true))?;

        if response["status"] != "ok" {
            return Err(resolve_failed(url, "failed to get account token", true));
        }

        response["data"]["token"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| resolve_failed(url, "token missing from response", true))
    }
}

fn resolve_failed(url: &str, reason: impl Into<String>, retryable: bool) -> SourceFetchError {
    SourceFetchError::ResolveFailed {
        url: url.to_string(),
        reason: reason.into(),
        retryable,
    }
}

#[async_trait]
impl LinkResolver for GofileResolver {
    fn handles(&self, url: &Url) -> bool {
        url.host_str()
            .is_some_and(|h| h == "gofile.io" || h.ends_with(".gofile.io"))
    }

    async fn resolve(
        &self,
        url: &str,
        password: Option<&str>,
    ) -> Result<ResolvedLink, SourceFetchError> {
        let content_id = url
            .rsplit('/')
            .next()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| resolve_failed(url, "no content id in URL", false))?;

        let token = self.fetch_token(url).await?;

        let mut contents_url = format!(
            "{}/contents/{}?wt=4fd6sg89d7s6&cache=true",
            self.api_base, content_id
        );
        if let Some(password) = password {
            let digest = Sha256::digest(password.as_bytes());
            contents_url.push_str(&format!("&password={:x}", digest));
        }

        let response: serde_json::Value = self
            .client
            .get(&contents_url)
            .header("User-Agent", super::USER_AGENT)
            .header("Authorization", format!("Bearer {token}"))
            .send()
            .await
            .map_err(|e| resolve_failed(url, format!("contents request failed: {e}"), true))?
            .json()
            .await
            .map_err(|e| resolve_failed(url, format!("contents response not JSON: {e}"), true))?;

        // Wrong passwords and missing files won't fix themselves on retry
        match response["status"].as_str().unwrap_or("") {
            "ok" => {}
            "error-passwordRequired" => {
                return Err(resolve_failed(url, "password is required for this link", false));
            }
            "error-passwordWrong" => {
                return Err(resolve_failed(url, "password is wrong", false));
            }
            "error-notFound" => {
                return Err(resolve_failed(url, "file not found on host", false));
            }
            "error-notPublic" => {
                return Err(resolve_failed(url, "folder is not public", false));
            }
            other => {
                return Err(resolve_failed(url, format!("host returned status '{other}'"), true));
            }
        }

        let children = response["data"]["children"]
            .as_object()
            .ok_or_else(|| resolve_failed(url, "no contents in response", false))?;

        // Folders with several files: take the first file entry
        let file = children
            .values()
            .find(|c| c["type"] == "file")
            .ok_or_else(|| resolve_failed(url, "no downloadable file in link", false))?;

        let direct_url = file["link"]
            .as_str()
            .ok_or_else(|| resolve_failed(url, "file entry has no download link", false))?;

        Ok(ResolvedLink {
            url: direct_url.to_string(),
            headers: vec![("Cookie".to_string(), format!("accountToken={token}"))],
            filename: file["name"].as_str().map(str::to_string),
            size: file["size"].as_u64(),
        })
    }
}
