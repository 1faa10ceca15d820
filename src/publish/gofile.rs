//! gofile.io upload destination.

use crate::error::DestinationError;
use async_trait::async_trait;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use super::Destination;

/// Uploads artifacts to gofile.io and returns the download page link
pub struct GofileDestination {
    client: reqwest::Client,
    api_base: String,
    /// Overrides the per-server upload URL, for tests
    upload_base: Option<String>,
}

impl GofileDestination {
    /// Create a destination against the public gofile API
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            api_base: "https://api.gofile.io".to_string(),
            upload_base: None,
        }
    }

    /// Create a destination against custom endpoints, for tests
    pub fn with_endpoints(client: reqwest::Client, api_base: String, upload_base: String) -> Self {
        Self {
            client,
            api_base,
            upload_base: Some(upload_base),
        }
    }

    /// Ask the API which storage server to upload to
    async fn pick_server(&self) -> Result<String, DestinationError> {
        let response: serde_json::Value = self
            .client
            .get(format!("{}/servers", self.api_base))
            .send()
            .await
            .map_err(|e| transient(format!("server list request failed: {e}")))?
            .json()
            .await
            .map_err(|e| transient(format!("server list response not JSON: {e}")))?;

        if response["status"] != "ok" {
            return Err(transient("failed to get upload server list".to_string()));
        }

        let server = response["data"]["servers"][0]["name"]
            .as_str()
            .ok_or_else(|| transient("no upload server available".to_string()))?;

        Ok(format!("https://{server}.gofile.io"))
    }
}

fn transient(reason: String) -> DestinationError {
    DestinationError::Transient {
        destination: "gofile".to_string(),
        reason,
    }
}

fn hard(reason: String) -> DestinationError {
    DestinationError::Hard {
        destination: "gofile".to_string(),
        reason,
    }
}

#[async_trait]
impl Destination for GofileDestination {
    fn name(&self) -> &str {
        "gofile"
    }

    fn accepts(&self, _size: u64) -> bool {
        // gofile takes arbitrarily large files on the free tier
        true
    }

    async fn deliver(
        &self,
        artifact: &Path,
        cancel: &CancellationToken,
    ) -> Result<String, DestinationError> {
        let upload_base = match &self.upload_base {
            Some(base) => base.clone(),
            None => self.pick_server().await?,
        };

        let filename = artifact
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("merged.mkv")
            .to_string();

        let file = tokio::fs::File::open(artifact)
            .await
            .map_err(|e| hard(format!("cannot open artifact: {e}")))?;
        let stream = tokio_util::io::ReaderStream::new(file);
        let part = reqwest::multipart::Part::stream(reqwest::Body::wrap_stream(stream))
            .file_name(filename);
        let form = reqwest::multipart::Form::new().part("file", part);

        let request = self
            .client
            .post(format!("{upload_base}/contents/uploadfile"))
            .multipart(form)
            .send();

        let response = tokio::select! {
            response = request => {
                response.map_err(|e| transient(format!("upload failed: {e}")))?
            }
            _ = cancel.cancelled() => {
                return Err(hard("cancelled".to_string()));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let reason = format!("upload rejected with HTTP status {status}");
            return if status.is_server_error()
                || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            {
                Err(transient(reason))
            } else {
                Err(hard(reason))
            };
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| transient(format!("upload response not JSON: {e}")))?;

        if body["status"] != "ok" {
            return Err(hard(format!(
                "upload failed with status '{}'",
                body["status"].as_str().unwrap_or("unknown")
            )));
        }

        body["data"]["downloadPage"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| hard("upload response missing download page".to_string()))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::IsRetryable;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn artifact(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("merged.mkv");
        tokio::fs::write(&path, b"video bytes").await.unwrap();
        path
    }

    fn destination(server: &MockServer) -> GofileDestination {
        GofileDestination::with_endpoints(reqwest::Client::new(), server.uri(), server.uri())
    }

    #[tokio::test]
    async fn upload_returns_download_page() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/contents/uploadfile"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "ok",
                "data": { "downloadPage": "https://gofile.io/d/xyz789" }
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let reference = destination(&server)
            .deliver(&artifact(&dir).await, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(reference, "https://gofile.io/d/xyz789");
    }

    #[tokio::test]
    async fn rate_limit_is_transient_auth_failure_is_hard() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/contents/uploadfile"))
            .respond_with(ResponseTemplate::new(429))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = destination(&server);
        let file = artifact(&dir).await;

        let err = dest
            .deliver(&file, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "429 should be retried");

        server.reset().await;
        Mock::given(method("POST"))
            .and(path("/contents/uploadfile"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = dest
            .deliver(&file, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(!err.is_retryable(), "401 must not be retried");
    }

    #[tokio::test]
    async fn missing_artifact_is_a_hard_failure() {
        let server = MockServer::start().await;
        let err = destination(&server)
            .deliver(
                std::path::Path::new("/nonexistent/merged.mkv"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("cannot open artifact"), "got: {err}");
    }

    #[tokio::test]
    async fn server_pick_failure_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/servers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "error"
            })))
            .mount(&server)
            .await;

        // No upload_base override, so the server list is consulted
        let dest = GofileDestination {
            client: reqwest::Client::new(),
            api_base: server.uri(),
            upload_base: None,
        };

        let dir = tempfile::tempdir().unwrap();
        let err = dest
            .deliver(&artifact(&dir).await, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
