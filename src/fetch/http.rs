//! HTTP source fetcher for direct URLs and resolvable hosting links.

use crate::config::LimitsConfig;
use crate::error::SourceFetchError;
use crate::types::Source;
use async_trait::async_trait;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{FetchProgressFn, FetchedFile, LinkResolver, ResolvedLink, SourceFetcher};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Fetcher for [`Source::DirectUrl`] and [`Source::HostedLink`]
///
/// Hosted links are first resolved to a direct URL through the registered
/// [`LinkResolver`]s, then streamed to disk like any direct URL. Downloads
/// verify the declared Content-Length and enforce the configured size cap.
pub struct HttpSourceFetcher {
    client: reqwest::Client,
    resolvers: Vec<Box<dyn LinkResolver>>,
    max_file_size: u64,
    max_url_length: usize,
}

impl HttpSourceFetcher {
    /// Create a fetcher with the default resolver set
    pub fn new(limits: &LimitsConfig) -> Result<Self, SourceFetchError> {
        let client = reqwest::Client::builder()
            .user_agent(super::USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| SourceFetchError::RequestFailed {
                origin: "http client".to_string(),
                reason: e.to_string(),
                retryable: false,
            })?;

        let resolvers: Vec<Box<dyn LinkResolver>> =
            vec![Box::new(super::GofileResolver::new(client.clone()))];

        Ok(Self {
            client,
            resolvers,
            max_file_size: limits.max_file_size,
            max_url_length: limits.max_url_length,
        })
    }

    /// Create a fetcher with an explicit client and resolver set, for tests
    /// and custom hosting services
    pub fn with_resolvers(
        client: reqwest::Client,
        resolvers: Vec<Box<dyn LinkResolver>>,
        limits: &LimitsConfig,
    ) -> Self {
        Self {
            client,
            resolvers,
            max_file_size: limits.max_file_size,
            max_url_length: limits.max_url_length,
        }
    }

    fn resolver_for(&self, url: &Url) -> Option<&dyn LinkResolver> {
        self.resolvers
            .iter()
            .find(|r| r.handles(url))
            .map(|r| r.as_ref())
    }

    /// HEAD the URL to learn the size and post-redirect location
    ///
    /// Some hosts reject HEAD; failures fall through to the GET.
    async fn probe(&self, url: &str, headers: &[(String, String)]) -> (Option<u64>, Option<Url>) {
        let mut request = self.client.head(url);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                let size = response.content_length();
                let final_url = response.url().clone();
                (size, Some(final_url))
            }
            Ok(response) => {
                tracing::debug!(url, status = %response.status(), "HEAD probe rejected");
                (None, None)
            }
            Err(e) => {
                tracing::debug!(url, error = %e, "HEAD probe failed, proceeding with GET");
                (None, None)
            }
        }
    }

    async fn download(
        &self,
        url: &str,
        headers: &[(String, String)],
        dest_path: &Path,
        label: &str,
        declared_size: Option<u64>,
        cancel: &CancellationToken,
        progress: &FetchProgressFn,
    ) -> Result<u64, SourceFetchError> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| request_failed(label, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceFetchError::RequestFailed {
                origin: label.to_string(),
                reason: format!("HTTP status {status}"),
                // Client errors like 404 won't fix themselves; server errors
                // and rate limits might
                retryable: status.is_server_error()
                    || status == reqwest::StatusCode::TOO_MANY_REQUESTS,
            });
        }

        let total = response.content_length().or(declared_size);
        if let Some(total) = total
            && total > self.max_file_size
        {
            return Err(SourceFetchError::TooLarge {
                origin: label.to_string(),
                size: total,
                limit: self.max_file_size,
            });
        }

        let mut file = tokio::fs::File::create(dest_path)
            .await
            .map_err(|e| io_failed(label, &e))?;
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;

        loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                _ = cancel.cancelled() => {
                    drop(file);
                    remove_partial(dest_path).await;
                    return Err(SourceFetchError::RequestFailed {
                        origin: label.to_string(),
                        reason: "cancelled".to_string(),
                        retryable: false,
                    });
                }
            };

            let Some(chunk) = chunk else { break };
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    drop(file);
                    remove_partial(dest_path).await;
                    return Err(request_failed(label, e));
                }
            };

            downloaded += chunk.len() as u64;
            if downloaded > self.max_file_size {
                drop(file);
                remove_partial(dest_path).await;
                return Err(SourceFetchError::TooLarge {
                    origin: label.to_string(),
                    size: downloaded,
                    limit: self.max_file_size,
                });
            }

            if let Err(e) = file.write_all(&chunk).await {
                drop(file);
                remove_partial(dest_path).await;
                return Err(io_failed(label, &e));
            }

            progress(downloaded, total);
        }

        file.flush().await.map_err(|e| io_failed(label, &e))?;
        drop(file);

        if let Some(expected) = total
            && downloaded != expected
        {
            remove_partial(dest_path).await;
            return Err(SourceFetchError::SizeMismatch {
                origin: label.to_string(),
                expected,
                actual: downloaded,
            });
        }

        Ok(downloaded)
    }
}

fn request_failed(label: &str, e: reqwest::Error) -> SourceFetchError {
    SourceFetchError::RequestFailed {
        origin: label.to_string(),
        reason: e.to_string(),
        retryable: e.is_timeout() || e.is_connect() || e.is_body() || e.is_request(),
    }
}

fn io_failed(label: &str, e: &std::io::Error) -> SourceFetchError {
    SourceFetchError::RequestFailed {
        origin: label.to_string(),
        reason: format!("I/O error: {e}"),
        retryable: false,
    }
}

async fn remove_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial download");
    }
}

/// Pick a destination path that doesn't collide with earlier fetches
fn unique_dest(dest_dir: &Path, filename: &str) -> PathBuf {
    let candidate = dest_dir.join(filename);
    if !candidate.exists() {
        return candidate;
    }

    let (stem, ext) = match filename.rsplit_once('.') {
        Some((stem, ext)) => (stem.to_string(), format!(".{ext}")),
        None => (filename.to_string(), String::new()),
    };

    for n in 1.. {
        let candidate = dest_dir.join(format!("{stem}_{n}{ext}"));
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!()
}

#[async_trait]
impl SourceFetcher for HttpSourceFetcher {
    fn supports(&self, source: &Source) -> bool {
        matches!(source, Source::DirectUrl { .. } | Source::HostedLink { .. })
    }

    async fn fetch(
        &self,
        source: &Source,
        dest_dir: &Path,
        cancel: &CancellationToken,
        progress: &FetchProgressFn,
    ) -> Result<FetchedFile, SourceFetchError> {
        let (raw_url, password) = match source {
            Source::DirectUrl { url } => (url.as_str(), None),
            Source::HostedLink { url, password } => (url.as_str(), password.as_deref()),
            Source::FileRef { reference } => {
                return Err(SourceFetchError::Unsupported(reference.clone()));
            }
        };

        let url = super::validate_url(raw_url, self.max_url_length)?;
        let label = raw_url.to_string();

        // Resolve hosting links to a direct URL first
        let resolved: Option<ResolvedLink> = match source {
            Source::HostedLink { .. } => {
                let resolver = self.resolver_for(&url).ok_or_else(|| {
                    SourceFetchError::Unsupported(format!("no resolver for host in '{raw_url}'"))
                })?;
                Some(resolver.resolve(raw_url, password).await?)
            }
            _ => None,
        };

        let (direct_url, headers, resolved_name, resolved_size) = match &resolved {
            Some(r) => (
                r.url.as_str(),
                r.headers.as_slice(),
                r.filename.clone(),
                r.size,
            ),
            None => (raw_url, &[] as &[(String, String)], None, None),
        };

        let (probed_size, final_url) = self.probe(direct_url, headers).await;
        let declared_size = probed_size.or(resolved_size);

        // Fail before transferring anything if the host already told us the
        // file is over the cap
        if let Some(size) = declared_size
            && size > self.max_file_size
        {
            return Err(SourceFetchError::TooLarge {
                origin: label,
                size,
                limit: self.max_file_size,
            });
        }

        let filename = match resolved_name.map(|n| super::sanitize_filename(&n)) {
            Some(name) if name.len() >= 5 && name.contains('.') => name,
            _ => {
                let name_url = final_url.as_ref().unwrap_or(&url);
                super::filename_from_url(name_url)
            }
        };
        let dest_path = unique_dest(dest_dir, &filename);

        tracing::debug!(
            url = label,
            dest = %dest_path.display(),
            size = ?declared_size,
            "Starting source download"
        );

        let size = self
            .download(
                direct_url,
                headers,
                &dest_path,
                &label,
                declared_size,
                cancel,
                progress,
            )
            .await?;

        Ok(FetchedFile {
            path: dest_path,
            size,
        })
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::IsRetryable;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher() -> HttpSourceFetcher {
        HttpSourceFetcher::with_resolvers(
            reqwest::Client::new(),
            Vec::new(),
            &LimitsConfig::default(),
        )
    }

    fn small_limit_fetcher(max_file_size: u64) -> HttpSourceFetcher {
        HttpSourceFetcher::with_resolvers(
            reqwest::Client::new(),
            Vec::new(),
            &LimitsConfig {
                max_file_size,
                ..Default::default()
            },
        )
    }

    fn no_progress() -> Box<FetchProgressFn> {
        Box::new(|_, _| {})
    }

    #[tokio::test]
    async fn downloads_direct_url_to_disk() {
        let server = MockServer::start().await;
        let body = vec![7u8; 4096];

        Mock::given(method("GET"))
            .and(path("/videos/part1.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let source = Source::DirectUrl {
            url: format!("{}/videos/part1.mp4", server.uri()),
        };

        let fetched = fetcher()
            .fetch(
                &source,
                dir.path(),
                &CancellationToken::new(),
                &*no_progress(),
            )
            .await
            .unwrap();

        assert_eq!(fetched.size, 4096);
        assert!(fetched.path.file_name().unwrap().to_str().unwrap().contains("part1"));
        assert_eq!(std::fs::read(&fetched.path).unwrap(), body);
    }

    #[tokio::test]
    async fn reports_progress_with_total() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 1000]))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let progress = move |downloaded: u64, total: Option<u64>| {
            seen_clone.lock().unwrap().push((downloaded, total));
        };

        fetcher()
            .fetch(
                &Source::DirectUrl {
                    url: format!("{}/a.mp4", server.uri()),
                },
                dir.path(),
                &CancellationToken::new(),
                &progress,
            )
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        let (last_downloaded, last_total) = *seen.last().unwrap();
        assert_eq!(last_downloaded, 1000);
        assert_eq!(last_total, Some(1000));
    }

    #[tokio::test]
    async fn not_found_is_permanent_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone.mp4"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky.mp4"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();

        let err = fetcher()
            .fetch(
                &Source::DirectUrl {
                    url: format!("{}/gone.mp4", server.uri()),
                },
                dir.path(),
                &CancellationToken::new(),
                &*no_progress(),
            )
            .await
            .unwrap_err();
        assert!(!err.is_retryable(), "404 must not be retried");

        let err = fetcher()
            .fetch(
                &Source::DirectUrl {
                    url: format!("{}/flaky.mp4", server.uri()),
                },
                dir.path(),
                &CancellationToken::new(),
                &*no_progress(),
            )
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "503 should be retried");
    }

    #[tokio::test]
    async fn oversized_file_is_rejected_and_removed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/big.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 2048]))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let err = small_limit_fetcher(1024)
            .fetch(
                &Source::DirectUrl {
                    url: format!("{}/big.mp4", server.uri()),
                },
                dir.path(),
                &CancellationToken::new(),
                &*no_progress(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SourceFetchError::TooLarge { .. }), "got: {err}");
        assert_eq!(
            std::fs::read_dir(dir.path()).unwrap().count(),
            0,
            "no partial file may remain"
        );
    }

    #[tokio::test]
    async fn pre_cancelled_token_aborts_without_leftovers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 65536]))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fetcher()
            .fetch(
                &Source::DirectUrl {
                    url: format!("{}/a.mp4", server.uri()),
                },
                dir.path(),
                &cancel,
                &*no_progress(),
            )
            .await
            .unwrap_err();

        assert!(err.to_string().contains("cancelled"), "got: {err}");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn file_refs_are_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let err = fetcher()
            .fetch(
                &Source::FileRef {
                    reference: "file-123".to_string(),
                },
                dir.path(),
                &CancellationToken::new(),
                &*no_progress(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SourceFetchError::Unsupported(_)));
    }

    #[tokio::test]
    async fn colliding_filenames_get_a_suffix() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/part1.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 16]))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let source = Source::DirectUrl {
            url: format!("{}/part1.mp4", server.uri()),
        };
        let f = fetcher();

        let first = f
            .fetch(&source, dir.path(), &CancellationToken::new(), &*no_progress())
            .await
            .unwrap();
        let second = f
            .fetch(&source, dir.path(), &CancellationToken::new(), &*no_progress())
            .await
            .unwrap();

        assert_ne!(first.path, second.path);
        assert!(first.path.exists() && second.path.exists());
    }

    #[tokio::test]
    async fn generic_paths_fall_back_without_colliding() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/download"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 8]))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/file"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![2u8; 8]))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let f = fetcher();

        // Both paths are too generic to trust, so both fall back to the
        // generated name and must still land in distinct files
        let first = f
            .fetch(
                &Source::DirectUrl {
                    url: format!("{}/download", server.uri()),
                },
                dir.path(),
                &CancellationToken::new(),
                &*no_progress(),
            )
            .await
            .unwrap();
        let second = f
            .fetch(
                &Source::DirectUrl {
                    url: format!("{}/file", server.uri()),
                },
                dir.path(),
                &CancellationToken::new(),
                &*no_progress(),
            )
            .await
            .unwrap();

        assert_ne!(first.path, second.path);
        assert_eq!(std::fs::read(&first.path).unwrap(), vec![1u8; 8]);
        assert_eq!(std::fs::read(&second.path).unwrap(), vec![2u8; 8]);
    }

    #[test]
    fn supports_urls_but_not_file_refs() {
        let f = fetcher();
        assert!(f.supports(&Source::DirectUrl {
            url: "https://example.com/a.mp4".to_string()
        }));
        assert!(f.supports(&Source::HostedLink {
            url: "https://gofile.io/d/abc".to_string(),
            password: None
        }));
        assert!(!f.supports(&Source::FileRef {
            reference: "x".to_string()
        }));
    }
}
