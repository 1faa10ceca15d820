//! Source fetching: URL validation, hosting-link resolution, and streaming
//! downloads into a task's working directory.
//!
//! The [`SourceFetcher`] trait is the seam between the orchestrator and the
//! outside world: the built-in [`HttpSourceFetcher`] covers direct URLs and
//! resolvable hosting links, while embedders register their own fetcher for
//! platform file references.

mod http;
mod resolver;

pub use http::HttpSourceFetcher;
pub use resolver::{GofileResolver, LinkResolver, ResolvedLink};

use crate::error::SourceFetchError;
use crate::types::Source;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Browser-like User-Agent; some hosts reject the default reqwest one
pub(crate) const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Extensions rejected at validation time
const DANGEROUS_EXTENSIONS: &[&str] = &[".exe", ".bat", ".cmd", ".scr", ".pif", ".sh", ".bin"];

/// A successfully fetched input, ready for the merge stage
#[derive(Debug, Clone)]
pub struct FetchedFile {
    /// Where the file was written
    pub path: PathBuf,
    /// Size on disk in bytes
    pub size: u64,
}

/// Byte-level progress callback: (bytes downloaded so far, total if known)
pub type FetchProgressFn = dyn Fn(u64, Option<u64>) + Send + Sync;

/// Downloads one source into a destination directory
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Whether this fetcher can handle the given source
    fn supports(&self, source: &Source) -> bool;

    /// Fetch the source into `dest_dir`
    ///
    /// Implementations must observe `cancel` between chunks and remove any
    /// partial file before returning an error or on cancellation.
    async fn fetch(
        &self,
        source: &Source,
        dest_dir: &Path,
        cancel: &CancellationToken,
        progress: &FetchProgressFn,
    ) -> Result<FetchedFile, SourceFetchError>;
}

/// Validate a source URL before any network traffic
///
/// Rejects overlong URLs, non-http(s) schemes, and paths ending in an
/// executable extension.
pub fn validate_url(raw: &str, max_length: usize) -> Result<Url, SourceFetchError> {
    if raw.is_empty() {
        return Err(SourceFetchError::InvalidUrl {
            url: raw.to_string(),
            reason: "URL is empty".to_string(),
        });
    }

    if raw.len() > max_length {
        return Err(SourceFetchError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("URL length exceeds maximum allowed ({max_length} characters)"),
        });
    }

    let url = Url::parse(raw).map_err(|e| SourceFetchError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(SourceFetchError::InvalidUrl {
            url: raw.to_string(),
            reason: "URL scheme must be http or https".to_string(),
        });
    }

    if url.host_str().is_none() {
        return Err(SourceFetchError::InvalidUrl {
            url: raw.to_string(),
            reason: "URL must have a host".to_string(),
        });
    }

    let path = url.path().to_lowercase();
    if DANGEROUS_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        return Err(SourceFetchError::InvalidUrl {
            url: raw.to_string(),
            reason: "potentially dangerous file type in URL path".to_string(),
        });
    }

    Ok(url)
}

/// Derive a safe local filename from a URL
///
/// Decodes percent-escapes, strips filesystem-hostile characters, and falls
/// back to a generic name when the path yields nothing usable. Collisions
/// between sources are resolved by the fetcher when picking the final path.
pub fn filename_from_url(url: &Url) -> String {
    let raw = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or("");
    let decoded = urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string());

    let sanitized = sanitize_filename(&decoded);

    // Too short or too generic to be trusted
    let lowered = sanitized.to_lowercase();
    if sanitized.len() < 5 || matches!(lowered.as_str(), "download" | "file" | "index") {
        return "source.mp4".to_string();
    }

    // No extension means the merge engine can't guess the container
    if !sanitized.contains('.') {
        return format!("{sanitized}.mp4");
    }

    truncate_filename(sanitized, 200)
}

/// Replace filesystem-hostile characters and strip control characters
fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            other => other,
        })
        .collect();

    replaced.trim_matches(|c: char| c == ' ' || c == '.').to_string()
}

/// Cap a filename's length, preserving its extension
fn truncate_filename(name: String, max_len: usize) -> String {
    if name.len() <= max_len {
        return name;
    }

    match name.rfind('.') {
        Some(dot) if name.len() - dot < max_len => {
            let ext = &name[dot..];
            let keep = max_len - ext.len();
            let mut stem: String = name.chars().take(keep).collect();
            stem.push_str(ext);
            stem
        }
        _ => name.chars().take(max_len).collect(),
    }
}
