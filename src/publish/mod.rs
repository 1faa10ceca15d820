//! Publishing the merged artifact to destinations.
//!
//! Each destination is an independent delivery target; the orchestrator
//! fans the artifact out to every registered destination and the task
//! succeeds if at least one delivery lands.

mod gofile;

pub use gofile::GofileDestination;

use crate::error::DestinationError;
use async_trait::async_trait;
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// A delivery target for merged artifacts
///
/// Destinations declare their own capability limits via [`accepts`]: a
/// chat-upload destination capped at 2 GiB simply refuses larger artifacts
/// instead of failing mid-upload, and the orchestrator records that refusal
/// as a hard per-destination failure.
///
/// [`accepts`]: Destination::accepts
#[async_trait]
pub trait Destination: Send + Sync {
    /// Stable name used as the artifact map key and in events
    fn name(&self) -> &str;

    /// Whether this destination can take an artifact of the given size
    fn accepts(&self, size: u64) -> bool;

    /// Deliver the artifact, returning a destination-specific reference
    /// (download link, message id, ...)
    async fn deliver(
        &self,
        artifact: &Path,
        cancel: &CancellationToken,
    ) -> Result<String, DestinationError>;
}
