//! Store traits: the narrow metadata-database contracts the collector runs
//! against.
//!
//! The collector never talks to the database directly; it consumes these
//! four interfaces, each deliberately small enough to implement over a real
//! database or over [`crate::memory::MemoryStore`] for tests and embedding.
//!
//! # Ownership
//!
//! During a run the collector is the sole writer of blob status transitions
//! (enforced by the run lease, see [`crate::lock`]). The stores still guard
//! every status write with a compare-and-set so that a stale or duplicate
//! writer affects zero rows rather than corrupting the lifecycle.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::digest::Digest;
use crate::model::{Artifact, ArtifactTrash, Blob, BlobStatus, Project};

/// Access to the artifact-trash staging table.
#[async_trait]
pub trait TrashStore: Send + Sync {
    /// All pending trash rows.
    async fn filter(&self) -> Result<Vec<ArtifactTrash>>;

    /// Clear the trash.
    ///
    /// Callers must only flush after the candidate blobs derived from these
    /// rows have been through the mark-for-delete pass; flushing earlier
    /// loses the ability to recompute candidates after a crash.
    async fn flush(&self) -> Result<()>;
}

/// The artifact-deletion collaborator.
///
/// `delete` is the same path the API uses: it moves the artifact out of the
/// live table, drops its blob associations, and writes exactly one trash
/// row. The collector only ever calls it for untagged artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Live artifacts with an empty tag set.
    async fn list_untagged(&self) -> Result<Vec<Artifact>>;

    /// Logically delete an artifact (moving it to trash).
    async fn delete(&self, artifact_id: i64) -> Result<()>;
}

/// Access to blob rows and their artifact/project associations.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Blobs with zero live artifact associations, created before `cutoff`,
    /// whose status permits selection (see [`BlobStatus::is_selectable`]).
    ///
    /// The returned blobs carry empty `repositories`; the selector fills
    /// them in from the trash rows.
    async fn useless_blobs(&self, cutoff: DateTime<Utc>) -> Result<Vec<Blob>>;

    /// Compare-and-set a blob's status.
    ///
    /// Returns the number of rows updated: zero when the blob's current
    /// status is not `from` or the lifecycle forbids `from -> to`, in which
    /// case the caller should skip the blob rather than force it.
    async fn update_blob_status(
        &self,
        digest: &Digest,
        from: BlobStatus,
        to: BlobStatus,
    ) -> Result<u64>;

    /// Remove a blob row entirely (after its content is gone).
    async fn delete(&self, blob_id: i64) -> Result<()>;

    /// All blobs associated with a project.
    async fn list_by_project(&self, project_id: i64) -> Result<Vec<Blob>>;

    /// Drop the project's associations to whichever of `blobs` are no
    /// longer referenced by any live artifact in that project.
    async fn cleanup_associations_for_project(
        &self,
        project_id: i64,
        blobs: Vec<Blob>,
    ) -> Result<()>;
}

/// Paginated access to projects.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// One page of projects; `page` is 1-based. A short page signals the
    /// end of the listing.
    async fn list(&self, page: u32, page_size: u32) -> Result<Vec<Project>>;
}
