//! Metadata rows and the blob reclamation lifecycle.
//!
//! These are the shapes the collector reads from and writes to the metadata
//! database, via the traits in [`crate::store`]. The interesting part is
//! [`BlobStatus`]: a blob's status only ever moves forward through the
//! reclamation state machine, and every transition is persisted with a
//! compare-and-set so that a stale writer affects zero rows instead of
//! clobbering a newer state.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::digest::Digest;

/// Docker image manifest, schema 2.
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Docker manifest list ("fat manifest").
pub const DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
/// OCI image manifest.
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// OCI image index.
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Reclamation status of a blob row.
///
/// ```text
/// None ──mark──> Delete ──begin──> Deleting ──ok──> (row removed)
///                  │                  │
///                  └──revert──> None  └──fail──> DeleteFailed ──re-mark──> Delete
/// ```
///
/// A successful deletion removes the row entirely, so there is no `Deleted`
/// state. `DeleteFailed` rows are picked up again by the next run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum BlobStatus {
    /// Live, or at least not scheduled for anything.
    #[default]
    None,
    /// Selected as unreferenced and marked eligible for deletion.
    Delete,
    /// A backend content deletion is in flight.
    Deleting,
    /// The backend deletion (or the final row removal) failed; the row is
    /// kept for the next run to retry.
    DeleteFailed,
}

/// Error parsing a persisted status string.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown blob status {0:?}")]
pub struct UnknownStatus(pub String);

impl BlobStatus {
    /// The persisted representation.
    pub fn as_str(self) -> &'static str {
        match self {
            BlobStatus::None => "none",
            BlobStatus::Delete => "delete",
            BlobStatus::Deleting => "deleting",
            BlobStatus::DeleteFailed => "deletefailed",
        }
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    ///
    /// Self-transitions are permitted no-ops so that a retried update is
    /// idempotent rather than an error.
    pub fn can_transition_to(self, next: BlobStatus) -> bool {
        use BlobStatus::*;
        if self == next {
            return true;
        }
        match self {
            None => matches!(next, Delete),
            Delete => matches!(next, Deleting | None),
            Deleting => matches!(next, DeleteFailed),
            DeleteFailed => matches!(next, Delete | None),
        }
    }

    /// Whether a blob in this status may be picked as a deletion candidate.
    ///
    /// `None` is the normal case, `Delete` is a leftover from a run that
    /// died between marking and deleting, and `DeleteFailed` is the
    /// automatic-retry path. `Deleting` is deliberately excluded: the
    /// collector itself never leaves that status behind, so a row stuck
    /// there means something killed the process mid-statement and an
    /// operator should look at it.
    pub fn is_selectable(self) -> bool {
        matches!(
            self,
            BlobStatus::None | BlobStatus::Delete | BlobStatus::DeleteFailed
        )
    }
}

impl fmt::Display for BlobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(BlobStatus::None),
            "delete" => Ok(BlobStatus::Delete),
            "deleting" => Ok(BlobStatus::Deleting),
            "deletefailed" => Ok(BlobStatus::DeleteFailed),
            other => Err(UnknownStatus(other.to_owned())),
        }
    }
}

/// A content-addressed stored object: layer, config, or manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    /// Row id in the metadata database.
    pub id: i64,
    pub digest: Digest,
    /// Content size in bytes.
    pub size: i64,
    /// Media type of the content, e.g. a manifest or layer media type.
    pub content_type: String,
    pub status: BlobStatus,
    /// When the row was created. Used for the push grace period.
    pub created: DateTime<Utc>,
    /// Repository names believed to reference this digest.
    ///
    /// Derived at collection time by cross-referencing trash rows; never
    /// persisted. The blob table itself has no repository column, but
    /// manifest deletion must be issued once per repository because the
    /// backend keeps a revision link under each repository's path.
    pub repositories: Vec<String>,
}

impl Blob {
    /// A fresh, unpersisted blob row (id assigned by the store).
    pub fn new(digest: Digest, size: i64, content_type: impl Into<String>) -> Self {
        Self {
            id: 0,
            digest,
            size,
            content_type: content_type.into(),
            status: BlobStatus::None,
            created: Utc::now(),
            repositories: Vec::new(),
        }
    }

    /// Whether this blob stores a manifest (rather than a layer or config).
    pub fn is_manifest(&self) -> bool {
        matches!(
            self.content_type.as_str(),
            DOCKER_MANIFEST | DOCKER_MANIFEST_LIST | OCI_MANIFEST | OCI_INDEX
        )
    }
}

/// A pushed, tag-addressable unit: a manifest plus the blobs it references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub id: i64,
    pub project_id: i64,
    pub repository_id: i64,
    pub repository_name: String,
    pub digest: Digest,
    /// Kind of artifact, e.g. `IMAGE`.
    pub artifact_type: String,
    pub media_type: String,
    pub manifest_media_type: String,
    /// Tags currently pointing at this artifact; empty means untagged.
    pub tags: Vec<String>,
}

impl Artifact {
    pub fn is_untagged(&self) -> bool {
        self.tags.is_empty()
    }
}

/// Staging record of a logically-deleted artifact awaiting reclamation.
///
/// Written exactly once by the artifact-deletion path when an artifact
/// leaves the live table; read (and finally flushed) by the collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactTrash {
    pub id: i64,
    pub artifact_id: i64,
    /// Kind of the deleted artifact, e.g. `IMAGE`.
    pub artifact_type: String,
    pub media_type: String,
    pub manifest_media_type: String,
    pub project_id: i64,
    pub repository_id: i64,
    pub repository_name: String,
    pub digest: Digest,
}

/// A tenant namespace grouping repositories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub id: i64,
    pub name: String,
}
