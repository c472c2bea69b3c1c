//! Deletion-candidate selection.
//!
//! A blob is "useless" when no live artifact manifest references it: not
//! as a manifest, not as a layer, not as a config. The store answers that
//! question from its association tables; the selector adds the two pieces
//! the store cannot know:
//!
//! - the **grace period**: a blob pushed moments ago may belong to an
//!   in-flight push whose manifest has not been linked yet, so blobs
//!   younger than the cutoff are never candidates;
//! - the **repository names**: the blob table has no repository column, so
//!   manifest candidates are annotated from the trash rows that referenced
//!   their digest. A manifest historically reachable under several
//!   repository names needs a deletion issued for each one.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use fn_error_context::context;
use log::debug;

use crate::model::{ArtifactTrash, Blob};
use crate::store::BlobStore;

/// Computes the set of blobs eligible for deletion.
pub struct UselessBlobSelector {
    blobs: Arc<dyn BlobStore>,
}

impl UselessBlobSelector {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    /// Blobs with zero live references created more than `grace` ago.
    ///
    /// A zero grace period disables the age guard entirely.
    #[context("Computing useless blobs")]
    pub async fn useless_blobs(&self, grace: Duration) -> Result<Vec<Blob>> {
        let cutoff = Utc::now() - grace;
        let blobs = self.blobs.useless_blobs(cutoff).await?;
        debug!(
            "{} unreferenced blobs older than {}h are candidates",
            blobs.len(),
            grace.num_hours()
        );
        Ok(blobs)
    }

    /// Fill in each manifest candidate's repository list from the trash
    /// rows whose digest matches it.
    pub fn annotate_repositories(trash: &[ArtifactTrash], blobs: &mut [Blob]) {
        for blob in blobs.iter_mut() {
            if !blob.is_manifest() {
                continue;
            }
            for row in trash {
                if row.digest == blob.digest
                    && !blob.repositories.contains(&row.repository_name)
                {
                    blob.repositories.push(row.repository_name.clone());
                }
            }
        }
    }
}
