//! The garbage-collection orchestrator.
//!
//! [`GarbageCollector::run`] sequences a full reclamation pass:
//!
//! 1. decode the job parameters and honor an early stop signal;
//! 2. probe the backend; an unreachable registry aborts the run before
//!    anything is touched;
//! 3. take the run lease (see [`crate::lock`]);
//! 4. sweep: move untagged artifacts to the trash (policy-controlled),
//!    then read all trash rows. **Empty trash short-circuits the run**:
//!    when several triggers fire close together, only the first one that
//!    sees trash does any work;
//! 5. select useless blobs and annotate manifests with their repositories;
//! 6. mark every candidate `Delete`;
//! 7. per blob: drop all per-repository manifest links (v2 API + revision
//!    link, fanned out and **awaited**), then `Delete -> Deleting`, delete
//!    the content, and either remove the row or mark `DeleteFailed`;
//! 8. drop stale per-project blob associations, one project at a time;
//! 9. purge the backend's registry caches; a failure here is fatal
//!    because stale existence caches surface as phantom blobs;
//! 10. flush the trash, release the lease.
//!
//! # Failure semantics
//!
//! Per-item failures (one blob, one repository link, one project, one
//! untagged artifact) are logged with their identifiers and skipped; the
//! affected rows stay in a re-selectable state and the next scheduled run
//! retries them. Only systemic failures (health probe, candidate
//! computation, cache cleanup, lease infrastructure) fail the job.
//!
//! # Ordering invariants
//!
//! The trash is flushed strictly after the mark pass, so a crash anywhere
//! in the middle of a run re-derives the same candidates on the next run.
//! A blob is never left in `Deleting` by any code path here: every failure
//! downgrades it to `DeleteFailed` before moving on.

use std::sync::Arc;

use anyhow::{Context, Result};
use fn_error_context::context;
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use crate::cache::{CacheInvalidator, CacheStore};
use crate::config::{GcParams, ParamsError};
use crate::job::JobContext;
use crate::lock::{RunLease, LEASE_TTL};
use crate::model::{ArtifactTrash, Blob, BlobStatus};
use crate::registry::{DistributionApi, RegistryControl};
use crate::select::UselessBlobSelector;
use crate::store::{ArtifactStore, BlobStore, ProjectStore, TrashStore};

/// Projects fetched per page during association cleanup.
pub const PROJECT_PAGE_SIZE: u32 = 50;

/// Concurrent per-repository manifest deletions per blob.
const MANIFEST_DELETE_CONCURRENCY: usize = 8;

/// Statistics from a collection run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcSummary {
    /// Non-manifest blobs marked eligible for deletion.
    pub blobs_marked: u64,
    /// Manifest blobs marked eligible for deletion.
    pub manifests_marked: u64,
    /// Non-manifest blobs whose content and row were removed.
    pub blobs_deleted: u64,
    /// Manifest blobs whose content and row were removed.
    pub manifests_deleted: u64,
    /// Bytes of content removed (or, in a dry run, that would be removed).
    pub bytes_freed: u64,
    /// Blobs left in `DeleteFailed` for the next run.
    pub delete_failed: u64,
    /// Blobs skipped because their status changed under us.
    pub status_conflicts: u64,
    /// Untagged artifacts moved to the trash by this run.
    pub untagged_deleted: u64,
    /// Projects whose stale blob associations were cleaned.
    pub projects_cleaned: u64,
    /// Registry cache keys removed.
    pub cache_keys_removed: u64,
    /// Whether the trash was flushed at the end of the run.
    pub trash_flushed: bool,
    /// Whether this was a report-only run.
    pub dry_run: bool,
    /// Whether an operator stop cut the run short.
    pub aborted: bool,
    /// Whether the run short-circuited without collecting anything.
    pub no_op: bool,
}

/// Collaborators of the collector, injected at construction.
pub struct GcDeps {
    pub artifacts: Arc<dyn ArtifactStore>,
    pub trash: Arc<dyn TrashStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub projects: Arc<dyn ProjectStore>,
    pub registry: Arc<dyn RegistryControl>,
    pub distribution: Arc<dyn DistributionApi>,
    pub cache: Arc<dyn CacheStore>,
}

/// The registry garbage collector.
///
/// Constructed once per process with all collaborators passed in; holds no
/// global state. One `run` per scheduler trigger.
pub struct GarbageCollector {
    artifacts: Arc<dyn ArtifactStore>,
    trash: Arc<dyn TrashStore>,
    blobs: Arc<dyn BlobStore>,
    projects: Arc<dyn ProjectStore>,
    registry: Arc<dyn RegistryControl>,
    distribution: Arc<dyn DistributionApi>,
    cache: Arc<dyn CacheStore>,
    selector: UselessBlobSelector,
    manifest_delete_limit: Arc<Semaphore>,
}

impl GarbageCollector {
    pub fn new(deps: GcDeps) -> Self {
        let selector = UselessBlobSelector::new(Arc::clone(&deps.blobs));
        Self {
            artifacts: deps.artifacts,
            trash: deps.trash,
            blobs: deps.blobs,
            projects: deps.projects,
            registry: deps.registry,
            distribution: deps.distribution,
            cache: deps.cache,
            selector,
            manifest_delete_limit: Arc::new(Semaphore::new(MANIFEST_DELETE_CONCURRENCY)),
        }
    }

    /// The job is not retried as a whole: a failed run leaves everything in
    /// a re-selectable state and the next *scheduled* run picks it up,
    /// while an immediate retry would race the thundering-herd guard.
    pub fn max_fails(&self) -> u32 {
        1
    }

    /// See [`max_fails`](Self::max_fails).
    pub fn should_retry(&self) -> bool {
        false
    }

    /// Check the parameter map without running anything.
    pub fn validate(&self, params: &Value) -> Result<(), ParamsError> {
        GcParams::from_value(params).map(|_| ())
    }

    /// Execute one collection run with scheduler-shaped parameters.
    #[context("Running registry garbage collection")]
    pub async fn run(&self, ctx: &JobContext, params: &Value) -> Result<GcSummary> {
        let params = GcParams::from_value(params)?;
        self.run_with(ctx, &params).await
    }

    /// Execute one collection run with already-validated parameters.
    pub async fn run_with(&self, ctx: &JobContext, params: &GcParams) -> Result<GcSummary> {
        let mut summary = GcSummary {
            dry_run: params.dry_run,
            ..GcSummary::default()
        };

        if ctx.is_stopped() {
            info!("received the stop signal before starting, quitting gc job");
            summary.aborted = true;
            return Ok(summary);
        }

        self.registry
            .health()
            .await
            .context("registry backend is unreachable, refusing to collect")?;

        let Some(lease) = RunLease::acquire(self.cache.as_ref(), LEASE_TTL)
            .await
            .context("acquiring the gc run lease")?
        else {
            info!("another gc run holds the lease, nothing to do");
            summary.no_op = true;
            return Ok(summary);
        };

        let outcome = self.run_locked(ctx, params, &mut summary).await;

        match lease.release(self.cache.as_ref()).await {
            Ok(true) => debug!("released the gc run lease"),
            Ok(false) => warn!("the gc run lease expired before release; the run outlived {LEASE_TTL:?}"),
            Err(err) => warn!("failed to release the gc run lease: {err:#}"),
        }

        outcome.map(|()| summary)
    }

    async fn run_locked(
        &self,
        ctx: &JobContext,
        params: &GcParams,
        summary: &mut GcSummary,
    ) -> Result<()> {
        info!("start to run gc job");

        let removed_artifacts = self
            .sweep_deleted_artifacts(params.delete_untagged, summary)
            .await
            .context("collecting deleted artifacts")?;
        if removed_artifacts.is_empty() {
            info!("no removed artifacts, nothing to collect");
            summary.no_op = true;
            return Ok(());
        }
        debug!("{} trash rows to process", removed_artifacts.len());

        let mut candidates = self
            .selector
            .useless_blobs(params.grace_period)
            .await
            .context("computing gc candidates")?;
        UselessBlobSelector::annotate_repositories(&removed_artifacts, &mut candidates);

        if params.dry_run {
            self.report_dry_run(&candidates, summary);
            return Ok(());
        }

        let marked = self.mark_candidates(candidates, summary).await;
        info!(
            "{} blobs and {} manifests eligible for deletion",
            summary.blobs_marked, summary.manifests_marked
        );

        for blob in &marked {
            if ctx.is_stopped() {
                warn!("received the stop signal, aborting gc; unprocessed blobs stay marked and are re-selected next run");
                summary.aborted = true;
                return Ok(());
            }
            self.reclaim_blob(blob, summary).await;
        }

        self.cleanup_untagged_associations(summary).await;

        let invalidator = CacheInvalidator::new(Arc::clone(&self.cache));
        summary.cache_keys_removed = invalidator
            .purge_registry_keys()
            .await
            .context("cleaning the registry cache")?;

        // Flushing any earlier would lose the ability to recompute the same
        // candidates after a crash; flushing is the last step of a clean run.
        match self.trash.flush().await {
            Ok(()) => {
                summary.trash_flushed = true;
                info!("flushed the artifact trash");
            }
            Err(err) => {
                error!("failed to flush the artifact trash, rows will be reprocessed next run: {err:#}");
            }
        }

        info!(
            "gc done: {} blobs and {} manifests deleted, {} bytes freed, {} delete-failed",
            summary.blobs_deleted, summary.manifests_deleted, summary.bytes_freed,
            summary.delete_failed
        );
        Ok(())
    }

    /// Move untagged artifacts into the trash (when the policy says so),
    /// then read all pending trash rows.
    ///
    /// The untagged sweep runs *before* the trash read on purpose: trash
    /// rows it creates are part of this run's candidate set.
    #[context("Sweeping deleted artifacts")]
    async fn sweep_deleted_artifacts(
        &self,
        delete_untagged: bool,
        summary: &mut GcSummary,
    ) -> Result<Vec<ArtifactTrash>> {
        if delete_untagged {
            let untagged = self
                .artifacts
                .list_untagged()
                .await
                .context("listing untagged artifacts")?;
            if !untagged.is_empty() {
                info!("start to delete {} untagged artifacts", untagged.len());
            }
            for artifact in untagged {
                if let Err(err) = self.artifacts.delete(artifact.id).await {
                    // this one is retried by the next run
                    error!(
                        "failed to delete untagged artifact {} ({} in project {}): {err:#}",
                        artifact.id, artifact.digest, artifact.project_id
                    );
                    continue;
                }
                debug!(
                    "deleted untagged artifact: project {}, repository {}, digest {}",
                    artifact.project_id, artifact.repository_name, artifact.digest
                );
                summary.untagged_deleted += 1;
            }
        }
        self.trash.filter().await.context("reading the artifact trash")
    }

    fn report_dry_run(&self, candidates: &[Blob], summary: &mut GcSummary) {
        for blob in candidates {
            info!(
                "dry run: would delete {} ({}, {} bytes)",
                blob.digest, blob.content_type, blob.size
            );
            if blob.is_manifest() {
                summary.manifests_marked += 1;
            } else {
                summary.blobs_marked += 1;
            }
            summary.bytes_freed += blob.size.max(0) as u64;
        }
        info!(
            "dry run: {} blobs and {} manifests would be deleted, freeing {} bytes",
            summary.blobs_marked, summary.manifests_marked, summary.bytes_freed
        );
    }

    /// Persist the `Delete` mark on every candidate; returns the ones that
    /// were actually marked (with their in-memory status updated to match).
    async fn mark_candidates(&self, candidates: Vec<Blob>, summary: &mut GcSummary) -> Vec<Blob> {
        let mut marked = Vec::with_capacity(candidates.len());
        for mut blob in candidates {
            match self
                .blobs
                .update_blob_status(&blob.digest, blob.status, BlobStatus::Delete)
                .await
            {
                Ok(0) => {
                    warn!(
                        "blob {} changed status concurrently, skipping it this run",
                        blob.digest
                    );
                    summary.status_conflicts += 1;
                }
                Ok(_) => {
                    debug!("blob eligible for deletion: {}", blob.digest);
                    blob.status = BlobStatus::Delete;
                    if blob.is_manifest() {
                        summary.manifests_marked += 1;
                    } else {
                        summary.blobs_marked += 1;
                    }
                    marked.push(blob);
                }
                Err(err) => {
                    error!(
                        "failed to mark gc candidate {}, skipping it: {err:#}",
                        blob.digest
                    );
                    summary.status_conflicts += 1;
                }
            }
        }
        marked
    }

    /// Physically reclaim one marked blob.
    ///
    /// Every failure path here either keeps the blob in `Delete` (status
    /// conflict) or downgrades it to `DeleteFailed`; nothing leaves
    /// `Deleting` behind, because a persistent `Deleting` row would be
    /// excluded from selection forever.
    async fn reclaim_blob(&self, blob: &Blob, summary: &mut GcSummary) {
        if blob.is_manifest() {
            self.delete_manifest_links(blob).await;
        }

        match self
            .blobs
            .update_blob_status(&blob.digest, BlobStatus::Delete, BlobStatus::Deleting)
            .await
        {
            Ok(0) => {
                warn!(
                    "blob {} is no longer marked for deletion, skipping it",
                    blob.digest
                );
                summary.status_conflicts += 1;
                return;
            }
            Ok(_) => {}
            Err(err) => {
                error!(
                    "failed to mark blob {} as deleting, skipping it: {err:#}",
                    blob.digest
                );
                summary.status_conflicts += 1;
                return;
            }
        }

        debug!("delete blob from storage: {}", blob.digest);
        let content_gone = match self.registry.delete_blob(&blob.digest).await {
            Ok(()) => true,
            Err(err) if err.is_not_found() => {
                // a previous run got this far before dying
                debug!("blob {} already absent from the backend", blob.digest);
                true
            }
            Err(err) => {
                error!(
                    "failed to delete blob {} from storage: {err}",
                    blob.digest
                );
                false
            }
        };
        if !content_gone {
            self.mark_delete_failed(blob, summary).await;
            return;
        }

        if let Err(err) = self.blobs.delete(blob.id).await {
            error!(
                "blob {} deleted from the backend but its row could not be removed: {err:#}",
                blob.digest
            );
            self.mark_delete_failed(blob, summary).await;
            return;
        }

        if blob.is_manifest() {
            summary.manifests_deleted += 1;
        } else {
            summary.blobs_deleted += 1;
        }
        summary.bytes_freed += blob.size.max(0) as u64;
    }

    async fn mark_delete_failed(&self, blob: &Blob, summary: &mut GcSummary) {
        summary.delete_failed += 1;
        match self
            .blobs
            .update_blob_status(&blob.digest, BlobStatus::Deleting, BlobStatus::DeleteFailed)
            .await
        {
            Ok(0) => warn!(
                "blob {} left deleting by someone else while marking it delete-failed",
                blob.digest
            ),
            Ok(_) => {}
            Err(err) => error!(
                "failed to mark blob {} as delete-failed: {err:#}",
                blob.digest
            ),
        }
    }

    /// Remove every per-repository reference to a manifest.
    ///
    /// The metadata database does not know which tags exist on the backend,
    /// so the v2 API delete removes the manifest with all of its tags; the
    /// control client separately removes the repository's revision link on
    /// disk. Both are attempted for every repository, concurrently across
    /// repositories, and **all of them are awaited** before the caller
    /// proceeds to delete the manifest's content.
    async fn delete_manifest_links(&self, blob: &Blob) {
        let mut tasks: JoinSet<()> = JoinSet::new();
        for repository in blob.repositories.iter().cloned() {
            let digest = blob.digest.clone();
            let content_type = blob.content_type.clone();
            let distribution = Arc::clone(&self.distribution);
            let registry = Arc::clone(&self.registry);
            let limit = Arc::clone(&self.manifest_delete_limit);
            tasks.spawn(async move {
                let Ok(_permit) = limit.acquire_owned().await else {
                    return;
                };
                info!(
                    "delete manifest with the v2 api: repository {repository}, media type {content_type}, digest {digest}"
                );
                if let Err(err) = distribution.delete_manifest(&repository, &digest).await {
                    error!(
                        "failed to delete manifest {repository}@{digest} with the v2 api: {err}"
                    );
                }
                debug!("delete manifest revision link: repository {repository}, digest {digest}");
                match registry.delete_manifest(&repository, &digest).await {
                    Ok(()) => {}
                    Err(err) if err.is_not_found() => {
                        debug!("manifest revision {repository}@{digest} already absent");
                    }
                    Err(err) => {
                        error!(
                            "failed to remove manifest revision {repository}@{digest}: {err}"
                        );
                    }
                }
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!("manifest deletion task failed: {err}");
            }
        }
    }

    /// Drop per-project blob associations that no live artifact backs.
    ///
    /// Projects are fed through a small bounded channel one page at a time
    /// and consumed sequentially, so a full scan never piles concurrent
    /// per-project queries onto the store. A failing project is logged and
    /// the loop moves on; one project's bad state must not block the rest.
    async fn cleanup_untagged_associations(&self, summary: &mut GcSummary) {
        let (sender, mut receiver) = mpsc::channel(PROJECT_PAGE_SIZE as usize);
        let projects = Arc::clone(&self.projects);
        let producer = tokio::spawn(async move {
            let mut page = 1u32;
            loop {
                let batch = match projects.list(page, PROJECT_PAGE_SIZE).await {
                    Ok(batch) => batch,
                    Err(err) => {
                        error!("listing projects failed on page {page}: {err:#}");
                        return;
                    }
                };
                let fetched = batch.len();
                for project in batch {
                    if sender.send(project).await.is_err() {
                        return;
                    }
                }
                if fetched < PROJECT_PAGE_SIZE as usize {
                    return;
                }
                page += 1;
            }
        });

        while let Some(project) = receiver.recv().await {
            let all = match self.blobs.list_by_project(project.id).await {
                Ok(all) => all,
                Err(err) => {
                    error!(
                        "failed to list blobs of project {} ({}): {err:#}",
                        project.id, project.name
                    );
                    continue;
                }
            };
            if let Err(err) = self
                .blobs
                .cleanup_associations_for_project(project.id, all)
                .await
            {
                error!(
                    "failed to clean untagged blob associations of project {} ({}): {err:#}",
                    project.id, project.name
                );
                continue;
            }
            summary.projects_cleaned += 1;
        }

        if let Err(err) = producer.await {
            error!("project feed task failed: {err}");
        }
    }
}
