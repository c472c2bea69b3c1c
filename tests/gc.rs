//! End-to-end collection runs against the in-memory backends.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use similar_asserts::assert_eq;

use registry_gc::digest::Digest;
use registry_gc::gc::{GarbageCollector, GcDeps, GcSummary};
use registry_gc::job::JobContext;
use registry_gc::lock::{RunLease, LEASE_TTL};
use registry_gc::memory::{MemoryCacheStore, MemoryRegistry, MemoryStore};
use registry_gc::model::{Blob, BlobStatus, DOCKER_MANIFEST};
use registry_gc::store::{ArtifactStore, TrashStore};

struct Harness {
    store: Arc<MemoryStore>,
    backend: Arc<MemoryRegistry>,
    cache: Arc<MemoryCacheStore>,
    collector: GarbageCollector,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(MemoryRegistry::new());
    let cache = Arc::new(MemoryCacheStore::new());
    let collector = GarbageCollector::new(GcDeps {
        artifacts: store.clone(),
        trash: store.clone(),
        blobs: store.clone(),
        projects: store.clone(),
        registry: backend.clone(),
        distribution: backend.clone(),
        cache: cache.clone(),
    });
    Harness {
        store,
        backend,
        cache,
        collector,
    }
}

fn params() -> serde_json::Value {
    json!({ "redis_url_reg": "redis://cache:6379/1" })
}

/// A blob old enough to clear the default push grace period.
fn aged(mut blob: Blob) -> Blob {
    blob.created = Utc::now() - Duration::hours(48);
    blob
}

fn manifest_blob(seed: &[u8], size: i64) -> Blob {
    aged(Blob::new(Digest::sha256_of(seed), size, DOCKER_MANIFEST))
}

fn layer_blob(seed: &[u8], size: i64) -> Blob {
    aged(Blob::new(
        Digest::sha256_of(seed),
        size,
        "application/octet-stream",
    ))
}

/// Seed one pushed artifact: rows in the metadata store, content and a
/// revision link on the backend. Returns the artifact id.
fn seed_artifact(
    h: &Harness,
    project: i64,
    repository: &str,
    tags: &[&str],
    manifest: &Blob,
    layers: &[&Blob],
) -> i64 {
    h.store.put_blob(manifest.clone());
    h.backend.put_blob(&manifest.digest);
    h.backend.link_manifest(repository, &manifest.digest);
    let mut referenced = Vec::new();
    for layer in layers {
        h.store.put_blob((*layer).clone());
        h.backend.put_blob(&layer.digest);
        referenced.push(layer.digest.clone());
    }
    h.store
        .push_artifact(project, repository, tags, &manifest.digest, &referenced)
}

async fn delete_artifact(h: &Harness, artifact: i64) {
    ArtifactStore::delete(&*h.store, artifact).await.unwrap();
}

async fn run(h: &Harness) -> anyhow::Result<GcSummary> {
    let (ctx, _stop) = JobContext::new();
    h.collector.run(&ctx, &params()).await
}

#[tokio::test]
async fn deleted_artifact_is_fully_reclaimed() {
    let h = harness();
    let project = h.store.add_project("library");
    let manifest = manifest_blob(b"manifest-a", 100);
    let layer = layer_blob(b"layer-a", 512);
    let artifact = seed_artifact(&h, project, "library/app", &["v1"], &manifest, &[&layer]);
    h.cache.put("blobs::sha256:stale", "1");
    h.cache
        .put("repository::library/app::blobs::sha256:stale", "1");
    h.cache.put("upload:f00d:size", "42");

    delete_artifact(&h, artifact).await;
    assert_eq!(h.store.trash_rows().len(), 1);

    let summary = run(&h).await.unwrap();

    assert_eq!(
        summary,
        GcSummary {
            blobs_marked: 1,
            manifests_marked: 1,
            blobs_deleted: 1,
            manifests_deleted: 1,
            bytes_freed: 612,
            projects_cleaned: 1,
            cache_keys_removed: 3,
            trash_flushed: true,
            ..GcSummary::default()
        }
    );
    assert!(!h.backend.has_blob(&manifest.digest));
    assert!(!h.backend.has_blob(&layer.digest));
    assert!(!h.backend.revision_exists("library/app", &manifest.digest));
    assert_eq!(
        h.backend.v2_deletes(),
        vec![("library/app".to_owned(), manifest.digest.clone())]
    );
    assert_eq!(h.store.blob_count(), 0);
    assert!(h.store.trash_rows().is_empty());
    assert!(h.cache.keys().is_empty());
}

#[tokio::test]
async fn second_run_with_no_new_deletions_is_a_no_op() {
    let h = harness();
    let project = h.store.add_project("library");
    let manifest = manifest_blob(b"manifest-b", 100);
    let artifact = seed_artifact(&h, project, "library/app", &["v1"], &manifest, &[]);
    delete_artifact(&h, artifact).await;

    let first = run(&h).await.unwrap();
    assert_eq!(first.manifests_deleted, 1);
    let attempts = h.backend.blob_delete_attempts().len();

    let second = run(&h).await.unwrap();
    assert!(second.no_op);
    assert_eq!(second.blobs_deleted + second.manifests_deleted, 0);
    assert_eq!(h.backend.blob_delete_attempts().len(), attempts);
}

#[tokio::test]
async fn blob_shared_with_a_live_artifact_is_never_a_candidate() {
    let h = harness();
    let project = h.store.add_project("library");
    let shared = layer_blob(b"shared-layer", 256);
    let kept_manifest = manifest_blob(b"kept-manifest", 100);
    let doomed_manifest = manifest_blob(b"doomed-manifest", 100);
    seed_artifact(&h, project, "library/kept", &["v1"], &kept_manifest, &[&shared]);
    let doomed = seed_artifact(
        &h,
        project,
        "library/doomed",
        &["v1"],
        &doomed_manifest,
        &[&shared],
    );

    delete_artifact(&h, doomed).await;
    let summary = run(&h).await.unwrap();

    // only the doomed manifest went away; the shared layer is still live
    assert_eq!(summary.manifests_deleted, 1);
    assert_eq!(summary.blobs_deleted, 0);
    assert!(h.backend.has_blob(&shared.digest));
    assert!(h.store.blob(&shared.digest).is_some());
    assert_eq!(
        h.store.blob(&shared.digest).unwrap().status,
        BlobStatus::None
    );
}

#[tokio::test]
async fn removing_one_of_two_tags_keeps_the_blob_referenced() {
    let h = harness();
    let project = h.store.add_project("library");
    let manifest = manifest_blob(b"twice-tagged", 100);
    let artifact = seed_artifact(&h, project, "library/app", &["v1", "v2"], &manifest, &[]);

    // the tag-deletion path removes v1; the artifact stays live under v2
    h.store.remove_tag(artifact, "v1");

    // an unrelated deletion so the run has trash to process
    let other = manifest_blob(b"other", 50);
    let other_artifact = seed_artifact(&h, project, "library/other", &["v1"], &other, &[]);
    delete_artifact(&h, other_artifact).await;

    let summary = run(&h).await.unwrap();

    assert_eq!(summary.manifests_deleted, 1);
    assert!(h.backend.has_blob(&manifest.digest));
    assert!(h.store.blob(&manifest.digest).is_some());
}

#[tokio::test]
async fn failed_backend_delete_leaves_delete_failed_and_is_retried() {
    let h = harness();
    let project = h.store.add_project("library");
    let manifest = manifest_blob(b"manifest-c", 100);
    let layer = layer_blob(b"layer-c", 512);
    let artifact = seed_artifact(&h, project, "library/app", &["v1"], &manifest, &[&layer]);
    h.backend.fail_blob_delete(&layer.digest);

    delete_artifact(&h, artifact).await;
    let first = run(&h).await.unwrap();

    assert_eq!(first.delete_failed, 1);
    assert_eq!(first.manifests_deleted, 1);
    let stuck = h.store.blob(&layer.digest).unwrap();
    assert_eq!(stuck.status, BlobStatus::DeleteFailed);
    assert!(h.backend.has_blob(&layer.digest));

    // next cycle: the backend recovered and a new deletion produces trash
    h.backend.clear_blob_delete_failures();
    let other = manifest_blob(b"other-c", 50);
    let other_artifact = seed_artifact(&h, project, "library/other", &["v1"], &other, &[]);
    delete_artifact(&h, other_artifact).await;

    let second = run(&h).await.unwrap();
    assert_eq!(second.blobs_deleted, 1);
    assert!(h.store.blob(&layer.digest).is_none());
    assert!(!h.backend.has_blob(&layer.digest));
}

#[tokio::test]
async fn failed_row_removal_downgrades_to_delete_failed() {
    let h = harness();
    let project = h.store.add_project("library");
    let manifest = manifest_blob(b"manifest-r", 100);
    let layer = layer_blob(b"layer-r", 512);
    let artifact = seed_artifact(&h, project, "library/app", &["v1"], &manifest, &[&layer]);
    h.store.fail_row_delete(&layer.digest);

    delete_artifact(&h, artifact).await;
    let summary = run(&h).await.unwrap();

    // content is gone but the row could not be removed; it must not stay
    // `Deleting`
    assert_eq!(summary.delete_failed, 1);
    assert!(!h.backend.has_blob(&layer.digest));
    assert_eq!(
        h.store.blob(&layer.digest).unwrap().status,
        BlobStatus::DeleteFailed
    );
}

#[tokio::test]
async fn unhealthy_backend_aborts_before_any_mutation() {
    let h = harness();
    let project = h.store.add_project("library");
    let manifest = manifest_blob(b"manifest-d", 100);
    let artifact = seed_artifact(&h, project, "library/app", &["v1"], &manifest, &[]);
    delete_artifact(&h, artifact).await;
    h.backend.set_healthy(false);

    assert!(run(&h).await.is_err());

    assert_eq!(
        h.store.blob(&manifest.digest).unwrap().status,
        BlobStatus::None
    );
    assert!(h.backend.has_blob(&manifest.digest));
    assert_eq!(h.store.trash_rows().len(), 1);
}

#[tokio::test]
async fn cache_cleanup_failure_fails_the_run_but_keeps_the_trash() {
    let h = harness();
    let project = h.store.add_project("library");
    let manifest = manifest_blob(b"manifest-e", 100);
    let artifact = seed_artifact(&h, project, "library/app", &["v1"], &manifest, &[]);
    delete_artifact(&h, artifact).await;
    h.cache.fail_pattern_deletes(true);

    assert!(run(&h).await.is_err());
    // the crash point is after physical deletion but before the flush
    assert_eq!(h.store.trash_rows().len(), 1);

    // recovery: the next run sees the same trash, finds nothing left to
    // delete, and completes the interrupted bookkeeping
    h.cache.fail_pattern_deletes(false);
    let summary = run(&h).await.unwrap();
    assert!(summary.trash_flushed);
    assert!(!summary.no_op);
    assert_eq!(summary.blobs_deleted + summary.manifests_deleted, 0);
    assert!(h.store.trash_rows().is_empty());
}

#[tokio::test]
async fn untagged_artifacts_are_swept_in_the_same_run() {
    let h = harness();
    let project = h.store.add_project("library");
    let manifest = manifest_blob(b"untagged-m", 100);
    seed_artifact(&h, project, "library/app", &[], &manifest, &[]);

    // no pre-existing trash: the sweep itself must feed the run
    let summary = run(&h).await.unwrap();

    assert_eq!(summary.untagged_deleted, 1);
    assert_eq!(summary.manifests_deleted, 1);
    assert!(h.store.blob(&manifest.digest).is_none());
    assert!(!h.backend.has_blob(&manifest.digest));
}

#[tokio::test]
async fn untagged_sweep_can_be_disabled() {
    let h = harness();
    let project = h.store.add_project("library");
    let manifest = manifest_blob(b"untagged-n", 100);
    let artifact = seed_artifact(&h, project, "library/app", &[], &manifest, &[]);

    let (ctx, _stop) = JobContext::new();
    let summary = h
        .collector
        .run(
            &ctx,
            &json!({
                "redis_url_reg": "redis://cache:6379/1",
                "delete_untagged": false,
            }),
        )
        .await
        .unwrap();

    assert!(summary.no_op);
    assert_eq!(summary.untagged_deleted, 0);
    // the untagged artifact was not moved to trash and its blob survives
    assert!(h.store.trash_rows().is_empty());
    assert!(h.store.blob(&manifest.digest).is_some());
    assert!(h.backend.has_blob(&manifest.digest));
    assert!(h.store.artifact(artifact).is_some());
}

#[tokio::test]
async fn fresh_blobs_are_protected_by_the_grace_period() {
    let h = harness();
    let project = h.store.add_project("library");
    // created just now, within the default two-hour grace period
    let manifest = Blob::new(Digest::sha256_of(b"fresh-m"), 100, DOCKER_MANIFEST);
    h.store.put_blob(manifest.clone());
    h.backend.put_blob(&manifest.digest);
    h.backend.link_manifest("library/app", &manifest.digest);
    let artifact = h
        .store
        .push_artifact(project, "library/app", &["v1"], &manifest.digest, &[]);
    delete_artifact(&h, artifact).await;

    let summary = run(&h).await.unwrap();

    assert_eq!(summary.manifests_marked, 0);
    assert!(h.store.blob(&manifest.digest).is_some());
    assert!(h.backend.has_blob(&manifest.digest));
}

#[tokio::test]
async fn manifest_links_are_removed_for_every_repository() {
    let h = harness();
    let project = h.store.add_project("library");
    let manifest = manifest_blob(b"multi-repo", 100);
    let first = seed_artifact(&h, project, "library/alpha", &["v1"], &manifest, &[]);
    // same digest pushed under a second repository
    h.backend.link_manifest("library/beta", &manifest.digest);
    let second = h
        .store
        .push_artifact(project, "library/beta", &["v1"], &manifest.digest, &[]);

    delete_artifact(&h, first).await;
    delete_artifact(&h, second).await;
    let summary = run(&h).await.unwrap();

    assert_eq!(summary.manifests_deleted, 1);
    let mut deletions = h.backend.v2_deletes();
    deletions.sort();
    assert_eq!(
        deletions,
        vec![
            ("library/alpha".to_owned(), manifest.digest.clone()),
            ("library/beta".to_owned(), manifest.digest.clone()),
        ]
    );
    assert!(!h.backend.revision_exists("library/alpha", &manifest.digest));
    assert!(!h.backend.revision_exists("library/beta", &manifest.digest));
}

#[tokio::test]
async fn concurrent_trigger_loses_the_lease_and_does_nothing() {
    let h = harness();
    let project = h.store.add_project("library");
    let manifest = manifest_blob(b"leased", 100);
    let artifact = seed_artifact(&h, project, "library/app", &["v1"], &manifest, &[]);
    delete_artifact(&h, artifact).await;

    let held = RunLease::acquire(&*h.cache, LEASE_TTL).await.unwrap().unwrap();
    let summary = run(&h).await.unwrap();
    assert!(summary.no_op);
    assert!(h.backend.has_blob(&manifest.digest));
    assert_eq!(h.store.trash_rows().len(), 1);

    held.release(&*h.cache).await.unwrap();
    let summary = run(&h).await.unwrap();
    assert_eq!(summary.manifests_deleted, 1);
}

#[tokio::test]
async fn dry_run_reports_without_mutating() {
    let h = harness();
    let project = h.store.add_project("library");
    let manifest = manifest_blob(b"dry-m", 100);
    let layer = layer_blob(b"dry-l", 512);
    let artifact = seed_artifact(&h, project, "library/app", &["v1"], &manifest, &[&layer]);
    delete_artifact(&h, artifact).await;

    let (ctx, _stop) = JobContext::new();
    let summary = h
        .collector
        .run(
            &ctx,
            &json!({
                "redis_url_reg": "redis://cache:6379/1",
                "dry_run": true,
            }),
        )
        .await
        .unwrap();

    assert!(summary.dry_run);
    assert_eq!(summary.manifests_marked, 1);
    assert_eq!(summary.blobs_marked, 1);
    assert_eq!(summary.bytes_freed, 612);
    assert!(!summary.trash_flushed);
    // nothing moved
    assert_eq!(h.store.blob(&manifest.digest).unwrap().status, BlobStatus::None);
    assert_eq!(h.store.blob(&layer.digest).unwrap().status, BlobStatus::None);
    assert!(h.backend.has_blob(&manifest.digest));
    assert_eq!(h.store.trash_rows().len(), 1);
    assert!(h.backend.v2_deletes().is_empty());

    // a real run afterwards collects the same candidates
    let summary = run(&h).await.unwrap();
    assert_eq!(summary.manifests_deleted, 1);
    assert_eq!(summary.blobs_deleted, 1);
}

#[tokio::test]
async fn stop_signal_before_start_aborts_cleanly() {
    let h = harness();
    let project = h.store.add_project("library");
    let manifest = manifest_blob(b"stopped", 100);
    let artifact = seed_artifact(&h, project, "library/app", &["v1"], &manifest, &[]);
    delete_artifact(&h, artifact).await;

    let (ctx, stop) = JobContext::new();
    stop.stop();
    let summary = h.collector.run(&ctx, &params()).await.unwrap();

    assert!(summary.aborted);
    assert!(h.backend.has_blob(&manifest.digest));
    assert_eq!(h.store.trash_rows().len(), 1);
    assert_eq!(
        h.store.blob(&manifest.digest).unwrap().status,
        BlobStatus::None
    );
}

#[tokio::test]
async fn statuses_only_move_forward_across_runs() {
    let h = harness();
    let project = h.store.add_project("library");
    let manifest = manifest_blob(b"mono-m", 100);
    let layer = layer_blob(b"mono-l", 512);
    let artifact = seed_artifact(&h, project, "library/app", &["v1"], &manifest, &[&layer]);
    h.backend.fail_blob_delete(&layer.digest);
    delete_artifact(&h, artifact).await;

    run(&h).await.unwrap();
    assert_eq!(
        h.store.blob(&layer.digest).unwrap().status,
        BlobStatus::DeleteFailed
    );

    // the only way back is the explicit re-mark on a later run
    h.backend.clear_blob_delete_failures();
    let filler = manifest_blob(b"mono-filler", 10);
    let filler_artifact = seed_artifact(&h, project, "library/filler", &["v1"], &filler, &[]);
    delete_artifact(&h, filler_artifact).await;

    run(&h).await.unwrap();
    // retried to completion: the row is gone
    assert!(h.store.blob(&layer.digest).is_none());
}

#[tokio::test]
async fn trash_rows_survive_until_candidates_are_marked() {
    let h = harness();
    let project = h.store.add_project("library");
    let manifest = manifest_blob(b"ordering", 100);
    let artifact = seed_artifact(&h, project, "library/app", &["v1"], &manifest, &[]);
    delete_artifact(&h, artifact).await;

    // trash is only consumed by a completed run
    let rows_before = TrashStore::filter(&*h.store).await.unwrap();
    assert_eq!(rows_before.len(), 1);

    let summary = run(&h).await.unwrap();
    assert!(summary.trash_flushed);
    assert!(TrashStore::filter(&*h.store).await.unwrap().is_empty());
}
