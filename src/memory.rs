//! In-memory backends.
//!
//! A complete set of in-process implementations of the store and backend
//! traits: a metadata store, a registry backend, and a cache store. They
//! exist for tests and for embedding the collector in environments where a
//! real database/backend is not available, and they support targeted
//! failure injection so error paths can be exercised deterministically.
//!
//! All state lives behind plain mutexes; nothing here performs I/O.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as TimeDelta, Utc};

use crate::cache::CacheStore;
use crate::digest::Digest;
use crate::model::{Artifact, ArtifactTrash, Blob, BlobStatus, Project};
use crate::registry::{BackendGcResult, DistributionApi, RegistryControl, RegistryError};
use crate::store::{ArtifactStore, BlobStore, ProjectStore, TrashStore};

/// Match a redis-style glob pattern (only `*` is supported, which is all
/// the registry cache key families use).
fn glob_match(pattern: &str, input: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == input;
    }
    let mut rest = input;
    if !rest.starts_with(parts[0]) {
        return false;
    }
    rest = &rest[parts[0].len()..];
    let last = parts[parts.len() - 1];
    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match rest.find(part) {
            Some(at) => rest = &rest[at + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

#[derive(Default)]
struct MetadataState {
    next_id: i64,
    artifacts: HashMap<i64, Artifact>,
    /// artifact id -> digests of the manifest blob and everything it
    /// references (layers, config).
    artifact_blobs: HashMap<i64, HashSet<Digest>>,
    trash: Vec<ArtifactTrash>,
    blobs: HashMap<Digest, Blob>,
    /// project id -> digests associated with the project.
    project_blobs: HashMap<i64, HashSet<Digest>>,
    projects: Vec<Project>,
    repositories: HashMap<String, i64>,
    fail_row_deletes: HashSet<Digest>,
}

impl MetadataState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory metadata database implementing every store trait.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MetadataState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MetadataState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a project; returns its id.
    pub fn add_project(&self, name: &str) -> i64 {
        let mut state = self.state();
        let id = state.next_id();
        state.projects.push(Project {
            id,
            name: name.to_owned(),
        });
        id
    }

    /// Insert a blob row. An id of zero is replaced with a fresh one.
    /// Returns the row id.
    pub fn put_blob(&self, mut blob: Blob) -> i64 {
        let mut state = self.state();
        if blob.id == 0 {
            blob.id = state.next_id();
        }
        let id = blob.id;
        state.blobs.insert(blob.digest.clone(), blob);
        id
    }

    /// Record a pushed artifact: the manifest blob plus the blobs it
    /// references, all associated with the artifact and its project.
    /// Returns the artifact id.
    pub fn push_artifact(
        &self,
        project_id: i64,
        repository_name: &str,
        tags: &[&str],
        manifest: &Digest,
        referenced: &[Digest],
    ) -> i64 {
        let mut state = self.state();
        let manifest_media_type = state
            .blobs
            .get(manifest)
            .map(|blob| blob.content_type.clone())
            .unwrap_or_else(|| crate::model::DOCKER_MANIFEST.to_owned());
        let repository_id = match state.repositories.get(repository_name) {
            Some(id) => *id,
            None => {
                let id = state.next_id();
                state.repositories.insert(repository_name.to_owned(), id);
                id
            }
        };
        let id = state.next_id();
        state.artifacts.insert(
            id,
            Artifact {
                id,
                project_id,
                repository_id,
                repository_name: repository_name.to_owned(),
                digest: manifest.clone(),
                artifact_type: "IMAGE".to_owned(),
                media_type: manifest_media_type.clone(),
                manifest_media_type,
                tags: tags.iter().map(|tag| (*tag).to_owned()).collect(),
            },
        );
        let mut digests: HashSet<Digest> = referenced.iter().cloned().collect();
        digests.insert(manifest.clone());
        state
            .project_blobs
            .entry(project_id)
            .or_default()
            .extend(digests.iter().cloned());
        state.artifact_blobs.insert(id, digests);
        id
    }

    /// Remove one tag from an artifact (the tag-deletion path; the
    /// artifact itself stays live).
    pub fn remove_tag(&self, artifact_id: i64, tag: &str) {
        let mut state = self.state();
        if let Some(artifact) = state.artifacts.get_mut(&artifact_id) {
            artifact.tags.retain(|existing| existing != tag);
        }
    }

    /// Make the next `BlobStore::delete` of this digest's row fail.
    pub fn fail_row_delete(&self, digest: &Digest) {
        self.state().fail_row_deletes.insert(digest.clone());
    }

    /// Current live artifact row, if any.
    pub fn artifact(&self, artifact_id: i64) -> Option<Artifact> {
        self.state().artifacts.get(&artifact_id).cloned()
    }

    /// Current row for a digest, if any.
    pub fn blob(&self, digest: &Digest) -> Option<Blob> {
        self.state().blobs.get(digest).cloned()
    }

    pub fn blob_count(&self) -> usize {
        self.state().blobs.len()
    }

    /// Snapshot of the trash table (test inspection).
    pub fn trash_rows(&self) -> Vec<ArtifactTrash> {
        self.state().trash.clone()
    }

    /// Digests currently associated with a project, sorted.
    pub fn project_blob_digests(&self, project_id: i64) -> Vec<Digest> {
        let state = self.state();
        let mut digests: Vec<Digest> = state
            .project_blobs
            .get(&project_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        digests.sort();
        digests
    }
}

#[async_trait]
impl TrashStore for MemoryStore {
    async fn filter(&self) -> Result<Vec<ArtifactTrash>> {
        Ok(self.state().trash.clone())
    }

    async fn flush(&self) -> Result<()> {
        self.state().trash.clear();
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn list_untagged(&self) -> Result<Vec<Artifact>> {
        let state = self.state();
        let mut untagged: Vec<Artifact> = state
            .artifacts
            .values()
            .filter(|artifact| artifact.is_untagged())
            .cloned()
            .collect();
        untagged.sort_by_key(|artifact| artifact.id);
        Ok(untagged)
    }

    async fn delete(&self, artifact_id: i64) -> Result<()> {
        let mut state = self.state();
        let Some(artifact) = state.artifacts.remove(&artifact_id) else {
            bail!("artifact {artifact_id} does not exist");
        };
        state.artifact_blobs.remove(&artifact_id);
        let id = state.next_id();
        state.trash.push(ArtifactTrash {
            id,
            artifact_id,
            artifact_type: artifact.artifact_type,
            media_type: artifact.media_type,
            manifest_media_type: artifact.manifest_media_type,
            project_id: artifact.project_id,
            repository_id: artifact.repository_id,
            repository_name: artifact.repository_name,
            digest: artifact.digest,
        });
        Ok(())
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn useless_blobs(&self, cutoff: DateTime<Utc>) -> Result<Vec<Blob>> {
        let state = self.state();
        let referenced: HashSet<&Digest> = state.artifact_blobs.values().flatten().collect();
        let mut candidates: Vec<Blob> = state
            .blobs
            .values()
            .filter(|blob| {
                !referenced.contains(&blob.digest)
                    && blob.status.is_selectable()
                    && blob.created <= cutoff
            })
            .cloned()
            .map(|mut blob| {
                blob.repositories.clear();
                blob
            })
            .collect();
        candidates.sort_by(|a, b| a.digest.cmp(&b.digest));
        Ok(candidates)
    }

    async fn update_blob_status(
        &self,
        digest: &Digest,
        from: BlobStatus,
        to: BlobStatus,
    ) -> Result<u64> {
        let mut state = self.state();
        let Some(blob) = state.blobs.get_mut(digest) else {
            return Ok(0);
        };
        if blob.status != from || !from.can_transition_to(to) {
            return Ok(0);
        }
        blob.status = to;
        Ok(1)
    }

    async fn delete(&self, blob_id: i64) -> Result<()> {
        let mut state = self.state();
        let Some(digest) = state
            .blobs
            .values()
            .find(|blob| blob.id == blob_id)
            .map(|blob| blob.digest.clone())
        else {
            bail!("blob row {blob_id} does not exist");
        };
        if state.fail_row_deletes.contains(&digest) {
            bail!("injected failure deleting blob row {digest}");
        }
        state.blobs.remove(&digest);
        Ok(())
    }

    async fn list_by_project(&self, project_id: i64) -> Result<Vec<Blob>> {
        let state = self.state();
        let mut blobs: Vec<Blob> = state
            .project_blobs
            .get(&project_id)
            .map(|digests| {
                digests
                    .iter()
                    .filter_map(|digest| state.blobs.get(digest).cloned())
                    .collect()
            })
            .unwrap_or_default();
        blobs.sort_by(|a, b| a.digest.cmp(&b.digest));
        Ok(blobs)
    }

    async fn cleanup_associations_for_project(
        &self,
        project_id: i64,
        blobs: Vec<Blob>,
    ) -> Result<()> {
        let mut state = self.state();
        let referenced: HashSet<Digest> = state
            .artifacts
            .values()
            .filter(|artifact| artifact.project_id == project_id)
            .filter_map(|artifact| state.artifact_blobs.get(&artifact.id))
            .flatten()
            .cloned()
            .collect();
        let MetadataState {
            blobs: blob_rows,
            project_blobs,
            ..
        } = &mut *state;
        if let Some(associated) = project_blobs.get_mut(&project_id) {
            for blob in &blobs {
                if !referenced.contains(&blob.digest) {
                    associated.remove(&blob.digest);
                }
            }
            // associations whose blob row is already gone are dangling
            associated.retain(|digest| blob_rows.contains_key(digest));
        }
        Ok(())
    }
}

#[async_trait]
impl ProjectStore for MemoryStore {
    async fn list(&self, page: u32, page_size: u32) -> Result<Vec<Project>> {
        let state = self.state();
        let mut projects = state.projects.clone();
        projects.sort_by_key(|project| project.id);
        let start = (page.saturating_sub(1) as usize) * page_size as usize;
        Ok(projects
            .into_iter()
            .skip(start)
            .take(page_size as usize)
            .collect())
    }
}

#[derive(Default)]
struct BackendState {
    unhealthy: bool,
    blobs: HashSet<Digest>,
    revisions: HashSet<(String, Digest)>,
    fail_blob_deletes: HashSet<Digest>,
    v2_deletes: Vec<(String, Digest)>,
    blob_delete_attempts: Vec<Digest>,
}

/// In-memory registry backend implementing both client traits, with
/// injectable outages and per-digest deletion failures.
#[derive(Default)]
pub struct MemoryRegistry {
    state: Mutex<BackendState>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store blob content on the backend.
    pub fn put_blob(&self, digest: &Digest) {
        self.state().blobs.insert(digest.clone());
    }

    /// Create a per-repository manifest revision link.
    pub fn link_manifest(&self, repository: &str, digest: &Digest) {
        self.state()
            .revisions
            .insert((repository.to_owned(), digest.clone()));
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.state().unhealthy = !healthy;
    }

    /// Make `delete_blob` fail for this digest.
    pub fn fail_blob_delete(&self, digest: &Digest) {
        self.state().fail_blob_deletes.insert(digest.clone());
    }

    /// Let previously failing blob deletions succeed again.
    pub fn clear_blob_delete_failures(&self) {
        self.state().fail_blob_deletes.clear();
    }

    pub fn has_blob(&self, digest: &Digest) -> bool {
        self.state().blobs.contains(digest)
    }

    pub fn revision_exists(&self, repository: &str, digest: &Digest) -> bool {
        self.state()
            .revisions
            .contains(&(repository.to_owned(), digest.clone()))
    }

    /// Recorded v2 manifest deletions, in call order.
    pub fn v2_deletes(&self) -> Vec<(String, Digest)> {
        self.state().v2_deletes.clone()
    }

    /// Recorded blob deletion attempts, in call order.
    pub fn blob_delete_attempts(&self) -> Vec<Digest> {
        self.state().blob_delete_attempts.clone()
    }
}

#[async_trait]
impl RegistryControl for MemoryRegistry {
    async fn health(&self) -> Result<(), RegistryError> {
        if self.state().unhealthy {
            return Err(RegistryError::Unavailable("injected backend outage".into()));
        }
        Ok(())
    }

    async fn delete_blob(&self, digest: &Digest) -> Result<(), RegistryError> {
        let mut state = self.state();
        state.blob_delete_attempts.push(digest.clone());
        if state.fail_blob_deletes.contains(digest) {
            return Err(RegistryError::Unavailable(format!(
                "injected failure deleting blob {digest}"
            )));
        }
        if !state.blobs.remove(digest) {
            return Err(RegistryError::NotFound(format!("blob {digest}")));
        }
        Ok(())
    }

    async fn delete_manifest(
        &self,
        repository: &str,
        digest: &Digest,
    ) -> Result<(), RegistryError> {
        let mut state = self.state();
        if state.revisions.remove(&(repository.to_owned(), digest.clone())) {
            Ok(())
        } else {
            Err(RegistryError::NotFound(format!(
                "manifest {repository}@{digest}"
            )))
        }
    }

    async fn start_gc(&self) -> Result<BackendGcResult, RegistryError> {
        Ok(BackendGcResult {
            status: true,
            ..BackendGcResult::default()
        })
    }
}

#[async_trait]
impl DistributionApi for MemoryRegistry {
    async fn delete_manifest(
        &self,
        repository: &str,
        digest: &Digest,
    ) -> Result<(), RegistryError> {
        // Missing manifests are "already gone", so this records the call
        // and always succeeds.
        self.state()
            .v2_deletes
            .push((repository.to_owned(), digest.clone()));
        Ok(())
    }
}

struct CacheEntry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    fail_pattern_deletes: bool,
}

/// In-memory [`CacheStore`] with TTL support and glob pattern deletion.
#[derive(Default)]
pub struct MemoryCacheStore {
    state: Mutex<CacheState>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();
        state
            .entries
            .retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));
        state
    }

    /// Seed a key without expiry.
    pub fn put(&self, key: &str, value: &str) {
        self.state().entries.insert(
            key.to_owned(),
            CacheEntry {
                value: value.to_owned(),
                expires_at: None,
            },
        );
    }

    /// Make `delete_matching` fail (simulated cache-store outage).
    pub fn fail_pattern_deletes(&self, fail: bool) {
        self.state().fail_pattern_deletes = fail;
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state().entries.contains_key(key)
    }

    /// All live keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state().entries.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn delete_matching(&self, pattern: &str) -> Result<u64> {
        let mut state = self.state();
        if state.fail_pattern_deletes {
            bail!("cache store unavailable");
        }
        let before = state.entries.len();
        state.entries.retain(|key, _| !glob_match(pattern, key));
        Ok((before - state.entries.len()) as u64)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state();
        if state.entries.contains_key(key) {
            return Ok(false);
        }
        let ttl = TimeDelta::from_std(ttl).unwrap_or_else(|_| TimeDelta::days(36500));
        state.entries.insert(
            key.to_owned(),
            CacheEntry {
                value: value.to_owned(),
                expires_at: Some(Utc::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool> {
        let mut state = self.state();
        if state.entries.get(key).is_some_and(|entry| entry.value == value) {
            state.entries.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}
