//! The backend cache store and registry-cache invalidation.
//!
//! The backend registry keeps Redis-side caches of its own: blob existence
//! entries, per-repository blob associations, and in-progress upload size
//! counters. Those caches outlive deletions (docker/distribution#2094), so
//! after a collection run they would keep reporting deleted content as
//! present. [`CacheInvalidator`] drops all three key families; a failure
//! there is fatal to the run because stale entries surface to users as
//! phantom blobs.
//!
//! The same store also backs the run lease (see [`crate::lock`]), which is
//! why [`CacheStore`] carries the two small key-guard operations next to
//! pattern deletion.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fn_error_context::context;
use log::debug;
use tokio::time::timeout;

/// Blob existence cache entries, e.g. `blobs::sha256:1a6f...`.
pub const BLOB_KEY_PATTERN: &str = "blobs::*";
/// Per-repository blob association entries,
/// e.g. `repository::library/hello-world::blobs::sha256:4ab4...`.
pub const REPOSITORY_KEY_PATTERN: &str = "repository::*";
/// In-progress upload size counters, e.g. `upload:fbd2...:size`.
pub const UPLOAD_SIZE_KEY_PATTERN: &str = "upload:*:size";

/// The key families the backend registry caches under.
pub const REGISTRY_KEY_PATTERNS: [&str; 3] = [
    BLOB_KEY_PATTERN,
    REPOSITORY_KEY_PATTERN,
    UPLOAD_SIZE_KEY_PATTERN,
];

/// Time allowed to establish a cache-store connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Time allowed for a read command (SCAN pages can be slow on big keyspaces).
pub const READ_TIMEOUT: Duration = Duration::from_secs(70);
/// Time allowed for a write command.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// A key-value cache store supporting pattern deletion and guarded keys.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Delete every key matching a glob pattern; returns the number of
    /// keys removed.
    async fn delete_matching(&self, pattern: &str) -> Result<u64>;

    /// Set `key` to `value` with a time-to-live, only if the key does not
    /// exist. Returns whether the key was set.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Delete `key` only if it currently holds `value`. Returns whether a
    /// key was deleted.
    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool>;
}

/// Redis-backed [`CacheStore`].
///
/// Every command is bounded by an explicit timeout so a wedged cache store
/// cannot hang a collection run indefinitely.
pub struct RedisCacheStore {
    client: redis::Client,
}

impl RedisCacheStore {
    /// Create a store for the given connection URL
    /// (e.g. `redis://cache:6379/1`). Validates the URL; connections are
    /// established lazily per command.
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("parsing cache store url")?;
        Ok(Self { client })
    }

    async fn connect(&self) -> Result<redis::aio::MultiplexedConnection> {
        let conn = timeout(
            CONNECT_TIMEOUT,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .context("connecting to cache store timed out")?
        .context("connecting to cache store")?;
        Ok(conn)
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn delete_matching(&self, pattern: &str) -> Result<u64> {
        let mut conn = self.connect().await?;

        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = timeout(
                READ_TIMEOUT,
                redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(pattern)
                    .arg("COUNT")
                    .arg(100)
                    .query_async(&mut conn),
            )
            .await
            .with_context(|| format!("scanning keys matching {pattern} timed out"))?
            .with_context(|| format!("scanning keys matching {pattern}"))?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        let mut removed = 0u64;
        for key in &keys {
            let deleted: u64 = timeout(
                WRITE_TIMEOUT,
                redis::cmd("DEL").arg(key).query_async(&mut conn),
            )
            .await
            .with_context(|| format!("deleting cache key {key} timed out"))?
            .with_context(|| format!("deleting cache key {key}"))?;
            removed += deleted;
        }
        Ok(removed)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connect().await?;
        let reply: Option<String> = timeout(
            WRITE_TIMEOUT,
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .query_async(&mut conn),
        )
        .await
        .with_context(|| format!("setting cache key {key} timed out"))?
        .with_context(|| format!("setting cache key {key}"))?;
        Ok(reply.is_some())
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool> {
        // GET/compare/DEL must be atomic or an expired-and-reacquired key
        // could be deleted out from under its new holder.
        let script = redis::Script::new(
            r"if redis.call('get', KEYS[1]) == ARGV[1] then
                  return redis.call('del', KEYS[1])
              else
                  return 0
              end",
        );
        let mut conn = self.connect().await?;
        let removed: i64 = timeout(
            WRITE_TIMEOUT,
            script.key(key).arg(value).invoke_async(&mut conn),
        )
        .await
        .with_context(|| format!("releasing cache key {key} timed out"))?
        .with_context(|| format!("releasing cache key {key}"))?;
        Ok(removed > 0)
    }
}

/// Drops the backend registry's cached views of deleted content.
pub struct CacheInvalidator {
    store: Arc<dyn CacheStore>,
}

impl CacheInvalidator {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    /// Delete every key in the three registry cache families; returns the
    /// total number of keys removed.
    #[context("Cleaning registry cache")]
    pub async fn purge_registry_keys(&self) -> Result<u64> {
        let mut removed = 0;
        for pattern in REGISTRY_KEY_PATTERNS {
            let count = self
                .store
                .delete_matching(pattern)
                .await
                .with_context(|| format!("deleting cache keys matching {pattern}"))?;
            debug!("removed {count} cache keys matching {pattern}");
            removed += count;
        }
        Ok(removed)
    }
}
