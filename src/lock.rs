//! Run-exclusivity lease.
//!
//! Two collection runs against the same registry must never overlap: both
//! would select the same candidates and race each other's status
//! transitions and backend deletions. The empty-trash short-circuit in the
//! orchestrator absorbs most duplicate triggers, but it is a heuristic, not
//! an exclusion guarantee. So a run first takes a TTL'd lease in the cache
//! store and releases it on the way out.
//!
//! The lease value is a random token and release is compare-and-delete, so
//! a run that outlives its TTL cannot delete the lease a newer run has
//! since acquired. The TTL bounds how long a crashed run can block its
//! successors.

use std::time::Duration;

use anyhow::Result;
use rand::{distr::Alphanumeric, Rng};

use crate::cache::CacheStore;

/// Cache key under which the lease lives.
pub const LEASE_KEY: &str = "registry:gc:lease";

/// How long a lease lasts if its holder never releases it. Generous enough
/// for a large run; a crashed run blocks the schedule for at most this long.
pub const LEASE_TTL: Duration = Duration::from_secs(30 * 60);

const TOKEN_LEN: usize = 32;

/// An acquired run lease. Must be explicitly [released](RunLease::release).
#[derive(Debug)]
pub struct RunLease {
    token: String,
}

impl RunLease {
    /// Try to acquire the lease. Returns `None` when another holder has it.
    pub async fn acquire(store: &dyn CacheStore, ttl: Duration) -> Result<Option<Self>> {
        let token: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LEN)
            .map(char::from)
            .collect();
        if store.set_if_absent(LEASE_KEY, &token, ttl).await? {
            Ok(Some(Self { token }))
        } else {
            Ok(None)
        }
    }

    /// Release the lease. Returns `false` when the lease had already
    /// expired (and possibly been re-acquired by someone else): the token
    /// no longer matched, so nothing was deleted.
    pub async fn release(self, store: &dyn CacheStore) -> Result<bool> {
        store.delete_if_equals(LEASE_KEY, &self.token).await
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCacheStore;

    #[tokio::test]
    async fn lease_is_exclusive() {
        let store = MemoryCacheStore::new();
        let lease = RunLease::acquire(&store, LEASE_TTL).await.unwrap().unwrap();
        assert!(RunLease::acquire(&store, LEASE_TTL).await.unwrap().is_none());
        assert!(lease.release(&store).await.unwrap());
        assert!(RunLease::acquire(&store, LEASE_TTL).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_release_does_not_steal_newer_lease() {
        let store = MemoryCacheStore::new();
        let stale = RunLease::acquire(&store, Duration::from_millis(0))
            .await
            .unwrap()
            .unwrap();
        // TTL of zero: the lease is immediately expired and free to take.
        let fresh = RunLease::acquire(&store, LEASE_TTL).await.unwrap().unwrap();
        assert!(!stale.release(&store).await.unwrap());
        assert!(fresh.release(&store).await.unwrap());
    }
}
