//! Cluster-wide lease used to serialize booth advances.
//!
//! The lease is a store key holding a random owner token with a short TTL.
//! Acquisition never waits: a held lease is reported as
//! [`BoothError::AdvanceInProgress`] and the caller decides whether to retry.
//! Extend and release are owner-checked so a holder whose lease already
//! expired cannot clobber the next holder.

use super::StateStore;
use crate::errors::BoothError;
use ring::rand::{SecureRandom, SystemRandom};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Named lease with TTL.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn StateStore>,
    key: String,
    ttl: Duration,
}

/// Proof of holding the lease. Release it with [`DistributedLock::release`].
#[derive(Debug)]
pub struct LeaseGuard {
    owner: String,
}

impl DistributedLock {
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            key: key.into(),
            ttl,
        }
    }

    /// Try once to take the lease.
    ///
    /// # Errors
    ///
    /// `AdvanceInProgress` if someone else holds it, `Store` on I/O failure.
    pub async fn acquire(&self) -> Result<LeaseGuard, BoothError> {
        let owner = owner_token()?;
        if self.store.acquire_lease(&self.key, &owner, self.ttl).await? {
            debug!(target: "booth.scheduler", lease = %self.key, "Lease acquired");
            Ok(LeaseGuard { owner })
        } else {
            Err(BoothError::AdvanceInProgress)
        }
    }

    /// Renew the TTL of a held lease.
    ///
    /// # Errors
    ///
    /// `AdvanceInProgress` if the lease expired and was taken over meanwhile.
    pub async fn extend(&self, guard: &LeaseGuard) -> Result<(), BoothError> {
        if self
            .store
            .extend_lease(&self.key, &guard.owner, self.ttl)
            .await?
        {
            Ok(())
        } else {
            Err(BoothError::AdvanceInProgress)
        }
    }

    /// Give the lease back. Failure only logs; the TTL cleans up.
    pub async fn release(&self, guard: LeaseGuard) {
        match self.store.release_lease(&self.key, &guard.owner).await {
            Ok(true) => {
                debug!(target: "booth.scheduler", lease = %self.key, "Lease released");
            }
            Ok(false) => {
                warn!(
                    target: "booth.scheduler",
                    lease = %self.key,
                    "Lease expired before release"
                );
            }
            Err(e) => {
                warn!(
                    target: "booth.scheduler",
                    lease = %self.key,
                    error = %e,
                    "Failed to release lease, letting it expire"
                );
            }
        }
    }
}

fn owner_token() -> Result<String, BoothError> {
    let mut bytes = [0u8; 16];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| BoothError::Internal("system RNG unavailable".to_string()))?;
    Ok(hex::encode(bytes))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn lock(store: &Arc<MemoryStore>) -> DistributedLock {
        DistributedLock::new(
            Arc::clone(store) as Arc<dyn StateStore>,
            "booth:advancing",
            Duration::from_millis(2000),
        )
    }

    #[tokio::test]
    async fn test_second_acquire_fails_fast() {
        let store = Arc::new(MemoryStore::new());
        let a = lock(&store);
        let b = lock(&store);

        let guard = a.acquire().await.unwrap();
        assert!(matches!(
            b.acquire().await,
            Err(BoothError::AdvanceInProgress)
        ));

        a.release(guard).await;
        assert!(b.acquire().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_keeps_lease_past_original_ttl() {
        let store = Arc::new(MemoryStore::new());
        let a = lock(&store);
        let b = lock(&store);

        let guard = a.acquire().await.unwrap();
        tokio::time::advance(Duration::from_millis(1500)).await;
        a.extend(&guard).await.unwrap();
        tokio::time::advance(Duration::from_millis(1500)).await;

        assert!(b.acquire().await.is_err(), "extended lease still held");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_holder_cannot_extend_or_release() {
        let store = Arc::new(MemoryStore::new());
        let a = lock(&store);
        let b = lock(&store);

        let stale = a.acquire().await.unwrap();
        tokio::time::advance(Duration::from_millis(2500)).await;
        let fresh = b.acquire().await.unwrap();

        assert!(matches!(
            a.extend(&stale).await,
            Err(BoothError::AdvanceInProgress)
        ));
        a.release(stale).await;
        // b still holds it.
        assert!(b.extend(&fresh).await.is_ok());
    }
}
