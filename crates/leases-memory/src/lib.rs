//! In-memory implementation of the relay lease registry.
//!
//! Clones share state, so a simulated cluster passes one store value to every
//! node. Expired leases behave as absent on every operation, and tests can
//! inject unavailability and latency to drive the transient-error paths.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod error;

pub use error::Error;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use relay_leases::{AcquireOutcome, Lease, LeaseStore, RefreshOutcome, ReleaseOutcome};
use relay_types::{ChannelName, LeadershipId, NodeId};
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Clone, Debug)]
struct StoredLease {
    leadership_id: LeadershipId,
    node_id: NodeId,
    deadline: Instant,
}

impl StoredLease {
    fn is_expired(&self, now: Instant) -> bool {
        self.deadline <= now
    }

    fn materialize(&self, channel: &ChannelName) -> Lease {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        Lease {
            channel: channel.clone(),
            leadership_id: self.leadership_id,
            node_id: self.node_id.clone(),
            expires_at: SystemTime::now() + remaining,
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: bool,
    fail_next: u32,
    latency: Option<Duration>,
}

#[derive(Debug, Default)]
struct OpCounts {
    acquires: u64,
    refreshes: u64,
    releases: u64,
    gets: u64,
}

/// An in-memory lease store.
#[derive(Clone, Debug, Default)]
pub struct MemoryLeaseStore {
    leases: Arc<Mutex<HashMap<ChannelName, StoredLease>>>,
    faults: Arc<Mutex<Faults>>,
    counts: Arc<Mutex<OpCounts>>,
}

impl MemoryLeaseStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent operation fail until cleared.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.faults.lock().await.unavailable = unavailable;
    }

    /// Fails the next `n` operations, then recovers.
    pub async fn fail_next(&self, n: u32) {
        self.faults.lock().await.fail_next = n;
    }

    /// Adds a fixed delay to every operation.
    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.faults.lock().await.latency = latency;
    }

    /// Number of `acquire` calls the store has served (including failures).
    pub async fn acquire_count(&self) -> u64 {
        self.counts.lock().await.acquires
    }

    /// Number of `refresh` calls the store has served (including failures).
    pub async fn refresh_count(&self) -> u64 {
        self.counts.lock().await.refreshes
    }

    /// Number of `release` calls the store has served (including failures).
    pub async fn release_count(&self) -> u64 {
        self.counts.lock().await.releases
    }

    async fn check_faults(&self) -> Result<(), Error> {
        let latency = {
            let mut faults = self.faults.lock().await;
            if faults.fail_next > 0 {
                faults.fail_next -= 1;
                return Err(Error::Unavailable);
            }
            if faults.unavailable {
                return Err(Error::Unavailable);
            }
            faults.latency
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        Ok(())
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    type Error = Error;

    async fn acquire(
        &self,
        channel: &ChannelName,
        node_id: &NodeId,
        ttl: Duration,
    ) -> Result<AcquireOutcome, Error> {
        self.counts.lock().await.acquires += 1;
        self.check_faults().await?;

        let mut leases = self.leases.lock().await;
        let now = Instant::now();

        if let Some(stored) = leases.get(channel) {
            if !stored.is_expired(now) {
                return Ok(AcquireOutcome::Held(stored.materialize(channel)));
            }
        }

        let leadership_id = LeadershipId::mint();
        leases.insert(
            channel.clone(),
            StoredLease {
                leadership_id,
                node_id: node_id.clone(),
                deadline: now + ttl,
            },
        );

        Ok(AcquireOutcome::Acquired(leadership_id))
    }

    async fn refresh(
        &self,
        channel: &ChannelName,
        leadership_id: &LeadershipId,
        ttl: Duration,
    ) -> Result<RefreshOutcome, Error> {
        self.counts.lock().await.refreshes += 1;
        self.check_faults().await?;

        let mut leases = self.leases.lock().await;
        let now = Instant::now();

        let Some(stored) = leases.get_mut(channel) else {
            return Ok(RefreshOutcome::NotFound);
        };

        if stored.is_expired(now) {
            leases.remove(channel);
            return Ok(RefreshOutcome::NotFound);
        }

        if stored.leadership_id != *leadership_id {
            return Ok(RefreshOutcome::Mismatch(stored.materialize(channel)));
        }

        stored.deadline = now + ttl;
        Ok(RefreshOutcome::Refreshed)
    }

    async fn release(
        &self,
        channel: &ChannelName,
        leadership_id: &LeadershipId,
    ) -> Result<ReleaseOutcome, Error> {
        self.counts.lock().await.releases += 1;
        self.check_faults().await?;

        let mut leases = self.leases.lock().await;
        let now = Instant::now();

        let Some(stored) = leases.get(channel) else {
            return Ok(ReleaseOutcome::Released);
        };

        if stored.is_expired(now) {
            leases.remove(channel);
            return Ok(ReleaseOutcome::Released);
        }

        if stored.leadership_id != *leadership_id {
            return Ok(ReleaseOutcome::Mismatch);
        }

        leases.remove(channel);
        Ok(ReleaseOutcome::Released)
    }

    async fn get(&self, channel: &ChannelName) -> Result<Option<Lease>, Error> {
        self.counts.lock().await.gets += 1;
        self.check_faults().await?;

        let leases = self.leases.lock().await;
        let now = Instant::now();

        Ok(leases
            .get(channel)
            .filter(|stored| !stored.is_expired(now))
            .map(|stored| stored.materialize(channel)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;

    fn channel() -> ChannelName {
        ChannelName::new("stream/metrics").unwrap()
    }

    #[tokio::test]
    async fn test_acquire_then_held() {
        let store = MemoryLeaseStore::new();
        let node_a = NodeId::new("node-a");
        let node_b = NodeId::new("node-b");
        let ttl = Duration::from_secs(10);

        let outcome = store.acquire(&channel(), &node_a, ttl).await.unwrap();
        let leadership_id = assert_matches!(outcome, AcquireOutcome::Acquired(id) => id);

        let outcome = store.acquire(&channel(), &node_b, ttl).await.unwrap();
        assert_matches!(outcome, AcquireOutcome::Held(lease) => {
            assert_eq!(lease.leadership_id, leadership_id);
            assert_eq!(lease.node_id, node_a);
        });
    }

    #[tokio::test]
    async fn test_concurrent_acquire_single_winner() {
        let store = MemoryLeaseStore::new();
        let ttl = Duration::from_secs(10);

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .acquire(&channel(), &NodeId::new(format!("node-{i}")), ttl)
                    .await
                    .unwrap()
            }));
        }

        let mut wins = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), AcquireOutcome::Acquired(_)) {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_expired_lease_is_absent() {
        let store = MemoryLeaseStore::new();
        let node = NodeId::new("node-a");
        let ttl = Duration::from_millis(40);

        let first = store.acquire(&channel(), &node, ttl).await.unwrap();
        let first_id = assert_matches!(first, AcquireOutcome::Acquired(id) => id);

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(store.get(&channel()).await.unwrap(), None);

        let second = store.acquire(&channel(), &node, ttl).await.unwrap();
        let second_id = assert_matches!(second, AcquireOutcome::Acquired(id) => id);
        assert_ne!(first_id, second_id);
    }

    #[tokio::test]
    async fn test_refresh_extends_expiry() {
        let store = MemoryLeaseStore::new();
        let node = NodeId::new("node-a");
        let ttl = Duration::from_millis(100);

        let outcome = store.acquire(&channel(), &node, ttl).await.unwrap();
        let id = assert_matches!(outcome, AcquireOutcome::Acquired(id) => id);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(
            store.refresh(&channel(), &id, ttl).await.unwrap(),
            RefreshOutcome::Refreshed
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.get(&channel()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_refresh_mismatch_and_not_found() {
        let store = MemoryLeaseStore::new();
        let node = NodeId::new("node-a");
        let ttl = Duration::from_secs(10);

        assert_eq!(
            store
                .refresh(&channel(), &LeadershipId::mint(), ttl)
                .await
                .unwrap(),
            RefreshOutcome::NotFound
        );

        let outcome = store.acquire(&channel(), &node, ttl).await.unwrap();
        let id = assert_matches!(outcome, AcquireOutcome::Acquired(id) => id);

        let other = LeadershipId::mint();
        assert_matches!(
            store.refresh(&channel(), &other, ttl).await.unwrap(),
            RefreshOutcome::Mismatch(lease) => assert_eq!(lease.leadership_id, id)
        );
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let store = MemoryLeaseStore::new();
        let node = NodeId::new("node-a");
        let ttl = Duration::from_secs(10);

        let outcome = store.acquire(&channel(), &node, ttl).await.unwrap();
        let id = assert_matches!(outcome, AcquireOutcome::Acquired(id) => id);

        assert_eq!(
            store.release(&channel(), &id).await.unwrap(),
            ReleaseOutcome::Released
        );
        assert_eq!(
            store.release(&channel(), &id).await.unwrap(),
            ReleaseOutcome::Released
        );
        assert_eq!(store.get(&channel()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_release_mismatch_leaves_lease() {
        let store = MemoryLeaseStore::new();
        let node = NodeId::new("node-a");
        let ttl = Duration::from_secs(10);

        store.acquire(&channel(), &node, ttl).await.unwrap();

        assert_eq!(
            store
                .release(&channel(), &LeadershipId::mint())
                .await
                .unwrap(),
            ReleaseOutcome::Mismatch
        );
        assert!(store.get(&channel()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = MemoryLeaseStore::new();
        let node = NodeId::new("node-a");
        let ttl = Duration::from_secs(10);

        store.fail_next(2).await;
        assert_matches!(
            store.acquire(&channel(), &node, ttl).await,
            Err(Error::Unavailable)
        );
        assert_matches!(store.get(&channel()).await, Err(Error::Unavailable));
        assert!(store.get(&channel()).await.is_ok());

        store.set_unavailable(true).await;
        assert_matches!(store.get(&channel()).await, Err(Error::Unavailable));
        store.set_unavailable(false).await;
        assert!(store.get(&channel()).await.is_ok());
    }
}
