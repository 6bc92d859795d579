//! Abstract interface for the cluster-wide channel lease registry.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

use std::error::Error;
use std::fmt::Debug;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use relay_types::{ChannelName, LeadershipId, NodeId};
use serde::{Deserialize, Serialize};

/// Marker trait for `LeaseStore` errors.
///
/// Callers treat any store error as transient unavailability; retry policy
/// lives with them, bounded by their configured budgets.
pub trait LeaseStoreError: Debug + Error + Send + Sync + 'static {}

/// A channel's lease record as stored in the registry.
///
/// At most one non-expired lease exists per channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Channel the lease covers.
    pub channel: ChannelName,

    /// Id minted when this lease was created.
    pub leadership_id: LeadershipId,

    /// Node currently holding the lease.
    pub node_id: NodeId,

    /// Wall-clock expiry; refreshes move it forward.
    pub expires_at: SystemTime,
}

/// Result of a create-if-absent acquisition attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The lease was created and the caller now leads the channel.
    Acquired(LeadershipId),

    /// A lease already exists; the caller proceeds as a follower of it.
    Held(Lease),
}

/// Result of an id-matched refresh.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The expiry was extended.
    Refreshed,

    /// No lease exists for the channel (expired or deleted).
    NotFound,

    /// A lease exists under a different leadership id.
    Mismatch(Lease),
}

/// Result of an id-matched release.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The lease was deleted, or no lease existed (releases are idempotent).
    Released,

    /// A lease exists under a different leadership id; nothing was deleted.
    Mismatch,
}

/// A cluster-wide registry mapping channels to leases.
///
/// `acquire` is linearizable; `refresh` and `release` are linearizable
/// conditional on `(channel, leadership_id)`; `get` may return a value up to
/// one TTL stale, which is why acceptance paths revalidate after recording.
///
/// Concurrent `acquire` tie-break: whichever write the store commits first
/// wins; the loser observes the winner's lease via [`AcquireOutcome::Held`].
#[async_trait]
pub trait LeaseStore
where
    Self: Clone + Send + Sync + 'static,
{
    /// The error type for the store.
    type Error: LeaseStoreError;

    /// Creates a lease for `channel` owned by `node_id` if none exists,
    /// minting a fresh leadership id.
    async fn acquire(
        &self,
        channel: &ChannelName,
        node_id: &NodeId,
        ttl: Duration,
    ) -> Result<AcquireOutcome, Self::Error>;

    /// Extends the lease's expiry by `ttl` iff the stored id matches.
    async fn refresh(
        &self,
        channel: &ChannelName,
        leadership_id: &LeadershipId,
        ttl: Duration,
    ) -> Result<RefreshOutcome, Self::Error>;

    /// Deletes the lease iff the stored id matches; absent is a no-op.
    async fn release(
        &self,
        channel: &ChannelName,
        leadership_id: &LeadershipId,
    ) -> Result<ReleaseOutcome, Self::Error>;

    /// Best-effort read of the channel's current lease.
    async fn get(&self, channel: &ChannelName) -> Result<Option<Lease>, Self::Error>;
}
