//! Lease registry backed by NATS JetStream KV.
//!
//! Leases live in a KV bucket whose `max_age` is the lease TTL: create-if-absent
//! maps to `create`, refresh and release are revision-checked CAS operations, and
//! expiry is the bucket aging out an unrefreshed key.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod error;

pub use error::Error;

use std::time::{Duration, SystemTime};

use async_nats::jetstream::kv::{
    Config as KvConfig, CreateErrorKind, Entry, Operation, Store as KvStore,
};
use async_nats::jetstream::Context as JetStreamContext;
use async_nats::Client;
use async_trait::async_trait;
use relay_leases::{AcquireOutcome, Lease, LeaseStore, RefreshOutcome, ReleaseOutcome};
use relay_types::{ChannelName, LeadershipId, NodeId};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

/// Configuration for the `NatsLeaseStore`.
#[derive(Clone, Debug)]
pub struct NatsLeaseStoreConfig {
    /// The bucket holding the lease keys.
    pub bucket: String,

    /// The NATS client to use.
    pub client: Client,

    /// Number of replicas for the KV store. Should be at least 3 in production.
    pub num_replicas: usize,

    /// Whether to persist the bucket to disk.
    pub persist: bool,

    /// Lease TTL, applied as the bucket's `max_age`. Per-operation TTLs must
    /// equal this value; JetStream KV ages keys per bucket, not per key.
    pub ttl: Duration,
}

/// Stored value for a lease key; expiry is carried by the bucket's `max_age`.
#[derive(Debug, Serialize, Deserialize)]
struct LeaseValue {
    leadership_id: LeadershipId,
    node_id: NodeId,
}

/// A lease store implemented over a NATS JetStream KV bucket.
#[derive(Clone)]
pub struct NatsLeaseStore {
    bucket: String,
    jetstream_context: JetStreamContext,
    num_replicas: usize,
    persist: bool,
    ttl: Duration,
}

impl NatsLeaseStore {
    /// Creates a new `NatsLeaseStore`. The KV bucket is created or opened
    /// lazily on first operation.
    #[must_use]
    pub fn new(
        NatsLeaseStoreConfig {
            bucket,
            client,
            num_replicas,
            persist,
            ttl,
        }: NatsLeaseStoreConfig,
    ) -> Self {
        let jetstream_context = async_nats::jetstream::new(client);

        Self {
            bucket,
            jetstream_context,
            num_replicas,
            persist,
            ttl,
        }
    }

    async fn kv_store(&self) -> Result<KvStore, Error> {
        let kv_config = KvConfig {
            bucket: self.bucket.clone(),
            max_age: self.ttl,
            num_replicas: self.num_replicas,
            storage: if self.persist {
                async_nats::jetstream::stream::StorageType::File
            } else {
                async_nats::jetstream::stream::StorageType::Memory
            },
            ..Default::default()
        };

        Ok(self
            .jetstream_context
            .create_key_value(kv_config)
            .await?)
    }

    fn decode_entry(channel: &ChannelName, entry: &Entry, ttl: Duration) -> Result<Lease, Error> {
        let value: LeaseValue = serde_json::from_slice(&entry.value)?;
        Ok(Lease {
            channel: channel.clone(),
            leadership_id: value.leadership_id,
            node_id: value.node_id,
            // The bucket ages keys from their last write.
            expires_at: SystemTime::from(entry.created) + ttl,
        })
    }

    /// Reads the channel's live entry, skipping delete/purge tombstones.
    async fn live_entry(
        kv_store: &KvStore,
        channel: &ChannelName,
    ) -> Result<Option<Entry>, Error> {
        match kv_store.entry(channel.as_str()).await? {
            Some(entry)
                if entry.operation == Operation::Put && !entry.value.is_empty() =>
            {
                Ok(Some(entry))
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl LeaseStore for NatsLeaseStore {
    type Error = Error;

    #[instrument(skip(self), fields(bucket = %self.bucket, channel = %channel, node_id = %node_id))]
    async fn acquire(
        &self,
        channel: &ChannelName,
        node_id: &NodeId,
        ttl: Duration,
    ) -> Result<AcquireOutcome, Error> {
        debug_assert_eq!(ttl, self.ttl, "per-call ttl must match bucket max_age");
        let kv_store = self.kv_store().await?;

        let leadership_id = LeadershipId::mint();
        let value = serde_json::to_vec(&LeaseValue {
            leadership_id,
            node_id: node_id.clone(),
        })?;

        match kv_store.create(channel.as_str(), value.clone().into()).await {
            Ok(_) => {
                debug!("lease acquired via create");
                Ok(AcquireOutcome::Acquired(leadership_id))
            }
            Err(create_err) if create_err.kind() == CreateErrorKind::AlreadyExists => {
                match kv_store.entry(channel.as_str()).await? {
                    Some(entry)
                        if entry.operation == Operation::Put && !entry.value.is_empty() =>
                    {
                        Ok(AcquireOutcome::Held(Self::decode_entry(
                            channel, &entry, self.ttl,
                        )?))
                    }
                    Some(entry) => {
                        // Tombstone from a released lease; claim it by updating
                        // at the observed revision.
                        match kv_store
                            .update(channel.as_str(), value.into(), entry.revision)
                            .await
                        {
                            Ok(_) => {
                                debug!("lease acquired over tombstone");
                                Ok(AcquireOutcome::Acquired(leadership_id))
                            }
                            Err(_) => {
                                warn!("tombstone claim raced another acquirer");
                                match Self::live_entry(&kv_store, channel).await? {
                                    Some(entry) => Ok(AcquireOutcome::Held(
                                        Self::decode_entry(channel, &entry, self.ttl)?,
                                    )),
                                    None => Err(Error::Conflict(
                                        "lease vanished while claiming tombstone".into(),
                                    )),
                                }
                            }
                        }
                    }
                    None => Err(Error::Conflict(
                        "create reported existing key but no entry found".into(),
                    )),
                }
            }
            Err(create_err) => Err(create_err.into()),
        }
    }

    #[instrument(skip(self), fields(bucket = %self.bucket, channel = %channel, leadership_id = %leadership_id))]
    async fn refresh(
        &self,
        channel: &ChannelName,
        leadership_id: &LeadershipId,
        ttl: Duration,
    ) -> Result<RefreshOutcome, Error> {
        debug_assert_eq!(ttl, self.ttl, "per-call ttl must match bucket max_age");
        let kv_store = self.kv_store().await?;

        let Some(entry) = Self::live_entry(&kv_store, channel).await? else {
            return Ok(RefreshOutcome::NotFound);
        };

        let lease = Self::decode_entry(channel, &entry, self.ttl)?;
        if lease.leadership_id != *leadership_id {
            return Ok(RefreshOutcome::Mismatch(lease));
        }

        // Rewriting the value at the observed revision resets the key's age.
        match kv_store
            .update(channel.as_str(), entry.value, entry.revision)
            .await
        {
            Ok(_) => Ok(RefreshOutcome::Refreshed),
            Err(update_err) => {
                // Revision moved under us; re-read and classify.
                warn!(error = %update_err, "refresh raced another writer");
                match Self::live_entry(&kv_store, channel).await? {
                    None => Ok(RefreshOutcome::NotFound),
                    Some(entry) => {
                        let lease = Self::decode_entry(channel, &entry, self.ttl)?;
                        if lease.leadership_id == *leadership_id {
                            Err(Error::Conflict(
                                "concurrent refresh under the same leadership id".into(),
                            ))
                        } else {
                            Ok(RefreshOutcome::Mismatch(lease))
                        }
                    }
                }
            }
        }
    }

    #[instrument(skip(self), fields(bucket = %self.bucket, channel = %channel, leadership_id = %leadership_id))]
    async fn release(
        &self,
        channel: &ChannelName,
        leadership_id: &LeadershipId,
    ) -> Result<ReleaseOutcome, Error> {
        let kv_store = self.kv_store().await?;

        let Some(entry) = Self::live_entry(&kv_store, channel).await? else {
            return Ok(ReleaseOutcome::Released);
        };

        let lease = Self::decode_entry(channel, &entry, self.ttl)?;
        if lease.leadership_id != *leadership_id {
            return Ok(ReleaseOutcome::Mismatch);
        }

        match kv_store
            .purge_expect_revision(channel.as_str(), Some(entry.revision))
            .await
        {
            Ok(()) => Ok(ReleaseOutcome::Released),
            Err(purge_err) => {
                warn!(error = %purge_err, "release raced another writer");
                match Self::live_entry(&kv_store, channel).await? {
                    None => Ok(ReleaseOutcome::Released),
                    Some(_) => Ok(ReleaseOutcome::Mismatch),
                }
            }
        }
    }

    #[instrument(skip(self), fields(bucket = %self.bucket, channel = %channel))]
    async fn get(&self, channel: &ChannelName) -> Result<Option<Lease>, Error> {
        let kv_store = self.kv_store().await?;

        match Self::live_entry(&kv_store, channel).await? {
            Some(entry) => Ok(Some(Self::decode_entry(channel, &entry, self.ttl)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use async_nats::connect;
    use uuid::Uuid;

    async fn test_store(bucket_prefix: &str) -> (Client, NatsLeaseStore) {
        let nats_url =
            std::env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string());
        let client = connect(&nats_url)
            .await
            .expect("Failed to connect to NATS for tests");
        let bucket = format!("test_leases_{}_{}", bucket_prefix, Uuid::new_v4().simple());
        let store = NatsLeaseStore::new(NatsLeaseStoreConfig {
            bucket,
            client: client.clone(),
            num_replicas: 1,
            persist: false,
            ttl: Duration::from_secs(10),
        });
        (client, store)
    }

    async fn cleanup(client: Client, store: &NatsLeaseStore) {
        let js_context = async_nats::jetstream::new(client);
        js_context.delete_key_value(&store.bucket).await.ok();
    }

    fn channel() -> ChannelName {
        ChannelName::new("stream/metrics").unwrap()
    }

    #[tokio::test]
    #[ignore = "requires a running NATS server"]
    async fn test_acquire_and_held() {
        let (client, store) = test_store("acquire").await;
        let ttl = Duration::from_secs(10);

        let outcome = store
            .acquire(&channel(), &NodeId::new("node-a"), ttl)
            .await
            .unwrap();
        let id = assert_matches!(outcome, AcquireOutcome::Acquired(id) => id);

        let outcome = store
            .acquire(&channel(), &NodeId::new("node-b"), ttl)
            .await
            .unwrap();
        assert_matches!(outcome, AcquireOutcome::Held(lease) => {
            assert_eq!(lease.leadership_id, id);
            assert_eq!(lease.node_id, NodeId::new("node-a"));
        });

        cleanup(client, &store).await;
    }

    #[tokio::test]
    #[ignore = "requires a running NATS server"]
    async fn test_refresh_and_release_are_id_matched() {
        let (client, store) = test_store("refresh").await;
        let ttl = Duration::from_secs(10);

        let outcome = store
            .acquire(&channel(), &NodeId::new("node-a"), ttl)
            .await
            .unwrap();
        let id = assert_matches!(outcome, AcquireOutcome::Acquired(id) => id);

        assert_eq!(
            store.refresh(&channel(), &id, ttl).await.unwrap(),
            RefreshOutcome::Refreshed
        );
        assert_matches!(
            store
                .refresh(&channel(), &LeadershipId::mint(), ttl)
                .await
                .unwrap(),
            RefreshOutcome::Mismatch(_)
        );

        assert_eq!(
            store
                .release(&channel(), &LeadershipId::mint())
                .await
                .unwrap(),
            ReleaseOutcome::Mismatch
        );
        assert_eq!(
            store.release(&channel(), &id).await.unwrap(),
            ReleaseOutcome::Released
        );
        assert_eq!(
            store.release(&channel(), &id).await.unwrap(),
            ReleaseOutcome::Released
        );
        assert_eq!(store.get(&channel()).await.unwrap(), None);

        cleanup(client, &store).await;
    }

    #[tokio::test]
    #[ignore = "requires a running NATS server"]
    async fn test_acquire_after_release_claims_tombstone() {
        let (client, store) = test_store("tombstone").await;
        let ttl = Duration::from_secs(10);

        let outcome = store
            .acquire(&channel(), &NodeId::new("node-a"), ttl)
            .await
            .unwrap();
        let first = assert_matches!(outcome, AcquireOutcome::Acquired(id) => id);
        store.release(&channel(), &first).await.unwrap();

        let outcome = store
            .acquire(&channel(), &NodeId::new("node-b"), ttl)
            .await
            .unwrap();
        let second = assert_matches!(outcome, AcquireOutcome::Acquired(id) => id);
        assert_ne!(first, second);

        cleanup(client, &store).await;
    }
}
