//! Client-facing subscription handles, terminal signals, and the per-
//! subscription watch and delivery loops.

use std::fmt;
use std::sync::Arc;

use relay_bus::{BusSubscriber, PublicationBus};
use relay_leases::LeaseStore;
use relay_producer::Producer;
use relay_survey::SurveyTransport;
use relay_types::{ChannelName, LeadershipId, NodeId};
use tokio::sync::oneshot;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::coordinator::Coordinator;
use crate::filter::{DeliveryFilter, DeliverySink};

/// Identifies one subscription on its hosting node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Terminal signal delivered when a subscription stops.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscriptionEnd {
    /// The lease vanished or changed hands. The client reconnects, and the
    /// first subscribe anywhere drives a fresh election.
    LeadershipLost,

    /// The upstream producer ended cleanly; the client resubscribes from
    /// scratch.
    StreamEnded,

    /// The upstream producer failed.
    StreamFailed {
        /// Upstream failure description.
        reason: String,
    },

    /// The client's outbound write path failed or timed out.
    DeliveryFailed,

    /// The client unsubscribed.
    Unsubscribed,

    /// The hosting coordinator shut down.
    Shutdown,
}

/// A live subscription on the hosting node.
///
/// The leadership id recorded at subscribe time is frozen for the
/// subscription's lifetime; the delivery filter validates every outbound
/// message against it.
#[derive(Debug)]
pub struct SubscriptionHandle {
    pub(crate) id: SubscriptionId,
    pub(crate) channel: ChannelName,
    pub(crate) leadership_id: LeadershipId,
    pub(crate) ended: oneshot::Receiver<SubscriptionEnd>,
}

impl SubscriptionHandle {
    /// This subscription's id.
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// The subscribed channel.
    #[must_use]
    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }

    /// The leadership id frozen at subscribe time.
    #[must_use]
    pub fn leadership_id(&self) -> LeadershipId {
        self.leadership_id
    }

    /// Resolves with the terminal signal once the subscription stops.
    pub async fn closed(self) -> SubscriptionEnd {
        self.ended.await.unwrap_or(SubscriptionEnd::Shutdown)
    }
}

impl<L, T, B, P> Coordinator<L, T, B, P>
where
    L: LeaseStore,
    T: SurveyTransport,
    B: PublicationBus,
    P: Producer,
{
    /// Forwards bus publications to the client's sink, dropping any whose
    /// leadership tag differs from the one this subscription froze at
    /// subscribe time. Per-subscription bus order is preserved.
    pub(crate) async fn delivery_task(
        &self,
        channel: ChannelName,
        id: SubscriptionId,
        filter: DeliveryFilter,
        mut bus_subscriber: B::Subscriber,
        sink: Arc<dyn DeliverySink>,
        token: CancellationToken,
    ) {
        loop {
            let publication = tokio::select! {
                () = token.cancelled() => return,
                publication = bus_subscriber.recv() => publication,
            };

            let Some(publication) = publication else {
                // Bus closed underneath us; the watch loop surfaces the
                // leadership outcome.
                return;
            };

            if !filter.admit(&publication) {
                continue;
            }

            match timeout(
                self.inner.config.write_timeout,
                sink.deliver(publication.payload),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(channel = %channel, subscription = %id, error = %e, "delivery sink failed");
                    self.finish_subscription(&channel, id, SubscriptionEnd::DeliveryFailed)
                        .await;
                    return;
                }
                Err(_) => {
                    warn!(channel = %channel, subscription = %id, "delivery write timed out");
                    self.finish_subscription(&channel, id, SubscriptionEnd::DeliveryFailed)
                        .await;
                    return;
                }
            }
        }
    }

    /// Re-reads the lease every check interval and tears the subscription
    /// down once it no longer matches what the subscription was accepted
    /// under. Store errors are tolerated up to the watch retry budget.
    pub(crate) async fn watch_task(
        &self,
        channel: ChannelName,
        id: SubscriptionId,
        frozen: LeadershipId,
        routed_via: Option<NodeId>,
        token: CancellationToken,
    ) {
        let expected_owner = routed_via.unwrap_or_else(|| self.inner.node_id.clone());
        let mut failures = 0u32;
        let mut ticker = tokio::time::interval(self.inner.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The subscribe path already validated; skip the immediate first tick.
        ticker.tick().await;

        loop {
            tokio::select! {
                () = token.cancelled() => return,
                _ = ticker.tick() => {}
            }

            match self.store_get(&channel).await {
                Ok(lease) => {
                    failures = 0;
                    let valid = lease.as_ref().is_some_and(|lease| {
                        lease.leadership_id == frozen && lease.node_id == expected_owner
                    });
                    if !valid {
                        info!(channel = %channel, subscription = %id, "lease gone or changed hands");
                        self.finish_subscription(&channel, id, SubscriptionEnd::LeadershipLost)
                            .await;
                        return;
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!(channel = %channel, subscription = %id, failures, error = %e, "lease check failed");
                    if failures >= self.inner.config.watch_retry_budget {
                        self.finish_subscription(&channel, id, SubscriptionEnd::LeadershipLost)
                            .await;
                        return;
                    }
                }
            }
        }
    }
}
