//! The per-node coordinator: subscription management, election and teardown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use relay_bus::PublicationBus;
use relay_leases::{AcquireOutcome, Lease, LeaseStore, RefreshOutcome, ReleaseOutcome};
use relay_producer::Producer;
use relay_survey::{SurveyError, SurveyRequest, SurveyResponse, SurveyTransport};
use relay_types::{ChannelName, LeadershipId, NodeId};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::error::Error;
use crate::filter::{DeliveryFilter, DeliverySink};
use crate::state::{ChannelState, LocalLeadership, SubscriptionEntry};
use crate::subscription::{SubscriptionEnd, SubscriptionHandle, SubscriptionId};
use crate::survey_handler::CoordinatorSurveyHandler;

/// Where a subscribe landed: the leadership id it is frozen to, and the
/// remote owner it was routed through, if any.
#[derive(Clone, Debug)]
pub(crate) struct Placement {
    pub leadership_id: LeadershipId,
    pub routed_via: Option<NodeId>,
}

pub(crate) struct Inner<L, T, B, P>
where
    L: LeaseStore,
    T: SurveyTransport,
    B: PublicationBus,
    P: Producer,
{
    pub config: CoordinatorConfig,
    pub node_id: NodeId,
    pub leases: L,
    pub survey: T,
    pub bus: B,
    pub producer: P,
    pub channels: RwLock<HashMap<ChannelName, Arc<Mutex<ChannelState>>>>,
    pub task_tracker: TaskTracker,
    pub shutdown_token: CancellationToken,
    next_subscription_id: AtomicU64,
}

/// One node's view of the channel-leader coordination core.
///
/// The coordinator elects a leader per channel by acquiring a lease in the
/// shared registry, routes subscribes from follower nodes to the leader over
/// the survey transport, runs the single upstream stream on the leader, and
/// tears subscriptions down within bounded time when leadership is lost.
pub struct Coordinator<L, T, B, P>
where
    L: LeaseStore,
    T: SurveyTransport,
    B: PublicationBus,
    P: Producer,
{
    pub(crate) inner: Arc<Inner<L, T, B, P>>,
}

impl<L, T, B, P> Clone for Coordinator<L, T, B, P>
where
    L: LeaseStore,
    T: SurveyTransport,
    B: PublicationBus,
    P: Producer,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<L, T, B, P> Coordinator<L, T, B, P>
where
    L: LeaseStore,
    T: SurveyTransport,
    B: PublicationBus,
    P: Producer,
{
    /// Creates a coordinator for `node_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration violates the timeout chain.
    pub fn new(
        node_id: NodeId,
        config: CoordinatorConfig,
        leases: L,
        survey: T,
        bus: B,
        producer: P,
    ) -> Result<Self, Error> {
        config.validate()?;

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                node_id,
                leases,
                survey,
                bus,
                producer,
                channels: RwLock::new(HashMap::new()),
                task_tracker: TaskTracker::new(),
                shutdown_token: CancellationToken::new(),
                next_subscription_id: AtomicU64::new(0),
            }),
        })
    }

    /// This node's id.
    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.inner.node_id
    }

    /// Starts answering surveys from other nodes.
    ///
    /// # Errors
    ///
    /// Returns an error if the survey transport refuses the binding.
    pub async fn start(&self) -> Result<(), Error> {
        let handler = CoordinatorSurveyHandler::new(self.clone());
        self.inner
            .survey
            .bind(self.inner.node_id.clone(), Arc::new(handler))
            .await
            .map_err(|e| Error::SurveyFailed(e.to_string()))?;

        info!(node_id = %self.inner.node_id, "coordinator started");
        Ok(())
    }

    /// Opens a subscription for `channel`, electing a leader if the channel
    /// has none, and installs `sink` as the client's outbound write hook.
    ///
    /// # Errors
    ///
    /// Transient errors (`StoreUnavailable`, `SurveyFailed`,
    /// `BusUnavailable`) and `LeadershipChanged` all mean the caller should
    /// retry; a retry lands on whatever leadership the cluster has by then.
    pub async fn subscribe(
        &self,
        channel: ChannelName,
        sink: Arc<dyn DeliverySink>,
    ) -> Result<SubscriptionHandle, Error> {
        if self.inner.shutdown_token.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let placement = self.locate_leadership(&channel).await?;

        // Revalidate after recording: `get` tolerates stale reads, so the
        // lease may have moved while the placement was being established.
        let expected_owner = placement
            .routed_via
            .clone()
            .unwrap_or_else(|| self.inner.node_id.clone());
        let revalidated = match self.store_get(&channel).await {
            Ok(lease) => lease.is_some_and(|lease| {
                lease.leadership_id == placement.leadership_id
                    && lease.node_id == expected_owner
            }),
            Err(_) => false,
        };
        if !revalidated {
            warn!(channel = %channel, "leadership changed during subscribe");
            self.release_idle_leadership(&channel, placement.leadership_id)
                .await;
            return Err(Error::LeadershipChanged);
        }

        self.register_subscription(channel, placement, sink).await
    }

    /// Drops a subscription. When the last local subscriber of a channel this
    /// node leads goes away, the lease is released and followers observe the
    /// vacancy through their watch loops.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        self.finish_subscription(&handle.channel, handle.id, SubscriptionEnd::Unsubscribed)
            .await;
    }

    /// Stops every task, signals local subscriptions and releases held
    /// leases best-effort.
    pub async fn shutdown(&self) {
        info!(node_id = %self.inner.node_id, "coordinator shutting down");
        self.inner.shutdown_token.cancel();

        let channels: Vec<ChannelName> =
            self.inner.channels.read().await.keys().cloned().collect();
        for channel in channels {
            let Some(state_arc) = self.channel_state(&channel).await else {
                continue;
            };
            let released = {
                let mut state = state_arc.lock().await;
                for (_, entry) in state.subscriptions.drain() {
                    entry.finish(SubscriptionEnd::Shutdown);
                }
                state.leadership.take().map(|lead| {
                    lead.token.cancel();
                    lead.leadership_id
                })
            };
            if let Some(leadership_id) = released {
                if let Err(e) = self.store_release(&channel, &leadership_id).await {
                    warn!(channel = %channel, error = %e, "failed to release lease at shutdown");
                }
            }
        }
        self.inner.channels.write().await.clear();

        self.inner.task_tracker.close();
        if timeout(self.inner.config.shutdown_grace, self.inner.task_tracker.wait())
            .await
            .is_err()
        {
            warn!("tasks did not unwind within the shutdown grace");
        }

        info!(node_id = %self.inner.node_id, "coordinator shutdown complete");
    }

    // ---- election ----------------------------------------------------------

    /// Locate the channel's leader, electing this node if the lease is
    /// vacant. Bounded by the election retry budget.
    async fn locate_leadership(&self, channel: &ChannelName) -> Result<Placement, Error> {
        let mut rounds = 0u32;

        loop {
            match self.store_get_retry(channel).await? {
                None => match self.store_acquire_retry(channel).await? {
                    AcquireOutcome::Acquired(leadership_id) => {
                        info!(channel = %channel, leadership_id = %leadership_id, "elected leader");
                        self.start_leadership(channel, leadership_id).await;
                        return Ok(Placement {
                            leadership_id,
                            routed_via: None,
                        });
                    }
                    AcquireOutcome::Held(lease) => {
                        debug!(channel = %channel, owner = %lease.node_id, "lost acquire race; following");
                    }
                },
                Some(lease) if lease.node_id == self.inner.node_id => {
                    if let Some(local_id) = self.local_leadership_id(channel).await {
                        if local_id == lease.leadership_id {
                            return Ok(Placement {
                                leadership_id: local_id,
                                routed_via: None,
                            });
                        }
                    }
                    // A concurrent subscribe on this node may have acquired
                    // and not yet recorded its tenure; give it one
                    // store-timeout beat before treating the lease as a
                    // leftover.
                    tokio::time::sleep(self.inner.config.store_timeout).await;
                    if let Some(local_id) = self.local_leadership_id(channel).await {
                        if local_id == lease.leadership_id {
                            return Ok(Placement {
                                leadership_id: local_id,
                                routed_via: None,
                            });
                        }
                    }
                    // A lease of ours without a live tenure is a leftover
                    // from a lost one; clear it so the election can run. The
                    // release is id-matched, so a healthy concurrent tenure
                    // is unaffected.
                    warn!(channel = %channel, "clearing stale self-owned lease");
                    let _ = self.store_release(channel, &lease.leadership_id).await;
                }
                Some(lease) => match self.survey_owner(channel, &lease).await? {
                    SurveyResponse::Subscribed { leadership_id } => {
                        return Ok(Placement {
                            leadership_id,
                            routed_via: Some(lease.node_id),
                        });
                    }
                    SurveyResponse::LeadershipChanged => {
                        debug!(channel = %channel, owner = %lease.node_id, "owner no longer leads; retrying");
                    }
                    SurveyResponse::Failed { reason } => {
                        return Err(Error::SurveyFailed(reason));
                    }
                },
            }

            rounds += 1;
            if rounds >= self.inner.config.election_retry_budget {
                return Err(Error::LeadershipChanged);
            }
            // Leadership is in flux; give the new leader a beat to settle
            // before re-reading the lease.
            tokio::time::sleep(self.inner.config.store_timeout).await;
        }
    }

    /// Survey the lease owner for a remote accept, retrying timeouts within
    /// the survey retry budget.
    async fn survey_owner(
        &self,
        channel: &ChannelName,
        lease: &Lease,
    ) -> Result<SurveyResponse, Error> {
        let request = SurveyRequest {
            channel: channel.clone(),
            origin: self.inner.node_id.clone(),
        };
        let mut timeouts = 0u32;

        loop {
            match self
                .inner
                .survey
                .survey(
                    &lease.node_id,
                    request.clone(),
                    self.inner.config.survey_timeout,
                )
                .await
            {
                Ok(response) => return Ok(response),
                Err(SurveyError::Timeout(node)) => {
                    timeouts += 1;
                    warn!(channel = %channel, owner = %node, timeouts, "survey timed out");
                    if timeouts >= self.inner.config.survey_retry_budget {
                        return Err(Error::SurveyFailed(format!("survey to {node} timed out")));
                    }
                }
                Err(error @ SurveyError::NoSuchNode(_)) => {
                    return Err(Error::SurveyFailed(error.to_string()));
                }
                Err(SurveyError::Transport(error)) => {
                    return Err(Error::SurveyFailed(error.to_string()));
                }
            }
        }
    }

    /// Records a new local tenure and spawns its refresher and stream runner.
    async fn start_leadership(&self, channel: &ChannelName, leadership_id: LeadershipId) {
        let token = self.inner.shutdown_token.child_token();

        let displaced = {
            let state_arc = self.ensure_channel(channel).await;
            let mut state = state_arc.lock().await;

            let displaced = state.leadership.take();
            if let Some(old) = &displaced {
                old.token.cancel();
            }

            // Subscriptions frozen under an older tenure cannot outlive it.
            let stale: Vec<SubscriptionId> = state
                .subscriptions
                .iter()
                .filter(|(_, entry)| entry.leadership_id != leadership_id)
                .map(|(id, _)| *id)
                .collect();
            for id in stale {
                if let Some(entry) = state.subscriptions.remove(&id) {
                    entry.finish(SubscriptionEnd::LeadershipLost);
                }
            }

            state.leadership = Some(LocalLeadership {
                leadership_id,
                token: token.clone(),
            });
            displaced.is_some()
        };

        if displaced {
            warn!(channel = %channel, "displaced a previous local tenure");
        }

        {
            let this = self.clone();
            let channel = channel.clone();
            let token = token.clone();
            self.inner.task_tracker.spawn(async move {
                this.refresh_task(channel, leadership_id, token).await;
            });
        }
        {
            let this = self.clone();
            let channel = channel.clone();
            self.inner.task_tracker.spawn(async move {
                this.run_stream(channel, leadership_id, token).await;
            });
        }
    }

    // ---- subscription registration and teardown ----------------------------

    async fn register_subscription(
        &self,
        channel: ChannelName,
        placement: Placement,
        sink: Arc<dyn DeliverySink>,
    ) -> Result<SubscriptionHandle, Error> {
        // Open the bus subscription before recording the entry; publications
        // racing this setup are legitimately lost, late ones are not.
        let bus_subscriber = self
            .inner
            .bus
            .subscribe(&channel)
            .await
            .map_err(|e| Error::BusUnavailable(e.to_string()))?;

        let id = SubscriptionId::new(
            self.inner
                .next_subscription_id
                .fetch_add(1, Ordering::Relaxed),
        );
        let token = self.inner.shutdown_token.child_token();
        let (ended_tx, ended_rx) = oneshot::channel();

        {
            let state_arc = self.ensure_channel(&channel).await;
            let mut state = state_arc.lock().await;
            state.subscriptions.insert(
                id,
                SubscriptionEntry {
                    leadership_id: placement.leadership_id,
                    token: token.clone(),
                    ended: Some(ended_tx),
                },
            );
        }

        info!(
            channel = %channel,
            subscription = %id,
            leadership_id = %placement.leadership_id,
            remote = placement.routed_via.is_some(),
            "subscription opened"
        );

        {
            let this = self.clone();
            let channel = channel.clone();
            let token = token.clone();
            let filter = DeliveryFilter::new(placement.leadership_id);
            self.inner.task_tracker.spawn(async move {
                this.delivery_task(channel, id, filter, bus_subscriber, sink, token)
                    .await;
            });
        }
        {
            let this = self.clone();
            let channel = channel.clone();
            let frozen = placement.leadership_id;
            let routed_via = placement.routed_via.clone();
            self.inner.task_tracker.spawn(async move {
                this.watch_task(channel, id, frozen, routed_via, token).await;
            });
        }

        Ok(SubscriptionHandle {
            id,
            channel,
            leadership_id: placement.leadership_id,
            ended: ended_rx,
        })
    }

    /// Removes one subscription, delivering its terminal signal. The last
    /// local subscriber of a led channel takes the tenure (and the lease)
    /// down with it.
    pub(crate) async fn finish_subscription(
        &self,
        channel: &ChannelName,
        id: SubscriptionId,
        end: SubscriptionEnd,
    ) {
        let Some(state_arc) = self.channel_state(channel).await else {
            return;
        };

        let released = {
            let mut state = state_arc.lock().await;
            let Some(entry) = state.subscriptions.remove(&id) else {
                return;
            };
            info!(channel = %channel, subscription = %id, end = ?end, "subscription closed");
            entry.finish(end);

            if state.subscriptions.is_empty() {
                state.leadership.take().map(|lead| {
                    lead.token.cancel();
                    lead.leadership_id
                })
            } else {
                None
            }
        };

        self.gc_channel(channel).await;

        if let Some(leadership_id) = released {
            info!(channel = %channel, leadership_id = %leadership_id, "last local subscriber gone; releasing lease");
            if let Err(e) = self.store_release(channel, &leadership_id).await {
                warn!(channel = %channel, error = %e, "failed to release lease");
            }
        }
    }

    /// Ends a whole local tenure: cancels its tasks, signals every local
    /// subscription, and optionally releases the lease. Signals from a
    /// tenure that has already been replaced are ignored.
    pub(crate) async fn end_tenure(
        &self,
        channel: &ChannelName,
        leadership_id: LeadershipId,
        end: SubscriptionEnd,
        release: bool,
    ) {
        let Some(state_arc) = self.channel_state(channel).await else {
            return;
        };

        let proceed = {
            let mut state = state_arc.lock().await;
            match state.leadership.take() {
                Some(lead) if lead.leadership_id == leadership_id => {
                    lead.token.cancel();
                    for (_, entry) in state.subscriptions.drain() {
                        entry.finish(end.clone());
                    }
                    true
                }
                other => {
                    state.leadership = other;
                    false
                }
            }
        };
        if !proceed {
            debug!(channel = %channel, leadership_id = %leadership_id, "ignoring signal from a replaced tenure");
            return;
        }

        self.gc_channel(channel).await;

        if release {
            match self.store_release(channel, &leadership_id).await {
                Ok(ReleaseOutcome::Released) => {}
                Ok(ReleaseOutcome::Mismatch) => {
                    debug!(channel = %channel, "lease already re-acquired by another tenure");
                }
                Err(e) => {
                    warn!(channel = %channel, error = %e, "failed to release lease");
                }
            }
        }
    }

    /// Rolls back a tenure started for a subscribe that then failed, so a
    /// failed first subscribe does not leave a subscriber-less leader
    /// refreshing forever.
    async fn release_idle_leadership(&self, channel: &ChannelName, leadership_id: LeadershipId) {
        let Some(state_arc) = self.channel_state(channel).await else {
            return;
        };

        let release = {
            let mut state = state_arc.lock().await;
            match state.leadership.take() {
                Some(lead)
                    if lead.leadership_id == leadership_id
                        && state.subscriptions.is_empty() =>
                {
                    lead.token.cancel();
                    true
                }
                other => {
                    state.leadership = other;
                    false
                }
            }
        };

        if release {
            self.gc_channel(channel).await;
            if let Err(e) = self.store_release(channel, &leadership_id).await {
                warn!(channel = %channel, error = %e, "failed to release idle lease");
            }
        }
    }

    // ---- channel state registry --------------------------------------------

    pub(crate) async fn channel_state(
        &self,
        channel: &ChannelName,
    ) -> Option<Arc<Mutex<ChannelState>>> {
        self.inner.channels.read().await.get(channel).cloned()
    }

    async fn ensure_channel(&self, channel: &ChannelName) -> Arc<Mutex<ChannelState>> {
        let mut channels = self.inner.channels.write().await;
        channels
            .entry(channel.clone())
            .or_insert_with(|| Arc::new(Mutex::new(ChannelState::new())))
            .clone()
    }

    async fn gc_channel(&self, channel: &ChannelName) {
        let mut channels = self.inner.channels.write().await;
        if let Some(state_arc) = channels.get(channel) {
            if state_arc.lock().await.is_idle() {
                channels.remove(channel);
            }
        }
    }

    pub(crate) async fn local_leadership_id(
        &self,
        channel: &ChannelName,
    ) -> Option<LeadershipId> {
        let state_arc = self.channel_state(channel).await?;
        let state = state_arc.lock().await;
        state.leadership_id()
    }

    // ---- bounded lease store access ----------------------------------------

    pub(crate) async fn store_get(&self, channel: &ChannelName) -> Result<Option<Lease>, Error> {
        timeout(self.inner.config.store_timeout, self.inner.leases.get(channel))
            .await
            .map_err(|_| Error::StoreUnavailable("lease read timed out".to_string()))?
            .map_err(|e| Error::StoreUnavailable(e.to_string()))
    }

    async fn store_get_retry(&self, channel: &ChannelName) -> Result<Option<Lease>, Error> {
        let mut last = Error::StoreUnavailable("store retry budget is zero".to_string());
        for _ in 0..self.inner.config.store_retry_budget {
            match self.store_get(channel).await {
                Ok(lease) => return Ok(lease),
                Err(e) => last = e,
            }
        }
        Err(last)
    }

    async fn store_acquire_retry(&self, channel: &ChannelName) -> Result<AcquireOutcome, Error> {
        let mut last = Error::StoreUnavailable("store retry budget is zero".to_string());
        for _ in 0..self.inner.config.store_retry_budget {
            let attempt = timeout(
                self.inner.config.store_timeout,
                self.inner.leases.acquire(
                    channel,
                    &self.inner.node_id,
                    self.inner.config.lease_ttl,
                ),
            )
            .await
            .map_err(|_| Error::StoreUnavailable("lease acquire timed out".to_string()))
            .and_then(|result| result.map_err(|e| Error::StoreUnavailable(e.to_string())));

            match attempt {
                Ok(outcome) => return Ok(outcome),
                Err(e) => last = e,
            }
        }
        Err(last)
    }

    pub(crate) async fn store_refresh(
        &self,
        channel: &ChannelName,
        leadership_id: &LeadershipId,
    ) -> Result<RefreshOutcome, Error> {
        timeout(
            self.inner.config.store_timeout,
            self.inner
                .leases
                .refresh(channel, leadership_id, self.inner.config.lease_ttl),
        )
        .await
        .map_err(|_| Error::StoreUnavailable("lease refresh timed out".to_string()))?
        .map_err(|e| Error::StoreUnavailable(e.to_string()))
    }

    pub(crate) async fn store_release(
        &self,
        channel: &ChannelName,
        leadership_id: &LeadershipId,
    ) -> Result<ReleaseOutcome, Error> {
        timeout(
            self.inner.config.store_timeout,
            self.inner.leases.release(channel, leadership_id),
        )
        .await
        .map_err(|_| Error::StoreUnavailable("lease release timed out".to_string()))?
        .map_err(|e| Error::StoreUnavailable(e.to_string()))
    }
}
