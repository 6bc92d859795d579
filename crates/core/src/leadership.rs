//! The leadership controller: per-tenure lease refreshing.
//!
//! While a node leads a channel, a refresher task extends the lease every
//! refresh interval. A mismatch or missing lease means leadership is already
//! gone, so the tenure ends without a release. Store failures are tolerated
//! up to the failure budget, after which the stream is torn down preemptively;
//! the timeout chain guarantees this happens before the lease can lapse, so
//! no two streams ever overlap.

use relay_bus::PublicationBus;
use relay_leases::{LeaseStore, RefreshOutcome};
use relay_producer::Producer;
use relay_survey::SurveyTransport;
use relay_types::{ChannelName, LeadershipId};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::coordinator::Coordinator;
use crate::subscription::SubscriptionEnd;

impl<L, T, B, P> Coordinator<L, T, B, P>
where
    L: LeaseStore,
    T: SurveyTransport,
    B: PublicationBus,
    P: Producer,
{
    pub(crate) async fn refresh_task(
        &self,
        channel: ChannelName,
        leadership_id: LeadershipId,
        token: CancellationToken,
    ) {
        let mut failures = 0u32;
        let mut ticker = tokio::time::interval(self.inner.config.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The acquire already set a full TTL; skip the immediate first tick.
        ticker.tick().await;

        loop {
            tokio::select! {
                () = token.cancelled() => return,
                _ = ticker.tick() => {}
            }

            match self.store_refresh(&channel, &leadership_id).await {
                Ok(RefreshOutcome::Refreshed) => {
                    failures = 0;
                    debug!(channel = %channel, leadership_id = %leadership_id, "lease refreshed");
                }
                Ok(RefreshOutcome::NotFound) => {
                    warn!(channel = %channel, leadership_id = %leadership_id, "lease expired or deleted; leadership lost");
                    self.end_tenure(&channel, leadership_id, SubscriptionEnd::LeadershipLost, false)
                        .await;
                    return;
                }
                Ok(RefreshOutcome::Mismatch(current)) => {
                    warn!(
                        channel = %channel,
                        ours = %leadership_id,
                        current = %current.leadership_id,
                        "lease held by another tenure; leadership lost"
                    );
                    self.end_tenure(&channel, leadership_id, SubscriptionEnd::LeadershipLost, false)
                        .await;
                    return;
                }
                Err(e) => {
                    failures += 1;
                    warn!(channel = %channel, failures, error = %e, "lease refresh failed");
                    if failures >= self.inner.config.refresh_failure_budget {
                        warn!(
                            channel = %channel,
                            "refresh budget exhausted; stopping the stream before the lease can lapse"
                        );
                        self.end_tenure(
                            &channel,
                            leadership_id,
                            SubscriptionEnd::LeadershipLost,
                            false,
                        )
                        .await;
                        return;
                    }
                }
            }
        }
    }
}
