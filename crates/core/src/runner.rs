//! The per-channel stream runner.
//!
//! On the leader, exactly one runner per channel owns the upstream producer
//! stream and republishes its events tagged with the tenure's leadership id.
//! The runner never reconnects on its own: when upstream ends or fails, the
//! tenure ends with it, and the next interested subscribe anywhere in the
//! cluster drives a fresh election under a fresh leadership id.

use relay_bus::{PublicationBus, TaggedPublication};
use relay_leases::LeaseStore;
use relay_producer::{Producer, ProducerStream};
use relay_survey::SurveyTransport;
use relay_types::{ChannelName, LeadershipId};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::coordinator::Coordinator;
use crate::subscription::SubscriptionEnd;

/// Lifecycle of one runner: `Idle → Opening → Running → Terminating → Closed`.
///
/// Entry to `Running` precedes the first publish; exit from `Running`
/// precedes the lease release.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunnerState {
    Idle,
    Opening,
    Running,
    Terminating,
    Closed,
}

impl<L, T, B, P> Coordinator<L, T, B, P>
where
    L: LeaseStore,
    T: SurveyTransport,
    B: PublicationBus,
    P: Producer,
{
    pub(crate) async fn run_stream(
        &self,
        channel: ChannelName,
        leadership_id: LeadershipId,
        token: CancellationToken,
    ) {
        let mut state = RunnerState::Idle;
        trace!(channel = %channel, ?state, "stream runner starting");

        state = RunnerState::Opening;
        trace!(channel = %channel, ?state, "opening upstream");

        let open = tokio::select! {
            () = token.cancelled() => {
                debug!(channel = %channel, "cancelled before upstream opened");
                return;
            }
            open = timeout(self.inner.config.open_timeout, self.inner.producer.open(&channel)) => open,
        };

        let mut stream = match open {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(channel = %channel, error = %e, "failed to open upstream");
                self.end_tenure(
                    &channel,
                    leadership_id,
                    SubscriptionEnd::StreamFailed {
                        reason: e.to_string(),
                    },
                    true,
                )
                .await;
                return;
            }
            Err(_) => {
                warn!(channel = %channel, "upstream open timed out");
                self.end_tenure(
                    &channel,
                    leadership_id,
                    SubscriptionEnd::StreamFailed {
                        reason: "upstream open timed out".to_string(),
                    },
                    true,
                )
                .await;
                return;
            }
        };

        state = RunnerState::Running;
        info!(channel = %channel, leadership_id = %leadership_id, ?state, "stream running");

        let end = loop {
            tokio::select! {
                () = token.cancelled() => break None,
                event = stream.next() => match event {
                    Ok(Some(payload)) => {
                        let publication = TaggedPublication {
                            channel: channel.clone(),
                            leadership_id,
                            payload,
                        };
                        if let Err(e) = self.inner.bus.publish(publication).await {
                            // The bus is unpersisted; a failed publish is a
                            // lost message, not a dead stream.
                            warn!(channel = %channel, error = %e, "failed to publish event");
                        }
                    }
                    Ok(None) => break Some(SubscriptionEnd::StreamEnded),
                    Err(e) => break Some(SubscriptionEnd::StreamFailed {
                        reason: e.to_string(),
                    }),
                }
            }
        };

        state = RunnerState::Terminating;
        trace!(channel = %channel, ?state, "closing upstream");
        stream.close().await;

        if let Some(end) = end {
            info!(channel = %channel, leadership_id = %leadership_id, end = ?end, "upstream finished");
            self.end_tenure(&channel, leadership_id, end, true).await;
        }
        // On cancellation the canceller owns lease and state cleanup.

        state = RunnerState::Closed;
        trace!(channel = %channel, ?state, "stream runner closed");
    }
}
