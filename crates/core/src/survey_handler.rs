//! The remote accept path: answers subscribe surveys addressed to this node.

use async_trait::async_trait;
use relay_bus::PublicationBus;
use relay_leases::LeaseStore;
use relay_producer::Producer;
use relay_survey::{SurveyHandler, SurveyRequest, SurveyResponse, SurveyTransport};
use tracing::debug;

use crate::coordinator::Coordinator;

/// Answers surveys on behalf of the local coordinator.
pub(crate) struct CoordinatorSurveyHandler<L, T, B, P>
where
    L: LeaseStore,
    T: SurveyTransport,
    B: PublicationBus,
    P: Producer,
{
    coordinator: Coordinator<L, T, B, P>,
}

impl<L, T, B, P> CoordinatorSurveyHandler<L, T, B, P>
where
    L: LeaseStore,
    T: SurveyTransport,
    B: PublicationBus,
    P: Producer,
{
    pub fn new(coordinator: Coordinator<L, T, B, P>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl<L, T, B, P> SurveyHandler for CoordinatorSurveyHandler<L, T, B, P>
where
    L: LeaseStore,
    T: SurveyTransport,
    B: PublicationBus,
    P: Producer,
{
    async fn handle(&self, request: SurveyRequest) -> SurveyResponse {
        debug!(channel = %request.channel, origin = %request.origin, "survey received");

        // Re-read the lease before answering; the survey layer is
        // at-least-once, and the re-read keeps the accept idempotent.
        let lease = match self.coordinator.store_get(&request.channel).await {
            Ok(lease) => lease,
            Err(e) => {
                return SurveyResponse::Failed {
                    reason: e.to_string(),
                }
            }
        };

        let Some(lease) = lease else {
            return SurveyResponse::LeadershipChanged;
        };
        if lease.node_id != *self.coordinator.node_id() {
            return SurveyResponse::LeadershipChanged;
        }

        // A node that has just lost leadership rejects instead of
        // re-acquiring; any caller strategy works against a well-defined
        // rejection.
        match self.coordinator.local_leadership_id(&request.channel).await {
            Some(local_id) if local_id == lease.leadership_id => SurveyResponse::Subscribed {
                leadership_id: local_id,
            },
            _ => SurveyResponse::LeadershipChanged,
        }
    }
}
