//! In-memory survey fabric for tests and single-process clusters.
//!
//! Clones share the node registry, so a simulated cluster passes one fabric
//! value to every node. Handler invocations run on their own task, so a
//! panicking callee surfaces as a transport error instead of unwinding the
//! caller, and a timed-out survey keeps running with its result discarded.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod error;

pub use error::Error;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_survey::{
    SurveyError, SurveyHandler, SurveyRequest, SurveyResponse, SurveyTransport,
};
use relay_types::NodeId;
use tokio::sync::RwLock;

/// A process-local survey fabric.
#[derive(Clone, Default)]
pub struct MemorySurveyFabric {
    handlers: Arc<RwLock<HashMap<NodeId, Arc<dyn SurveyHandler>>>>,
    partitioned: Arc<RwLock<HashSet<NodeId>>>,
}

impl MemorySurveyFabric {
    /// Creates a new empty fabric.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Swallows requests addressed to `node` until healed; callers observe
    /// timeouts, as with a network partition.
    pub async fn partition(&self, node: NodeId) {
        self.partitioned.write().await.insert(node);
    }

    /// Restores delivery to `node`.
    pub async fn heal(&self, node: &NodeId) {
        self.partitioned.write().await.remove(node);
    }

    /// Removes `node` from the fabric entirely; callers observe `NoSuchNode`.
    pub async fn unbind(&self, node: &NodeId) {
        self.handlers.write().await.remove(node);
    }
}

#[async_trait]
impl SurveyTransport for MemorySurveyFabric {
    type Error = Error;

    async fn survey(
        &self,
        target: &NodeId,
        request: SurveyRequest,
        timeout: Duration,
    ) -> Result<SurveyResponse, SurveyError<Error>> {
        if self.partitioned.read().await.contains(target) {
            tokio::time::sleep(timeout).await;
            return Err(SurveyError::Timeout(target.clone()));
        }

        let handler = self.handlers.read().await.get(target).cloned();
        let Some(handler) = handler else {
            return Err(SurveyError::NoSuchNode(target.clone()));
        };

        let call = tokio::spawn(async move { handler.handle(request).await });

        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(SurveyError::Transport(Error::HandlerPanicked)),
            // The callee keeps running; its eventual result is discarded.
            Err(_) => Err(SurveyError::Timeout(target.clone())),
        }
    }

    async fn bind(
        &self,
        node_id: NodeId,
        handler: Arc<dyn SurveyHandler>,
    ) -> Result<(), Error> {
        self.handlers.write().await.insert(node_id, handler);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use relay_types::{ChannelName, LeadershipId};

    struct StaticHandler {
        response: SurveyResponse,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl SurveyHandler for StaticHandler {
        async fn handle(&self, _request: SurveyRequest) -> SurveyResponse {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.response.clone()
        }
    }

    fn request() -> SurveyRequest {
        SurveyRequest {
            channel: ChannelName::new("stream/metrics").unwrap(),
            origin: NodeId::new("node-b"),
        }
    }

    #[tokio::test]
    async fn test_survey_round_trip() {
        let fabric = MemorySurveyFabric::new();
        let target = NodeId::new("node-a");
        let leadership_id = LeadershipId::mint();

        fabric
            .bind(
                target.clone(),
                Arc::new(StaticHandler {
                    response: SurveyResponse::Subscribed { leadership_id },
                    delay: None,
                }),
            )
            .await
            .unwrap();

        let response = fabric
            .survey(&target, request(), Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(response, SurveyResponse::Subscribed { leadership_id });
    }

    #[tokio::test]
    async fn test_survey_unknown_node() {
        let fabric = MemorySurveyFabric::new();
        let target = NodeId::new("node-a");

        let result = fabric
            .survey(&target, request(), Duration::from_millis(100))
            .await;
        assert_matches!(result, Err(SurveyError::NoSuchNode(node)) => assert_eq!(node, target));
    }

    #[tokio::test]
    async fn test_survey_slow_handler_times_out() {
        let fabric = MemorySurveyFabric::new();
        let target = NodeId::new("node-a");

        fabric
            .bind(
                target.clone(),
                Arc::new(StaticHandler {
                    response: SurveyResponse::LeadershipChanged,
                    delay: Some(Duration::from_secs(5)),
                }),
            )
            .await
            .unwrap();

        let result = fabric
            .survey(&target, request(), Duration::from_millis(50))
            .await;
        assert_matches!(result, Err(SurveyError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_partition_and_heal() {
        let fabric = MemorySurveyFabric::new();
        let target = NodeId::new("node-a");

        fabric
            .bind(
                target.clone(),
                Arc::new(StaticHandler {
                    response: SurveyResponse::LeadershipChanged,
                    delay: None,
                }),
            )
            .await
            .unwrap();

        fabric.partition(target.clone()).await;
        let result = fabric
            .survey(&target, request(), Duration::from_millis(50))
            .await;
        assert_matches!(result, Err(SurveyError::Timeout(_)));

        fabric.heal(&target).await;
        let response = fabric
            .survey(&target, request(), Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(response, SurveyResponse::LeadershipChanged);
    }
}
