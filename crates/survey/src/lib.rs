//! Abstract interface for the addressed cross-node survey RPC.
//!
//! Surveys route subscribe requests from a follower node to the node believed
//! to hold a channel's lease. Delivery is to the named node only; there is no
//! broadcast, and no retries happen inside the transport. The network layer
//! may deliver a request more than once; callees stay idempotent by re-reading
//! the lease before answering.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

use std::error::Error;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_types::{ChannelName, LeadershipId, NodeId};
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

/// Marker trait for transport-level survey errors.
pub trait SurveyTransportError: Debug + Error + Send + Sync + 'static {}

/// A subscribe request routed to the node believed to hold a channel's lease.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurveyRequest {
    /// Channel the originating client wants to subscribe to.
    pub channel: ChannelName,

    /// Node the request originates from.
    pub origin: NodeId,
}

/// The surveyed node's answer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SurveyResponse {
    /// The surveyed node is the active leader; subscribe under this id.
    Subscribed {
        /// The leader's current leadership id.
        leadership_id: LeadershipId,
    },

    /// The surveyed node no longer leads the channel; the caller re-reads the
    /// lease and retries.
    LeadershipChanged,

    /// The surveyed node failed to process the request.
    Failed {
        /// Human-readable failure reason.
        reason: String,
    },
}

/// Errors surfaced to survey callers.
#[derive(Debug, ThisError)]
pub enum SurveyError<E>
where
    E: SurveyTransportError,
{
    /// No response arrived within the caller's timeout.
    #[error("survey to {0} timed out")]
    Timeout(NodeId),

    /// The target node is not known to the transport.
    #[error("no such node: {0}")]
    NoSuchNode(NodeId),

    /// The transport itself failed.
    #[error(transparent)]
    Transport(E),
}

/// Handles surveys addressed to this node.
#[async_trait]
pub trait SurveyHandler: Send + Sync + 'static {
    /// Answers a subscribe survey.
    async fn handle(&self, request: SurveyRequest) -> SurveyResponse;
}

/// A best-effort addressed RPC between named cluster nodes.
///
/// Callers bound every survey with a timeout strictly below the lease TTL so
/// the timeout chain of the coordination core holds.
#[async_trait]
pub trait SurveyTransport
where
    Self: Clone + Send + Sync + 'static,
{
    /// The transport error type.
    type Error: SurveyTransportError;

    /// Sends `request` to `target` and awaits its response.
    async fn survey(
        &self,
        target: &NodeId,
        request: SurveyRequest,
        timeout: Duration,
    ) -> Result<SurveyResponse, SurveyError<Self::Error>>;

    /// Installs the handler answering surveys addressed to `node_id`.
    async fn bind(
        &self,
        node_id: NodeId,
        handler: Arc<dyn SurveyHandler>,
    ) -> Result<(), Self::Error>;
}
