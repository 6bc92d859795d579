//! Abstract interface for the leadership-tagged publication bus.
//!
//! The bus fans events out from a channel's leader to every node hosting
//! subscribers. Delivery is unordered across nodes, ordered per channel within
//! a node, and unpersisted: a message racing an in-flight subscribe setup is
//! legitimately lost. Every message carries the leadership id of the stream
//! that emitted it, so the delivery filter can reject stale publications
//! during leadership turnover.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

use std::error::Error;
use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;
use relay_types::{ChannelName, LeadershipId};
use serde::{Deserialize, Serialize};

/// Marker trait for publication bus errors.
pub trait PublicationBusError: Debug + Error + Send + Sync + 'static {}

/// A leadership-tagged event traveling from the leader to subscribers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedPublication {
    /// Channel the event belongs to.
    pub channel: ChannelName,

    /// Leadership id of the stream that emitted the event.
    pub leadership_id: LeadershipId,

    /// Opaque event payload.
    pub payload: Bytes,
}

/// A per-channel subscription to the bus.
#[async_trait]
pub trait BusSubscriber: Send + 'static {
    /// Receives the next publication for the subscribed channel.
    ///
    /// Returns `None` once the bus closes the subscription. A subscriber that
    /// falls behind loses the oldest publications.
    async fn recv(&mut self) -> Option<TaggedPublication>;
}

/// Fan-out of tagged publications to every node hosting subscribers.
#[async_trait]
pub trait PublicationBus
where
    Self: Clone + Send + Sync + 'static,
{
    /// The error type for the bus.
    type Error: PublicationBusError;

    /// The per-channel subscriber type.
    type Subscriber: BusSubscriber;

    /// Publishes a tagged event (leader side).
    async fn publish(&self, publication: TaggedPublication) -> Result<(), Self::Error>;

    /// Opens a subscription for one channel's publications.
    async fn subscribe(&self, channel: &ChannelName) -> Result<Self::Subscriber, Self::Error>;
}
