//! Outbound delivery gate: the per-subscription leadership filter and the
//! sink it writes through.

use async_trait::async_trait;
use bytes::Bytes;
use relay_bus::TaggedPublication;
use relay_types::LeadershipId;
use thiserror::Error;
use tracing::debug;

/// Error returned by a delivery sink write.
#[derive(Clone, Debug, Error)]
#[error("delivery sink error: {0}")]
pub struct SinkError(String);

impl SinkError {
    /// Creates a sink error from any displayable cause.
    pub fn new<S>(reason: S) -> Self
    where
        S: Into<String>,
    {
        Self(reason.into())
    }
}

/// Outbound write hook installed by the client transport.
///
/// Writes may block on a slow client; the delivery loop bounds each call with
/// the configured write timeout and tears down only the affected
/// subscription on failure.
#[async_trait]
pub trait DeliverySink: Send + Sync + 'static {
    /// Writes one event payload to the client.
    async fn deliver(&self, payload: Bytes) -> Result<(), SinkError>;
}

/// Drops publications whose leadership tag differs from the tag the
/// subscription was opened under.
///
/// During leadership turnover, publications from the previous tenure may
/// still be in flight; filtering on tag equality absorbs them silently
/// instead of disconnecting the client.
#[derive(Clone, Copy, Debug)]
pub struct DeliveryFilter {
    expected: LeadershipId,
}

impl DeliveryFilter {
    /// Creates a filter pinned to the subscription's frozen leadership id.
    #[must_use]
    pub const fn new(expected: LeadershipId) -> Self {
        Self { expected }
    }

    /// Whether the publication belongs to the leadership this subscription
    /// was opened under.
    #[must_use]
    pub fn admit(&self, publication: &TaggedPublication) -> bool {
        if publication.leadership_id == self.expected {
            return true;
        }

        debug!(
            channel = %publication.channel,
            expected = %self.expected,
            actual = %publication.leadership_id,
            "dropping stale publication"
        );
        false
    }
}
