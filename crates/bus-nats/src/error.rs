use async_nats::{PublishError, SubscribeError};
use relay_bus::PublicationBusError;
use thiserror::Error;

/// An error that can occur when working with the NATS publication bus.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to publish a tagged publication.
    #[error("failed to publish: {0}")]
    Publish(#[from] PublishError),

    /// Failed to subscribe to a channel subject.
    #[error("failed to subscribe: {0}")]
    Subscribe(#[from] SubscribeError),

    /// A publication body could not be encoded.
    #[error("invalid publication body: {0}")]
    Body(#[from] serde_json::Error),
}

impl PublicationBusError for Error {}
