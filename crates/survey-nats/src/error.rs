use async_nats::client::RequestError;
use async_nats::{PublishError, SubscribeError};
use relay_survey::SurveyTransportError;
use thiserror::Error;

/// An error that can occur when working with the NATS survey transport.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to subscribe to this node's survey subject.
    #[error("failed to subscribe to survey subject: {0}")]
    Subscribe(#[from] SubscribeError),

    /// Failed to publish a survey reply.
    #[error("failed to publish survey reply: {0}")]
    Publish(#[from] PublishError),

    /// The request failed at the NATS layer.
    #[error("survey request failed: {0}")]
    Request(#[from] RequestError),

    /// A survey body could not be encoded or decoded.
    #[error("invalid survey body: {0}")]
    Body(#[from] serde_json::Error),
}

impl SurveyTransportError for Error {}
