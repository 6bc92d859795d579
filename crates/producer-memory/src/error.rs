use relay_producer::ProducerError;
use thiserror::Error;

/// An error that can occur when working with the scripted producer.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The channel already has an open stream; producers are single-consumer.
    #[error("channel already has an open stream")]
    AlreadyOpen,

    /// A failure injected through the channel's script.
    #[error("scripted failure: {0}")]
    Scripted(String),
}

impl ProducerError for Error {}
