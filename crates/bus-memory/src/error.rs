use relay_bus::PublicationBusError;
use thiserror::Error;

/// An error that can occur when working with the in-memory publication bus.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The bus fabric has been closed.
    #[error("publication bus closed")]
    Closed,
}

impl PublicationBusError for Error {}
