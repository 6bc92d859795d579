use relay_leases::LeaseStoreError;
use thiserror::Error;

/// An error that can occur when working with the in-memory lease store.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The store is unavailable (injected by a test).
    #[error("lease store unavailable")]
    Unavailable,
}

impl LeaseStoreError for Error {}
