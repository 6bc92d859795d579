use async_nats::jetstream::context::CreateKeyValueError;
use async_nats::jetstream::kv::{CreateError, EntryError, PurgeError, UpdateError};
use relay_leases::LeaseStoreError;
use thiserror::Error;

/// An error that can occur when working with the NATS-backed lease store.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to create or open the KV bucket.
    #[error("failed to open KV bucket: {0}")]
    Bucket(#[from] CreateKeyValueError),

    /// Failed to create a lease key.
    #[error("failed to create lease key: {0}")]
    Create(#[from] CreateError),

    /// Failed to read a lease entry.
    #[error("failed to read lease entry: {0}")]
    Entry(#[from] EntryError),

    /// Failed to update a lease entry.
    #[error("failed to update lease entry: {0}")]
    Update(#[from] UpdateError),

    /// Failed to purge a lease entry.
    #[error("failed to purge lease entry: {0}")]
    Purge(PurgeError),

    /// A stored lease value could not be decoded.
    #[error("invalid lease value: {0}")]
    InvalidValue(#[from] serde_json::Error),

    /// The store reported conflicting state mid-operation.
    #[error("conflicting lease state: {0}")]
    Conflict(String),
}

impl LeaseStoreError for Error {}
