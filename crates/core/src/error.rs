//! Error types for the coordination core.

use thiserror::Error;

use crate::config::ConfigError;

/// An error surfaced by coordinator operations.
///
/// Transient errors (`StoreUnavailable`, `BusUnavailable`, `SurveyFailed`)
/// mean the caller may simply retry the subscribe. `LeadershipChanged` means
/// the retry will land on the new leader. No error here crosses a channel
/// boundary.
#[derive(Debug, Error)]
pub enum Error {
    /// The lease store was unreachable past the retry budget.
    #[error("lease store unavailable: {0}")]
    StoreUnavailable(String),

    /// The publication bus refused the subscription.
    #[error("publication bus unavailable: {0}")]
    BusUnavailable(String),

    /// Routing the subscribe to the lease owner failed past the retry budget.
    #[error("survey failed: {0}")]
    SurveyFailed(String),

    /// Leadership moved while the subscribe was being accepted.
    #[error("leadership changed during subscribe")]
    LeadershipChanged,

    /// The configuration violates the timeout chain.
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),

    /// The coordinator is shutting down.
    #[error("coordinator is shutting down")]
    ShuttingDown,
}
