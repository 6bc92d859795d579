//! Shared identifier types for the relay cluster.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Error returned when a channel name fails validation.
#[derive(Clone, Debug, Error)]
#[error("channel name must be a non-empty string")]
pub struct InvalidChannelName;

/// Logical event stream identifier; the unit of leadership and streaming.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelName(String);

impl ChannelName {
    /// Creates a channel name.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty.
    pub fn new<S>(name: S) -> Result<Self, InvalidChannelName>
    where
        S: Into<String>,
    {
        let name = name.into();
        if name.is_empty() {
            return Err(InvalidChannelName);
        }
        Ok(Self(name))
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier of a cluster node, stable for its lifetime.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node id.
    pub fn new<S>(id: S) -> Self
    where
        S: Into<String>,
    {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique id minted each time a node acquires a channel's lease.
///
/// Two leases for the same channel never share an id; equality of the id is
/// the cluster's proof of leadership continuity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeadershipId(Uuid);

impl LeadershipId {
    /// Mints a fresh leadership id.
    #[must_use]
    pub fn mint() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a leadership id from an existing UUID.
    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Returns the inner UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for LeadershipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_name_rejects_empty() {
        assert!(ChannelName::new("").is_err());
        assert!(ChannelName::new("stream/metrics").is_ok());
    }

    #[test]
    fn test_channel_name_display() {
        let channel = ChannelName::new("stream/metrics").unwrap();
        assert_eq!(channel.to_string(), "stream/metrics");
        assert_eq!(channel.as_str(), "stream/metrics");
    }

    #[test]
    fn test_leadership_ids_are_unique() {
        let a = LeadershipId::mint();
        let b = LeadershipId::mint();
        assert_ne!(a, b);
    }

    #[test]
    fn test_leadership_id_round_trips_through_uuid() {
        let id = LeadershipId::mint();
        assert_eq!(LeadershipId::from_uuid(*id.as_uuid()), id);
    }
}
