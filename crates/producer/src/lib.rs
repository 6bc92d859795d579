//! Abstract interface for upstream channel producers.
//!
//! A producer is the plugin feeding a channel: opening it is expensive and the
//! resulting stream is strictly single-consumer. The coordination core exists
//! to guarantee that at most one stream per channel is open across the whole
//! cluster; implementations may assume that guarantee holds.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

use std::error::Error;
use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;
use relay_types::ChannelName;

/// Marker trait for producer errors.
pub trait ProducerError: Debug + Error + Send + Sync + 'static {}

/// A single upstream connection yielding one channel's events in order.
#[async_trait]
pub trait ProducerStream: Send + 'static {
    /// The error type for the stream.
    type Error: ProducerError;

    /// Yields the next event, or `None` on clean end-of-stream.
    ///
    /// May block indefinitely while the channel is quiet; consumers race it
    /// against their cancellation signal.
    async fn next(&mut self) -> Result<Option<Bytes>, Self::Error>;

    /// Closes the upstream connection.
    async fn close(self);
}

/// Opens upstream streams for channels.
#[async_trait]
pub trait Producer
where
    Self: Clone + Send + Sync + 'static,
{
    /// The error type for the producer.
    type Error: ProducerError;

    /// The stream type yielded by `open`.
    type Stream: ProducerStream<Error = Self::Error>;

    /// Opens the upstream stream for `channel`.
    async fn open(&self, channel: &ChannelName) -> Result<Self::Stream, Self::Error>;
}
