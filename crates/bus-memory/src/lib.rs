//! In-memory publication bus over per-channel broadcast channels.
//!
//! Clones share the channel fabric, so a simulated cluster passes one bus
//! value to every node. Per-channel ordering holds within the process; there
//! is no persistence, and slow subscribers lose the oldest publications.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod error;

pub use error::Error;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use relay_bus::{BusSubscriber, PublicationBus, TaggedPublication};
use relay_types::ChannelName;
use tokio::sync::{broadcast, Mutex};
use tracing::warn;

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// A process-local publication bus.
#[derive(Clone, Debug)]
pub struct MemoryPublicationBus {
    channels: Arc<Mutex<HashMap<ChannelName, broadcast::Sender<TaggedPublication>>>>,
    capacity: usize,
}

impl Default for MemoryPublicationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPublicationBus {
    /// Creates a bus with the default per-channel buffer capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Creates a bus buffering up to `capacity` publications per channel.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity,
        }
    }

    async fn sender(&self, channel: &ChannelName) -> broadcast::Sender<TaggedPublication> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(channel.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

/// A subscription to one channel's publications.
#[derive(Debug)]
pub struct MemoryBusSubscriber {
    channel: ChannelName,
    receiver: broadcast::Receiver<TaggedPublication>,
}

#[async_trait]
impl BusSubscriber for MemoryBusSubscriber {
    async fn recv(&mut self) -> Option<TaggedPublication> {
        loop {
            match self.receiver.recv().await {
                Ok(publication) => return Some(publication),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(channel = %self.channel, skipped, "subscriber lagging; dropped oldest publications");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[async_trait]
impl PublicationBus for MemoryPublicationBus {
    type Error = Error;
    type Subscriber = MemoryBusSubscriber;

    async fn publish(&self, publication: TaggedPublication) -> Result<(), Error> {
        let sender = self.sender(&publication.channel).await;
        // A send with no receivers is a publication no node is interested in.
        let _ = sender.send(publication);
        Ok(())
    }

    async fn subscribe(&self, channel: &ChannelName) -> Result<MemoryBusSubscriber, Error> {
        let sender = self.sender(channel).await;
        Ok(MemoryBusSubscriber {
            channel: channel.clone(),
            receiver: sender.subscribe(),
        })
    }
}
