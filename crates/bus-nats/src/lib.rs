//! Publication bus over core NATS pub/sub.
//!
//! Each channel's publications travel on `<prefix>.events.<channel>`. Core
//! NATS gives exactly the bus contract the coordination core expects: fan-out
//! to every interested node, per-subject ordering from a single publisher, no
//! persistence.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod error;

pub use error::Error;

use async_nats::{Client, Subscriber};
use async_trait::async_trait;
use futures::StreamExt;
use relay_bus::{BusSubscriber, PublicationBus, TaggedPublication};
use relay_types::ChannelName;
use tracing::warn;

/// Configuration for the `NatsPublicationBus`.
#[derive(Clone, Debug)]
pub struct NatsPublicationBusConfig {
    /// The NATS client to use.
    pub client: Client,

    /// Subject prefix; publications travel on `<prefix>.events.<channel>`.
    pub subject_prefix: String,
}

/// A publication bus implemented over core NATS pub/sub.
#[derive(Clone)]
pub struct NatsPublicationBus {
    client: Client,
    subject_prefix: String,
}

impl NatsPublicationBus {
    /// Creates a new `NatsPublicationBus`.
    #[must_use]
    pub fn new(
        NatsPublicationBusConfig {
            client,
            subject_prefix,
        }: NatsPublicationBusConfig,
    ) -> Self {
        Self {
            client,
            subject_prefix,
        }
    }

    fn subject_for(&self, channel: &ChannelName) -> String {
        format!("{}.events.{}", self.subject_prefix, channel)
    }
}

/// A subscription to one channel's publications.
pub struct NatsBusSubscriber {
    channel: ChannelName,
    subscriber: Subscriber,
}

#[async_trait]
impl BusSubscriber for NatsBusSubscriber {
    async fn recv(&mut self) -> Option<TaggedPublication> {
        while let Some(message) = self.subscriber.next().await {
            match serde_json::from_slice(&message.payload) {
                Ok(publication) => return Some(publication),
                Err(e) => {
                    warn!(channel = %self.channel, error = %e, "discarding malformed publication");
                }
            }
        }
        None
    }
}

#[async_trait]
impl PublicationBus for NatsPublicationBus {
    type Error = Error;
    type Subscriber = NatsBusSubscriber;

    async fn publish(&self, publication: TaggedPublication) -> Result<(), Error> {
        let subject = self.subject_for(&publication.channel);
        let body = serde_json::to_vec(&publication)?;
        self.client.publish(subject, body.into()).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &ChannelName) -> Result<NatsBusSubscriber, Error> {
        let subscriber = self.client.subscribe(self.subject_for(channel)).await?;
        Ok(NatsBusSubscriber {
            channel: channel.clone(),
            subscriber,
        })
    }
}
