//! Channel-leader coordination core for a horizontally scaled live-streaming
//! cluster.
//!
//! Clients subscribe to named channels on whichever node they are connected
//! to, while each channel's upstream producer must be driven by exactly one
//! stream across the whole cluster. The coordinator elects a leader per
//! channel by acquiring a lease in a shared registry, routes subscribes from
//! follower nodes to the leader over an addressed survey RPC, runs the single
//! upstream stream on the leader and republishes its events tagged with the
//! tenure's leadership id, and tears everything down within bounded time when
//! the leader goes away. Every outbound message is checked against the
//! subscription's frozen leadership id, so stale publications from a previous
//! tenure are silently absorbed during turnover.
//!
//! External collaborators plug in behind capability traits: the lease store
//! ([`relay_leases::LeaseStore`]), the survey transport
//! ([`relay_survey::SurveyTransport`]), the publication bus
//! ([`relay_bus::PublicationBus`]), the upstream producer
//! ([`relay_producer::Producer`]) and the per-client [`DeliverySink`].
#![warn(missing_docs)]
#![warn(clippy::all)]

mod config;
mod coordinator;
mod error;
mod filter;
mod leadership;
mod runner;
mod state;
mod subscription;
mod survey_handler;

pub use config::{ConfigError, CoordinatorConfig};
pub use coordinator::Coordinator;
pub use error::Error;
pub use filter::{DeliveryFilter, DeliverySink, SinkError};
pub use subscription::{SubscriptionEnd, SubscriptionHandle, SubscriptionId};
