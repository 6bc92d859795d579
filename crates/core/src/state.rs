//! Per-channel coordination state.
//!
//! Each channel owns one mutex-protected state record; tasks never hold it
//! across a lease-store, survey, producer or sink call, and cross-channel
//! operations never touch two records at once.

use std::collections::HashMap;

use relay_types::LeadershipId;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::subscription::{SubscriptionEnd, SubscriptionId};

/// One local leadership tenure for a channel.
#[derive(Debug)]
pub(crate) struct LocalLeadership {
    pub leadership_id: LeadershipId,

    /// Cancelling stops this tenure's stream runner and lease refresher.
    pub token: CancellationToken,
}

/// One local subscription's record.
#[derive(Debug)]
pub(crate) struct SubscriptionEntry {
    /// Leadership id frozen at subscribe time.
    pub leadership_id: LeadershipId,

    /// Cancelling stops this subscription's watch and delivery tasks.
    pub token: CancellationToken,

    /// Resolves the handle's `closed()` future; consumed at teardown.
    pub ended: Option<oneshot::Sender<SubscriptionEnd>>,
}

impl SubscriptionEntry {
    /// Cancels the subscription's tasks and delivers the terminal signal.
    pub fn finish(mut self, end: SubscriptionEnd) {
        self.token.cancel();
        if let Some(ended) = self.ended.take() {
            let _ = ended.send(end);
        }
    }
}

/// The per-channel state record.
#[derive(Debug, Default)]
pub(crate) struct ChannelState {
    /// Present iff this node currently leads the channel.
    pub leadership: Option<LocalLeadership>,

    /// Subscriptions hosted on this node.
    pub subscriptions: HashMap<SubscriptionId, SubscriptionEntry>,
}

impl ChannelState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_idle(&self) -> bool {
        self.leadership.is_none() && self.subscriptions.is_empty()
    }

    pub fn leadership_id(&self) -> Option<LeadershipId> {
        self.leadership.as_ref().map(|lead| lead.leadership_id)
    }
}
