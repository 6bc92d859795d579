//! Scripted in-memory producer for tests.
//!
//! Tests script each channel with events, a clean end, or an injected failure,
//! and assert on open-stream counters to check the single-consumer invariant
//! the coordination core is supposed to uphold.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod error;

pub use error::Error;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use relay_producer::{Producer, ProducerStream};
use relay_types::ChannelName;
use tokio::sync::mpsc;

#[derive(Debug)]
enum ScriptStep {
    Event(Bytes),
    End,
    Fail(String),
}

#[derive(Debug)]
struct ChannelScript {
    sender: mpsc::UnboundedSender<ScriptStep>,
    pending: Option<mpsc::UnboundedReceiver<ScriptStep>>,
}

#[derive(Debug, Default)]
struct Counters {
    open: u32,
    peak: u32,
    total: u64,
}

/// A producer whose streams replay test-scripted steps.
#[derive(Clone, Debug, Default)]
pub struct MemoryProducer {
    scripts: Arc<Mutex<HashMap<ChannelName, ChannelScript>>>,
    counters: Arc<Mutex<HashMap<ChannelName, Counters>>>,
}

impl MemoryProducer {
    /// Creates a new producer with no scripted channels.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a fresh script for `channel` and returns the handle driving
    /// it. The next `open` consumes this script; re-script before every
    /// expected re-open.
    pub fn script(&self, channel: &ChannelName) -> ProducerScript {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.scripts.lock().unwrap().insert(
            channel.clone(),
            ChannelScript {
                sender: sender.clone(),
                pending: Some(receiver),
            },
        );
        ProducerScript { sender }
    }

    /// Number of currently open streams for `channel`.
    #[must_use]
    pub fn open_streams(&self, channel: &ChannelName) -> u32 {
        self.counters
            .lock()
            .unwrap()
            .get(channel)
            .map_or(0, |counters| counters.open)
    }

    /// Highest number of simultaneously open streams `channel` has seen.
    #[must_use]
    pub fn peak_open_streams(&self, channel: &ChannelName) -> u32 {
        self.counters
            .lock()
            .unwrap()
            .get(channel)
            .map_or(0, |counters| counters.peak)
    }

    /// Total number of streams ever opened for `channel`.
    #[must_use]
    pub fn total_opens(&self, channel: &ChannelName) -> u64 {
        self.counters
            .lock()
            .unwrap()
            .get(channel)
            .map_or(0, |counters| counters.total)
    }
}

/// Drives one channel's scripted stream.
#[derive(Clone, Debug)]
pub struct ProducerScript {
    sender: mpsc::UnboundedSender<ScriptStep>,
}

impl ProducerScript {
    /// Emits one event on the stream.
    pub fn emit<B>(&self, payload: B)
    where
        B: Into<Bytes>,
    {
        let _ = self.sender.send(ScriptStep::Event(payload.into()));
    }

    /// Ends the stream cleanly.
    pub fn end(&self) {
        let _ = self.sender.send(ScriptStep::End);
    }

    /// Fails the stream.
    pub fn fail<S>(&self, reason: S)
    where
        S: Into<String>,
    {
        let _ = self.sender.send(ScriptStep::Fail(reason.into()));
    }
}

/// A scripted upstream stream.
#[derive(Debug)]
pub struct MemoryProducerStream {
    channel: ChannelName,
    receiver: mpsc::UnboundedReceiver<ScriptStep>,
    counters: Arc<Mutex<HashMap<ChannelName, Counters>>>,
}

impl Drop for MemoryProducerStream {
    fn drop(&mut self) {
        let mut counters = self.counters.lock().unwrap();
        if let Some(counters) = counters.get_mut(&self.channel) {
            counters.open = counters.open.saturating_sub(1);
        }
    }
}

#[async_trait]
impl ProducerStream for MemoryProducerStream {
    type Error = Error;

    async fn next(&mut self) -> Result<Option<Bytes>, Error> {
        match self.receiver.recv().await {
            Some(ScriptStep::Event(payload)) => Ok(Some(payload)),
            // A dropped script handle reads as a clean end too.
            Some(ScriptStep::End) | None => Ok(None),
            Some(ScriptStep::Fail(reason)) => Err(Error::Scripted(reason)),
        }
    }

    async fn close(self) {
        // Dropping the stream releases the open-counter slot.
    }
}

#[async_trait]
impl Producer for MemoryProducer {
    type Error = Error;
    type Stream = MemoryProducerStream;

    async fn open(&self, channel: &ChannelName) -> Result<MemoryProducerStream, Error> {
        let receiver = {
            let mut scripts = self.scripts.lock().unwrap();
            let script = scripts.entry(channel.clone()).or_insert_with(|| {
                let (sender, receiver) = mpsc::unbounded_channel();
                ChannelScript {
                    sender,
                    pending: Some(receiver),
                }
            });
            script.pending.take().ok_or(Error::AlreadyOpen)?
        };

        {
            let mut counters = self.counters.lock().unwrap();
            let counters = counters.entry(channel.clone()).or_default();
            counters.open += 1;
            counters.peak = counters.peak.max(counters.open);
            counters.total += 1;
        }

        Ok(MemoryProducerStream {
            channel: channel.clone(),
            receiver,
            counters: self.counters.clone(),
        })
    }
}
