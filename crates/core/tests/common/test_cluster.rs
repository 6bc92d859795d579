//! Shared harness wiring several coordinators to one in-memory fabric.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use relay_bus_memory::MemoryPublicationBus;
use relay_core::{Coordinator, CoordinatorConfig, DeliverySink, SinkError};
use relay_leases_memory::MemoryLeaseStore;
use relay_producer_memory::MemoryProducer;
use relay_survey_memory::MemorySurveyFabric;
use relay_types::NodeId;

pub type MemoryCoordinator =
    Coordinator<MemoryLeaseStore, MemorySurveyFabric, MemoryPublicationBus, MemoryProducer>;

/// A simulated cluster: one shared lease store, survey fabric, bus and
/// producer, with one coordinator per node.
pub struct TestCluster {
    pub store: MemoryLeaseStore,
    pub survey: MemorySurveyFabric,
    pub bus: MemoryPublicationBus,
    pub producer: MemoryProducer,
    pub nodes: Vec<MemoryCoordinator>,
}

impl TestCluster {
    /// Fast timings so failure scenarios play out in well under a second per
    /// phase while keeping the timeout chain valid: TTL 500ms, refresh every
    /// 150ms (budget 3), lease checks every 50ms.
    pub fn config() -> CoordinatorConfig {
        CoordinatorConfig {
            lease_ttl: Duration::from_millis(500),
            refresh_interval: Duration::from_millis(150),
            refresh_failure_budget: 3,
            check_interval: Duration::from_millis(50),
            watch_retry_budget: 5,
            store_timeout: Duration::from_millis(50),
            store_retry_budget: 3,
            survey_timeout: Duration::from_millis(100),
            survey_retry_budget: 2,
            election_retry_budget: 3,
            open_timeout: Duration::from_millis(200),
            write_timeout: Duration::from_millis(100),
            shutdown_grace: Duration::from_millis(100),
        }
    }

    pub async fn new(size: usize) -> Self {
        Self::with_config(size, Self::config()).await
    }

    pub async fn with_config(size: usize, config: CoordinatorConfig) -> Self {
        let store = MemoryLeaseStore::new();
        let survey = MemorySurveyFabric::new();
        let bus = MemoryPublicationBus::new();
        let producer = MemoryProducer::new();

        let mut nodes = Vec::new();
        for i in 0..size {
            let coordinator = Coordinator::new(
                NodeId::new(format!("node-{i}")),
                config.clone(),
                store.clone(),
                survey.clone(),
                bus.clone(),
                producer.clone(),
            )
            .expect("test config must be valid");
            coordinator.start().await.expect("failed to bind survey handler");
            nodes.push(coordinator);
        }

        Self {
            store,
            survey,
            bus,
            producer,
            nodes,
        }
    }

    pub fn node(&self, index: usize) -> &MemoryCoordinator {
        &self.nodes[index]
    }
}

/// Records every payload delivered to a client.
#[derive(Clone, Debug, Default)]
pub struct RecordingSink {
    delivered: Arc<Mutex<Vec<Bytes>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<Bytes> {
        self.delivered.lock().unwrap().clone()
    }

    /// Waits until at least `count` payloads arrived.
    ///
    /// # Panics
    ///
    /// Panics if `deadline` passes first.
    pub async fn wait_for(&self, count: usize, deadline: Duration) -> Vec<Bytes> {
        let start = tokio::time::Instant::now();
        loop {
            let delivered = self.delivered();
            if delivered.len() >= count {
                return delivered;
            }
            assert!(
                start.elapsed() < deadline,
                "timed out waiting for {count} deliveries; got {}",
                delivered.len()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl DeliverySink for RecordingSink {
    async fn deliver(&self, payload: Bytes) -> Result<(), SinkError> {
        self.delivered.lock().unwrap().push(payload);
        Ok(())
    }
}

/// A sink whose client write path is broken.
#[derive(Clone, Debug, Default)]
pub struct FailingSink;

#[async_trait]
impl DeliverySink for FailingSink {
    async fn deliver(&self, _payload: Bytes) -> Result<(), SinkError> {
        Err(SinkError::new("client went away"))
    }
}
