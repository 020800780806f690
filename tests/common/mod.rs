//! Shared helpers for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use bench_psu::config::{Admission, SessionConfig};
use bench_psu::driver::{DefaultsDiffDriver, SettingsDriver};
use bench_psu::error::PsuResult;
use bench_psu::operation::OperationRequest;
use bench_psu::protocol::Psu;
use bench_psu::session::{Session, SessionEvent, SessionHandle};
use bench_psu::transport::{DefaultTransportFactory, FaultControl, FaultyFactory, TransportSpec};
use std::sync::Arc;
use tokio::sync::broadcast;

/// A session whose transports are wrapped in a fault injector.
pub struct Harness {
    pub session: SessionHandle,
    pub control: FaultControl,
}

/// Session timing as shipped: 10 ms lead-in, 300 ms settle, 30 ms replay gap.
pub fn test_config(admission: Admission) -> SessionConfig {
    SessionConfig {
        admission,
        ..SessionConfig::default()
    }
}

/// Driver that writes state dumps nowhere.
pub fn quiet_driver() -> Arc<dyn SettingsDriver> {
    Arc::new(DefaultsDiffDriver::with_writer(4, Box::new(std::io::sink())))
}

/// Driver that always hands out the same replay list.
pub struct FixedReplayDriver(pub Vec<String>);

#[async_trait]
impl SettingsDriver for FixedReplayDriver {
    async fn replay_list(&self, _psu: &mut Psu) -> PsuResult<Vec<String>> {
        Ok(self.0.clone())
    }

    async fn describe_state(&self, _psu: &mut Psu) -> PsuResult<usize> {
        Ok(0)
    }
}

pub fn spawn_with(config: &SessionConfig, driver: Arc<dyn SettingsDriver>) -> Harness {
    let control = FaultControl::new();
    let factory = FaultyFactory::new(
        Arc::new(DefaultTransportFactory::new(config.channel_count)),
        control.clone(),
    );
    let session = Session::builder(config)
        .factory(Arc::new(factory))
        .driver(driver)
        .spawn();
    Harness { session, control }
}

pub fn spawn(admission: Admission) -> Harness {
    spawn_with(&test_config(admission), quiet_driver())
}

/// Connects to the simulator on channel 1 and forgets the connect traffic.
pub async fn connect(harness: &Harness) {
    let report = harness
        .session
        .run(OperationRequest::connect(TransportSpec::Simulated, 1).unwrap())
        .await
        .unwrap();
    assert!(report.is_completed(), "connect failed: {report}");
    harness.control.clear_calls();
}

pub async fn connected(admission: Admission) -> Harness {
    let harness = spawn(admission);
    connect(&harness).await;
    harness
}

/// Everything already sitting in the event channel.
pub fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}
