//! Session actor.
//!
//! A session owns at most one open transport and runs every operation against
//! it from a single Tokio task. Callers talk to it through a cloneable
//! [`SessionHandle`]: requests go in over a bounded `mpsc` channel, each with a
//! `oneshot` reply, and [`SessionHandle::submit`] returns a [`Ticket`] at once.
//!
//! At most one operation runs at a time. What happens to a request that
//! arrives while another is in flight depends on [`Admission`]: `Reject`
//! refuses it with [`PsuError::Busy`], `Queue` runs it afterwards in arrival
//! order. Requests still queued when the session shuts down are reported as
//! aborted.
//!
//! Observable state is published two ways:
//! - [`SessionStatus`] on a `watch` channel: connection, identity, current
//!   [`OperationState`], the desired output state per channel, known devices.
//! - [`SessionEvent`]s on a `broadcast` channel: operation start, each completed
//!   step, the final report, and informational notices.

use crate::config::{Admission, SessionConfig};
use crate::driver::{ChannelReadback, DefaultsDiffDriver, SettingsDriver};
use crate::error::{PsuError, PsuResult};
use crate::operation::{
    Measurement, OperationKind, OperationOutput, OperationReport, OperationRequest, Outcome,
    Request,
};
use crate::protocol::Psu;
use crate::sequencer::{
    plan_for, Call, OperationState, PlanContext, Readings, Rollback, Sequencer, Step, StepHandler,
};
use crate::transport::{DefaultTransportFactory, TransportFactory, TransportSpec};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Capacity of the event broadcast channel.
const EVENT_CAPACITY: usize = 256;

/// Message shown once the post-reset settle time has passed.
pub const RESET_SETTLED_NOTICE: &str = "Instrument reset done.";

/// A device seen by a successful connect during this process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KnownDevice {
    /// `SIMULATED#<n>` or the port / VISA resource string.
    pub resource_key: String,
    pub identity: String,
}

/// Snapshot of a session, published on every change.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStatus {
    pub connected: bool,
    pub identity: Option<String>,
    pub resource_key: Option<String>,
    pub state: OperationState,
    /// Desired output state per channel, as the control surface shows it.
    pub desired_outputs: BTreeMap<u8, bool>,
    pub devices: Vec<KnownDevice>,
    /// Length of the captured replay list.
    pub saved_commands: usize,
}

impl SessionStatus {
    fn new(channel_count: u8) -> Self {
        Self {
            desired_outputs: (1..=channel_count).map(|channel| (channel, false)).collect(),
            ..Self::default()
        }
    }

    /// Desired output state of `channel`; off when unknown.
    pub fn desired_output(&self, channel: u8) -> bool {
        self.desired_outputs.get(&channel).copied().unwrap_or(false)
    }
}

/// Progress and outcome notifications.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Started {
        id: u64,
        operation: OperationKind,
        steps: usize,
    },
    StepCompleted {
        id: u64,
        operation: OperationKind,
        index: usize,
        total: usize,
        step: String,
    },
    Completed(OperationReport),
    Failed(OperationReport),
    Aborted(OperationReport),
    Notice {
        message: String,
    },
}

impl SessionEvent {
    fn for_report(report: OperationReport) -> Self {
        match report.outcome {
            Outcome::Completed { .. } => SessionEvent::Completed(report),
            Outcome::Failed { .. } => SessionEvent::Failed(report),
            Outcome::Aborted => SessionEvent::Aborted(report),
        }
    }
}

/// Commands accepted by the session task.
#[derive(Debug)]
pub(crate) enum SessionCommand {
    /// Run one operation
    Execute {
        id: u64,
        request: OperationRequest,
        response: oneshot::Sender<OperationReport>,
    },

    /// Close the transport, abort anything queued, and stop
    Shutdown { response: oneshot::Sender<()> },
}

impl SessionCommand {
    /// Helper to create an Execute command
    fn execute(id: u64, request: OperationRequest) -> (Self, oneshot::Receiver<OperationReport>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Execute {
                id,
                request,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a Shutdown command
    fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}

/// Pending result of a submitted operation.
#[derive(Debug)]
pub struct Ticket {
    id: u64,
    operation: OperationKind,
    reply: oneshot::Receiver<OperationReport>,
}

impl Ticket {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn operation(&self) -> OperationKind {
        self.operation
    }

    /// Waits for the operation's report.
    ///
    /// # Errors
    ///
    /// `SessionClosed` if the session task went away without answering.
    pub async fn wait(self) -> PsuResult<OperationReport> {
        self.reply.await.map_err(|_| PsuError::SessionClosed)
    }
}

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    status: watch::Receiver<SessionStatus>,
    events: broadcast::Sender<SessionEvent>,
    in_flight: Arc<AtomicUsize>,
    next_id: Arc<AtomicU64>,
    admission: Admission,
}

impl SessionHandle {
    /// Submits `request` and returns without waiting for it to run.
    ///
    /// # Errors
    ///
    /// - `Connection` if the operation needs a session, none is open, and nothing
    ///   is in flight that could open one.
    /// - `Busy` under `Admission::Reject` while another request is in flight, or
    ///   when the queue is full.
    /// - `SessionClosed` after shutdown.
    pub fn submit(&self, request: OperationRequest) -> PsuResult<Ticket> {
        let operation = request.kind();

        if operation.requires_connection()
            && self.in_flight.load(Ordering::SeqCst) == 0
            && !self.status.borrow().connected
        {
            return Err(PsuError::Connection(format!(
                "{operation} requires an active session; connect first"
            )));
        }

        match self.admission {
            Admission::Reject => {
                if self
                    .in_flight
                    .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    return Err(PsuError::Busy(self.running_name()));
                }
            }
            Admission::Queue => {
                self.in_flight.fetch_add(1, Ordering::SeqCst);
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (command, reply) = SessionCommand::execute(id, request);
        if let Err(err) = self.commands.try_send(command) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(match err {
                TrySendError::Full(_) => PsuError::Busy(self.running_name()),
                TrySendError::Closed(_) => PsuError::SessionClosed,
            });
        }

        debug!(id, %operation, "submitted");
        Ok(Ticket {
            id,
            operation,
            reply,
        })
    }

    /// Submits `request` and waits for its report.
    pub async fn run(&self, request: OperationRequest) -> PsuResult<OperationReport> {
        self.submit(request)?.wait().await
    }

    fn running_name(&self) -> String {
        match self.status.borrow().state {
            OperationState::Running { operation, .. } => operation.to_string(),
            _ => "another operation".to_string(),
        }
    }

    /// Current status.
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Receiver that sees every status change.
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Receiver for events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().connected
    }

    /// Number of submitted requests that have not been answered yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Stops the session task once the running operation (if any) finishes.
    ///
    /// Queued requests are answered with an aborted report.
    pub async fn shutdown(&self) -> PsuResult<()> {
        let (command, reply) = SessionCommand::shutdown();
        self.commands
            .send(command)
            .await
            .map_err(|_| PsuError::SessionClosed)?;
        reply.await.map_err(|_| PsuError::SessionClosed)
    }
}

/// Builder for a session with custom collaborators.
pub struct SessionBuilder {
    config: SessionConfig,
    factory: Option<Arc<dyn TransportFactory>>,
    driver: Option<Arc<dyn SettingsDriver>>,
}

impl SessionBuilder {
    /// Transport factory used by `Connect`.
    pub fn factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Collaborator for `SaveUnique` and `PrintState`.
    pub fn driver(mut self, driver: Arc<dyn SettingsDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Spawns the session task on the current Tokio runtime.
    pub fn spawn(self) -> SessionHandle {
        let channel_count = self.config.channel_count;
        let factory = self
            .factory
            .unwrap_or_else(|| Arc::new(DefaultTransportFactory::new(channel_count)));
        let driver = self
            .driver
            .unwrap_or_else(|| Arc::new(DefaultsDiffDriver::new(channel_count)));

        let (command_tx, command_rx) = mpsc::channel(self.config.mailbox_capacity.max(1));
        let (status_tx, status_rx) = watch::channel(SessionStatus::new(channel_count));
        let status_tx = Arc::new(status_tx);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let in_flight = Arc::new(AtomicUsize::new(0));

        let session = Session {
            sequencer: Sequencer::new(self.config.step_delay(), status_tx.clone(), events.clone()),
            device: Device {
                psu: None,
                factory,
                driver,
                status: status_tx.clone(),
            },
            status: status_tx,
            events: events.clone(),
            in_flight: in_flight.clone(),
            replay_list: Vec::new(),
            simulated_sessions: 0,
            config: self.config.clone(),
        };
        tokio::spawn(session.run(command_rx));

        SessionHandle {
            commands: command_tx,
            status: status_rx,
            events,
            in_flight,
            next_id: Arc::new(AtomicU64::new(0)),
            admission: self.config.admission,
        }
    }
}

/// The session task's state.
pub struct Session {
    config: SessionConfig,
    sequencer: Sequencer,
    device: Device,
    status: Arc<watch::Sender<SessionStatus>>,
    events: broadcast::Sender<SessionEvent>,
    in_flight: Arc<AtomicUsize>,
    /// Replaced whole by each successful `SaveUnique`.
    replay_list: Vec<String>,
    simulated_sessions: u64,
}

impl Session {
    /// Spawns a session with the built-in transports and settings driver.
    pub fn spawn(config: &SessionConfig) -> SessionHandle {
        Self::builder(config).spawn()
    }

    pub fn builder(config: &SessionConfig) -> SessionBuilder {
        SessionBuilder {
            config: config.clone(),
            factory: None,
            driver: None,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        info!("session started");

        while let Some(command) = commands.recv().await {
            match command {
                SessionCommand::Execute {
                    id,
                    request,
                    response,
                } => {
                    let report = self.process(id, request).await;
                    self.answer(report, response);
                }

                SessionCommand::Shutdown { response } => {
                    info!("shutdown requested");
                    commands.close();
                    while let Ok(pending) = commands.try_recv() {
                        match pending {
                            SessionCommand::Execute {
                                id,
                                request,
                                response,
                            } => {
                                let operation = request.kind();
                                warn!(id, %operation, "aborting queued operation");
                                self.set_state(OperationState::Aborted { operation });
                                self.answer(OperationReport::aborted(id, operation), response);
                            }
                            SessionCommand::Shutdown { response } => {
                                let _ = response.send(());
                            }
                        }
                    }
                    self.close_transport().await;
                    let _ = response.send(());
                    break;
                }
            }
        }

        self.close_transport().await;
        info!("session stopped");
    }

    /// Releases the in-flight slot before replying, so a caller that has its
    /// report may submit again straight away.
    fn answer(&self, report: OperationReport, response: oneshot::Sender<OperationReport>) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let _ = self.events.send(SessionEvent::for_report(report.clone()));
        let _ = response.send(report);
    }

    fn set_state(&self, state: OperationState) {
        self.status.send_modify(|status| status.state = state);
    }

    async fn close_transport(&mut self) {
        if let Some(mut psu) = self.device.psu.take() {
            if let Err(e) = psu.close().await {
                warn!(error = %e, "failed to close transport");
            }
            self.sync_connection();
        }
    }

    /// Checks that must pass before an operation is scheduled.
    fn admit(&self, request: &OperationRequest) -> PsuResult<()> {
        let operation = request.kind();
        if operation.requires_connection() && self.device.psu.is_none() {
            return Err(PsuError::Connection(format!(
                "{operation} requires an active session; connect first"
            )));
        }
        if let Some(channel) = request.channel() {
            if channel > self.config.channel_count {
                return Err(PsuError::Validation(format!(
                    "channel {channel} does not exist; the instrument has {}",
                    self.config.channel_count
                )));
            }
        }
        Ok(())
    }

    async fn process(&mut self, id: u64, request: OperationRequest) -> OperationReport {
        let started_at = Utc::now();
        let operation = request.kind();

        let previous_output = request
            .channel()
            .map(|channel| self.status.borrow().desired_output(channel))
            .unwrap_or(false);
        let planned = self.admit(&request).and_then(|()| {
            let ctx = PlanContext {
                connected: self.device.psu.is_some(),
                replay_list: &self.replay_list,
                reset_settle: self.config.reset_settle(),
                replay_interval: self.config.replay_interval(),
                previous_output,
            };
            plan_for(&request, &ctx)
        });
        let plan = match planned {
            Ok(plan) => plan,
            Err(error) => {
                warn!(id, %operation, error = %error, "operation not started");
                return OperationReport::failed(id, operation, &error, None, started_at);
            }
        };

        if let Request::ToggleOutput { channel, enabled } = &request.0 {
            self.status.send_modify(|status| {
                status.desired_outputs.insert(*channel, *enabled);
            });
        }

        info!(id, %operation, steps = plan.len(), "operation started");
        let result = self.sequencer.run(id, plan, &mut self.device).await;
        self.sync_connection();

        let outcome = result
            .map_err(|failure| (Some(failure.step), failure.error))
            .and_then(|readings| self.complete(&request, readings).map_err(|e| (None, e)));

        match outcome {
            Ok(output) => {
                info!(id, %operation, "operation completed");
                self.set_state(OperationState::Completed { operation });
                OperationReport {
                    id,
                    operation,
                    outcome: Outcome::Completed { output },
                    started_at,
                    finished_at: Utc::now(),
                }
            }
            Err((step, error)) => {
                warn!(id, %operation, error = %error, "operation failed");
                self.set_state(OperationState::Failed {
                    operation,
                    error: error.kind(),
                });
                OperationReport::failed(id, operation, &error, step, started_at)
            }
        }
    }

    /// Mirrors whether a transport is open into the published status.
    fn sync_connection(&self) {
        let connected = self.device.psu.is_some();
        self.status.send_if_modified(|status| {
            if status.connected == connected {
                return false;
            }
            status.connected = connected;
            if !connected {
                status.identity = None;
                status.resource_key = None;
            }
            true
        });
    }

    /// Turns the readings of a finished plan into its output and applies the
    /// operation's effect on session state.
    fn complete(&mut self, request: &OperationRequest, readings: Readings) -> PsuResult<OperationOutput> {
        let output = match &request.0 {
            Request::Connect { spec, channel } => {
                let identity = readings
                    .identity
                    .ok_or_else(|| PsuError::Protocol("no identity received".to_string()))?;
                let resource_key = self.resource_key(spec);
                self.status.send_modify(|status| {
                    status.identity = Some(identity.clone());
                    status.resource_key = Some(resource_key.clone());
                    let device = KnownDevice {
                        resource_key: resource_key.clone(),
                        identity: identity.clone(),
                    };
                    match status
                        .devices
                        .iter_mut()
                        .find(|known| known.resource_key == resource_key)
                    {
                        Some(known) => *known = device,
                        None => status.devices.push(device),
                    }
                });
                OperationOutput::Connected {
                    identity,
                    resource_key,
                    channel: *channel,
                }
            }
            Request::Disconnect => OperationOutput::Disconnected,
            Request::SelectChannel { channel } => OperationOutput::ChannelSelected { channel: *channel },
            Request::ApplySettings(settings) => OperationOutput::Applied(*settings),
            Request::ReadChannel { channel } => {
                let readback = match readings {
                    Readings {
                        voltage_setpoint: Some(voltage_setpoint),
                        current_setpoint: Some(current_setpoint),
                        output_enabled: Some(output_enabled),
                        ovp_mode: Some(ovp_mode),
                        ..
                    } => ChannelReadback {
                        channel: *channel,
                        voltage_setpoint,
                        current_setpoint,
                        output_enabled,
                        ovp_mode,
                    },
                    _ => return Err(PsuError::Protocol("incomplete channel readback".to_string())),
                };
                self.status.send_modify(|status| {
                    status
                        .desired_outputs
                        .insert(readback.channel, readback.output_enabled);
                });
                OperationOutput::ChannelRead(readback)
            }
            Request::ToggleOutput { channel, enabled } => OperationOutput::OutputSet {
                channel: *channel,
                enabled: *enabled,
            },
            Request::Measure { channel } => match (readings.measured_voltage, readings.measured_current) {
                (Some(voltage), Some(current)) => OperationOutput::Measured(Measurement {
                    channel: *channel,
                    voltage,
                    current,
                }),
                _ => return Err(PsuError::Protocol("incomplete measurement".to_string())),
            },
            Request::Reset => {
                let events = self.events.clone();
                let settle = self.config.reset_settle();
                tokio::spawn(async move {
                    tokio::time::sleep(settle).await;
                    let _ = events.send(SessionEvent::Notice {
                        message: RESET_SETTLED_NOTICE.to_string(),
                    });
                });
                OperationOutput::Reset
            }
            Request::SaveUnique => {
                let commands = readings
                    .replay_list
                    .ok_or_else(|| PsuError::Protocol("no replay list produced".to_string()))?;
                self.replay_list = commands.clone();
                let saved = commands.len();
                self.status.send_modify(|status| status.saved_commands = saved);
                OperationOutput::Captured { commands }
            }
            Request::RestoreUnique => OperationOutput::Restored {
                replayed: readings.writes,
            },
            Request::PrintState => OperationOutput::StateDescribed {
                lines: readings.state_lines.unwrap_or(0),
            },
            Request::RawWrite { command } => OperationOutput::Written {
                command: command.clone(),
            },
            Request::RawQuery { command } => OperationOutput::QueryAnswered {
                command: command.clone(),
                response: readings.response.unwrap_or_default(),
            },
        };
        Ok(output)
    }

    fn resource_key(&mut self, spec: &TransportSpec) -> String {
        match spec.resource() {
            Some(resource) => resource.to_string(),
            None => {
                self.simulated_sessions += 1;
                format!("SIMULATED#{}", self.simulated_sessions)
            }
        }
    }
}

/// The session's connection and collaborators; executes I/O steps.
struct Device {
    psu: Option<Psu>,
    factory: Arc<dyn TransportFactory>,
    driver: Arc<dyn SettingsDriver>,
    status: Arc<watch::Sender<SessionStatus>>,
}

impl Device {
    fn psu(&mut self) -> PsuResult<&mut Psu> {
        self.psu
            .as_mut()
            .ok_or_else(|| PsuError::Connection("the session has no open transport".to_string()))
    }
}

async fn perform(psu: &mut Psu, call: &Call, readings: &mut Readings) -> PsuResult<()> {
    match call {
        Call::Identify => readings.identity = Some(psu.identify().await?),
        Call::SelectChannel(channel) => psu.select_channel(*channel).await?,
        Call::SetPoint {
            voltage,
            current_limit,
        } => psu.set_point(*voltage, *current_limit).await?,
        Call::SetOutput(enabled) => psu.set_output(*enabled).await?,
        Call::SetOvpMode(mode) => psu.set_ovp_mode(*mode).await?,
        Call::Reset => psu.reset().await?,
        Call::ReadVoltageSetpoint => {
            readings.voltage_setpoint = Some(psu.read_voltage_setpoint().await?)
        }
        Call::ReadCurrentSetpoint => {
            readings.current_setpoint = Some(psu.read_current_setpoint().await?)
        }
        Call::ReadOutputState => readings.output_enabled = Some(psu.read_output_state().await?),
        Call::ReadOvpMode => readings.ovp_mode = Some(psu.read_ovp_mode().await?),
        Call::MeasureVoltage => readings.measured_voltage = Some(psu.measure_voltage().await?),
        Call::MeasureCurrent => readings.measured_current = Some(psu.measure_current().await?),
        Call::Write(command) => {
            psu.write_raw(command).await?;
            readings.writes += 1;
        }
        Call::Query(command) => readings.response = Some(psu.query_raw(command).await?),
    }
    Ok(())
}

#[async_trait]
impl StepHandler for Device {
    async fn execute(&mut self, step: &Step, readings: &mut Readings) -> PsuResult<()> {
        match step {
            Step::Open(spec) => {
                if let Some(mut previous) = self.psu.take() {
                    let _ = previous.close().await;
                }
                let transport = self.factory.open(spec).await?;
                info!(transport = %transport.describe(), "transport opened");
                self.psu = Some(Psu::new(transport));
            }
            Step::Close => {
                if let Some(mut psu) = self.psu.take() {
                    info!(transport = %psu.describe(), "closing transport");
                    psu.close().await?;
                }
            }
            Step::Call(call) => perform(self.psu()?, call, readings).await?,
            Step::ComputeReplayList => {
                let driver = self.driver.clone();
                readings.replay_list = Some(driver.replay_list(self.psu()?).await?);
            }
            Step::DescribeState => {
                let driver = self.driver.clone();
                readings.state_lines = Some(driver.describe_state(self.psu()?).await?);
            }
            Step::Delay(delay) => tokio::time::sleep(*delay).await,
        }
        Ok(())
    }

    async fn rollback(&mut self, rollback: Rollback) {
        match rollback {
            Rollback::CloseTransport => {
                if let Some(mut psu) = self.psu.take() {
                    if let Err(e) = psu.close().await {
                        warn!(error = %e, "failed to close transport during rollback");
                    }
                }
            }
            Rollback::RestoreOutputControl { channel, previous } => {
                warn!(channel, previous, "reverting desired output state");
                self.status.send_modify(|status| {
                    status.desired_outputs.insert(channel, previous);
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn config() -> SessionConfig {
        SessionConfig {
            step_delay_ms: 0,
            ..SessionConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_operations_need_a_connection() {
        let session = Session::spawn(&config());
        let err = session.submit(OperationRequest::reset()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert_eq!(session.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_publishes_identity_and_history() {
        let session = Session::spawn(&config());
        let request = OperationRequest::connect(TransportSpec::Simulated, 2).unwrap();
        let report = session.run(request.clone()).await.unwrap();
        assert!(report.is_completed(), "{report}");

        let status = session.status();
        assert!(status.connected);
        assert_eq!(status.resource_key.as_deref(), Some("SIMULATED#1"));
        assert!(status.identity.unwrap().contains("HMP4040"));

        session.run(request).await.unwrap();
        let keys: Vec<String> = session
            .status()
            .devices
            .into_iter()
            .map(|device| device.resource_key)
            .collect();
        assert_eq!(keys, vec!["SIMULATED#1", "SIMULATED#2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_beyond_instrument_is_rejected_at_dequeue() {
        let session = Session::spawn(&SessionConfig {
            channel_count: 3,
            ..config()
        });
        session
            .run(OperationRequest::connect(TransportSpec::Simulated, 1).unwrap())
            .await
            .unwrap();
        let report = session
            .run(OperationRequest::select_channel(4).unwrap())
            .await
            .unwrap();
        assert_eq!(report.error_kind(), Some(ErrorKind::Validation));
        assert!(matches!(report.outcome, Outcome::Failed { step: None, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_clears_connection() {
        let session = Session::spawn(&config());
        session
            .run(OperationRequest::connect(TransportSpec::Simulated, 1).unwrap())
            .await
            .unwrap();
        let report = session.run(OperationRequest::disconnect()).await.unwrap();
        assert_eq!(report.output(), Some(&OperationOutput::Disconnected));
        let status = session.status();
        assert!(!status.connected);
        assert_eq!(status.identity, None);
        assert_eq!(status.state, OperationState::Completed {
            operation: OperationKind::Disconnect
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_the_task() {
        let session = Session::spawn(&config());
        session.shutdown().await.unwrap();
        let request = OperationRequest::connect(TransportSpec::Simulated, 1).unwrap();
        let err = session.submit(request).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionClosed);
    }
}
