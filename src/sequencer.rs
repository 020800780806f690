//! Staged operation sequencer.
//!
//! Every logical operation is turned into a [`Plan`]: an ordered list of
//! [`Step`]s, each either one protocol call, one external collaborator call, or
//! a timed delay with no I/O. [`Sequencer::run`] executes a plan strictly in
//! order inside the session task. It awaits each step to completion before the
//! next is issued, sleeps between steps where the plan says so, and stops at
//! the first failure. The caller is never blocked: it holds a ticket while the
//! session task does the work.
//!
//! ## State machine
//!
//! ```text
//! Idle ──start──▶ Running(0) ──step ok──▶ Running(1) … ──last ok──▶ Completed
//!                      │                       │
//!                      └──────step failed──────┴──▶ (rollback) ──▶ Failed
//! ```
//!
//! `Aborted` is reported for requests that were queued but never started
//! because the session shut down.
//!
//! A plan may register a [`Rollback`]. It runs to completion before the
//! failure is reported. Operations without one are left as the device ended
//! up; in particular a voltage written before a failed current-limit write in
//! `ApplySettings` stays applied.

use crate::channel::OvpMode;
use crate::error::{ErrorKind, PsuError, PsuResult};
use crate::operation::{OperationKind, OperationRequest, Request};
use crate::session::{SessionEvent, SessionStatus};
use crate::transport::TransportSpec;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

/// Lifecycle of one operation instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OperationState {
    #[default]
    Idle,
    Running {
        operation: OperationKind,
        step: usize,
        total: usize,
    },
    Completed {
        operation: OperationKind,
    },
    Failed {
        operation: OperationKind,
        error: ErrorKind,
    },
    Aborted {
        operation: OperationKind,
    },
}

impl OperationState {
    pub fn is_running(&self) -> bool {
        matches!(self, OperationState::Running { .. })
    }
}

/// One protocol call.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Identify,
    SelectChannel(u8),
    /// Two writes, voltage then current limit.
    SetPoint { voltage: f64, current_limit: f64 },
    SetOutput(bool),
    SetOvpMode(OvpMode),
    Reset,
    ReadVoltageSetpoint,
    ReadCurrentSetpoint,
    ReadOutputState,
    ReadOvpMode,
    MeasureVoltage,
    MeasureCurrent,
    /// Verbatim write (replayed or raw command).
    Write(String),
    /// Verbatim query.
    Query(String),
}

/// One unit of work in a plan.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Open the transport and make it the session's.
    Open(TransportSpec),
    /// Close the session's transport.
    Close,
    Call(Call),
    /// External "compute replay list".
    ComputeReplayList,
    /// External "describe full state".
    DescribeState,
    /// Wait with no I/O.
    Delay(Duration),
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Open(spec) => match spec.resource() {
                Some(resource) => write!(f, "open {resource}"),
                None => f.write_str("open simulator"),
            },
            Step::Close => f.write_str("close"),
            Step::Call(call) => write!(f, "{call:?}"),
            Step::ComputeReplayList => f.write_str("compute replay list"),
            Step::DescribeState => f.write_str("describe state"),
            Step::Delay(delay) => write!(f, "wait {delay:?}"),
        }
    }
}

/// Compensation registered for a plan, run when any of its steps fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rollback {
    /// Close whatever transport the plan opened.
    CloseTransport,
    /// Put the desired output state of `channel` back to `previous`.
    RestoreOutputControl { channel: u8, previous: bool },
}

/// Ordered steps of one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    operation: OperationKind,
    steps: Vec<Step>,
    rollback: Option<Rollback>,
}

impl Plan {
    pub fn new(operation: OperationKind) -> Self {
        Self {
            operation,
            steps: Vec::new(),
            rollback: None,
        }
    }

    /// Appends a step.
    pub fn then(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Appends a protocol call.
    pub fn call(self, call: Call) -> Self {
        self.then(Step::Call(call))
    }

    pub fn with_rollback(mut self, rollback: Rollback) -> Self {
        self.rollback = Some(rollback);
        self
    }

    pub fn operation(&self) -> OperationKind {
        self.operation
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn rollback(&self) -> Option<Rollback> {
        self.rollback
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Session facts a plan depends on.
#[derive(Debug, Clone, Copy)]
pub struct PlanContext<'a> {
    pub connected: bool,
    pub replay_list: &'a [String],
    pub reset_settle: Duration,
    pub replay_interval: Duration,
    /// Desired output state of the toggled channel before the toggle.
    pub previous_output: bool,
}

/// Builds the plan for `request`.
///
/// # Errors
///
/// `Precondition` for a restore with nothing captured.
pub fn plan_for(request: &OperationRequest, ctx: &PlanContext<'_>) -> PsuResult<Plan> {
    let plan = Plan::new(request.kind());
    let plan = match &request.0 {
        Request::Connect { spec, channel } => {
            let plan = if ctx.connected { plan.then(Step::Close) } else { plan };
            plan.then(Step::Open(spec.clone()))
                .call(Call::Identify)
                .call(Call::SelectChannel(*channel))
                .with_rollback(Rollback::CloseTransport)
        }
        Request::Disconnect => plan.then(Step::Close),
        Request::SelectChannel { channel } => plan.call(Call::SelectChannel(*channel)),
        Request::ApplySettings(settings) => plan
            .call(Call::SelectChannel(settings.channel))
            .call(Call::SetPoint {
                voltage: settings.voltage,
                current_limit: settings.current_limit,
            })
            .call(Call::SetOvpMode(settings.ovp_mode)),
        Request::ReadChannel { channel } => plan
            .call(Call::SelectChannel(*channel))
            .call(Call::ReadVoltageSetpoint)
            .call(Call::ReadCurrentSetpoint)
            .call(Call::ReadOutputState)
            .call(Call::ReadOvpMode),
        Request::ToggleOutput { channel, enabled } => plan
            .call(Call::SelectChannel(*channel))
            .call(Call::SetOutput(*enabled))
            .with_rollback(Rollback::RestoreOutputControl {
                channel: *channel,
                previous: ctx.previous_output,
            }),
        Request::Measure { channel } => plan
            .call(Call::SelectChannel(*channel))
            .call(Call::MeasureVoltage)
            .call(Call::MeasureCurrent),
        Request::Reset => plan.call(Call::Reset),
        Request::SaveUnique => plan.then(Step::ComputeReplayList),
        Request::RestoreUnique => {
            if ctx.replay_list.is_empty() {
                return Err(PsuError::Precondition(
                    "no saved settings; run SaveUnique first".to_string(),
                ));
            }
            let mut plan = plan.call(Call::Reset).then(Step::Delay(ctx.reset_settle));
            for (index, command) in ctx.replay_list.iter().enumerate() {
                if index > 0 {
                    plan = plan.then(Step::Delay(ctx.replay_interval));
                }
                plan = plan.call(Call::Write(command.clone()));
            }
            plan
        }
        Request::PrintState => plan.then(Step::DescribeState),
        Request::RawWrite { command } => plan.call(Call::Write(command.clone())),
        Request::RawQuery { command } => plan.call(Call::Query(command.clone())),
    };
    Ok(plan)
}

/// Values collected while a plan runs. Turned into an output only on completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Readings {
    pub identity: Option<String>,
    pub voltage_setpoint: Option<f64>,
    pub current_setpoint: Option<f64>,
    pub output_enabled: Option<bool>,
    pub ovp_mode: Option<OvpMode>,
    pub measured_voltage: Option<f64>,
    pub measured_current: Option<f64>,
    pub response: Option<String>,
    pub replay_list: Option<Vec<String>>,
    pub state_lines: Option<usize>,
    /// Verbatim writes issued.
    pub writes: usize,
}

/// Performs the I/O steps of a plan.
#[async_trait]
pub trait StepHandler: Send {
    /// Executes one step, recording anything it reads. `Delay` steps only wait.
    async fn execute(&mut self, step: &Step, readings: &mut Readings) -> PsuResult<()>;

    /// Runs a plan's compensation after a failed step.
    async fn rollback(&mut self, rollback: Rollback);
}

/// A step failed; the plan stopped there.
#[derive(Debug)]
pub struct StepFailure {
    pub step: usize,
    pub error: PsuError,
}

/// Runs plans, publishing progress to the session's status and event channels.
pub struct Sequencer {
    step_delay: Duration,
    status: Arc<watch::Sender<SessionStatus>>,
    events: broadcast::Sender<SessionEvent>,
}

impl Sequencer {
    pub fn new(
        step_delay: Duration,
        status: Arc<watch::Sender<SessionStatus>>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            step_delay,
            status,
            events,
        }
    }

    fn set_state(&self, state: OperationState) {
        self.status.send_modify(|status| status.state = state);
    }

    /// Executes `plan` step by step.
    ///
    /// Leaves the state at `Running` on return; the session settles the
    /// terminal state once it has turned the readings into a report.
    pub async fn run<H>(
        &self,
        id: u64,
        plan: Plan,
        handler: &mut H,
    ) -> Result<Readings, StepFailure>
    where
        H: StepHandler + ?Sized,
    {
        let operation = plan.operation();
        let total = plan.len();
        self.set_state(OperationState::Running {
            operation,
            step: 0,
            total,
        });
        let _ = self.events.send(SessionEvent::Started {
            id,
            operation,
            steps: total,
        });

        if self.step_delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.step_delay).await;
        }

        let mut readings = Readings::default();
        for (index, step) in plan.steps().iter().enumerate() {
            self.set_state(OperationState::Running {
                operation,
                step: index,
                total,
            });
            debug!(%operation, index, %step, "step");

            if let Err(error) = handler.execute(step, &mut readings).await {
                warn!(%operation, index, %step, error = %error, "step failed");
                if let Some(rollback) = plan.rollback() {
                    debug!(%operation, ?rollback, "rolling back");
                    handler.rollback(rollback).await;
                }
                return Err(StepFailure { step: index, error });
            }

            let _ = self.events.send(SessionEvent::StepCompleted {
                id,
                operation,
                index,
                total,
                step: step.to_string(),
            });
        }
        Ok(readings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn ctx(replay_list: &[String]) -> PlanContext<'_> {
        PlanContext {
            connected: true,
            replay_list,
            reset_settle: Duration::from_millis(300),
            replay_interval: Duration::from_millis(30),
            previous_output: false,
        }
    }

    /// Records steps; fails at `fail_at`.
    #[derive(Default)]
    struct Recorder {
        executed: Vec<Step>,
        fail_at: Option<usize>,
        rolled_back: Vec<Rollback>,
    }

    #[async_trait]
    impl StepHandler for Recorder {
        async fn execute(&mut self, step: &Step, _readings: &mut Readings) -> PsuResult<()> {
            if self.fail_at == Some(self.executed.len()) {
                return Err(PsuError::Protocol("boom".to_string()));
            }
            if let Step::Delay(delay) = step {
                tokio::time::sleep(*delay).await;
            }
            self.executed.push(step.clone());
            Ok(())
        }

        async fn rollback(&mut self, rollback: Rollback) {
            self.rolled_back.push(rollback);
        }
    }

    fn sequencer() -> (Sequencer, watch::Receiver<SessionStatus>) {
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());
        let (events, _) = broadcast::channel(16);
        (
            Sequencer::new(Duration::from_millis(10), Arc::new(status_tx), events),
            status_rx,
        )
    }

    #[test]
    fn test_apply_settings_plan_order() {
        let request = OperationRequest::apply_settings(2, 5.0, 0.2, OvpMode::Protected).unwrap();
        let plan = plan_for(&request, &ctx(&[])).unwrap();
        assert_eq!(
            plan.steps(),
            &[
                Step::Call(Call::SelectChannel(2)),
                Step::Call(Call::SetPoint {
                    voltage: 5.0,
                    current_limit: 0.2
                }),
                Step::Call(Call::SetOvpMode(OvpMode::Protected)),
            ]
        );
        assert_eq!(plan.rollback(), None);
    }

    #[test]
    fn test_restore_plan_interleaves_delays() {
        let list = vec!["SOURce:VOLTage 7.5".to_string(), "OUTPut:STATe 1".to_string()];
        let plan = plan_for(&OperationRequest::restore_unique(), &ctx(&list)).unwrap();
        assert_eq!(
            plan.steps(),
            &[
                Step::Call(Call::Reset),
                Step::Delay(Duration::from_millis(300)),
                Step::Call(Call::Write("SOURce:VOLTage 7.5".to_string())),
                Step::Delay(Duration::from_millis(30)),
                Step::Call(Call::Write("OUTPut:STATe 1".to_string())),
            ]
        );
    }

    #[test]
    fn test_restore_with_empty_list_is_precondition_failure() {
        let err = plan_for(&OperationRequest::restore_unique(), &ctx(&[])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[test]
    fn test_connect_closes_existing_session_first() {
        let request = OperationRequest::connect(TransportSpec::Simulated, 3).unwrap();
        let plan = plan_for(&request, &ctx(&[])).unwrap();
        assert_eq!(plan.steps()[0], Step::Close);
        assert_eq!(plan.steps()[1], Step::Open(TransportSpec::Simulated));
        assert_eq!(plan.rollback(), Some(Rollback::CloseTransport));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_executes_every_step_in_order() {
        let (sequencer, status) = sequencer();
        let request = OperationRequest::read_channel(3).unwrap();
        let plan = plan_for(&request, &ctx(&[])).unwrap();
        let expected = plan.steps().to_vec();

        let mut recorder = Recorder::default();
        sequencer.run(1, plan, &mut recorder).await.unwrap();
        assert_eq!(recorder.executed, expected);
        assert!(recorder.rolled_back.is_empty());
        assert!(status.borrow().state.is_running());
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_run_stops_at_first_failure_and_rolls_back() {
        let (sequencer, _status) = sequencer();
        let request = OperationRequest::toggle_output(2, true).unwrap();
        let plan = plan_for(&request, &ctx(&[])).unwrap();

        let mut recorder = Recorder {
            fail_at: Some(1),
            ..Recorder::default()
        };
        let failure = sequencer.run(1, plan, &mut recorder).await.unwrap_err();
        assert_eq!(failure.step, 1);
        assert_eq!(recorder.executed, vec![Step::Call(Call::SelectChannel(2))]);
        assert_eq!(
            recorder.rolled_back,
            vec![Rollback::RestoreOutputControl {
                channel: 2,
                previous: false
            }]
        );
        assert!(logs_contain("step failed"));
        assert!(logs_contain("rolling back"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_steps_take_their_time() {
        let (sequencer, _status) = sequencer();
        let list = vec!["OUTPut:STATe 1".to_string(), "OUTPut:STATe 0".to_string()];
        let plan = plan_for(&OperationRequest::restore_unique(), &ctx(&list)).unwrap();

        let start = tokio::time::Instant::now();
        let mut recorder = Recorder::default();
        sequencer.run(1, plan, &mut recorder).await.unwrap();
        // 10 ms lead-in, 300 ms settle, 30 ms between the two writes.
        assert_eq!(start.elapsed(), Duration::from_millis(340));
        assert_eq!(recorder.executed.len(), 5);
    }
}
