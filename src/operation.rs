//! Operation requests, outputs and reports.
//!
//! An [`OperationRequest`] can only be built through its validating
//! constructors, so parameters that reach the session have already passed
//! type, range and enum checks. Nothing invalid is ever scheduled.

use crate::channel::{OvpMode, MAX_CHANNELS};
use crate::driver::ChannelReadback;
use crate::error::{ErrorKind, PsuError, PsuResult};
use crate::transport::TransportSpec;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Logical operation names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OperationKind {
    Connect,
    Disconnect,
    SelectChannel,
    ApplySettings,
    ReadChannel,
    ToggleOutput,
    Measure,
    Reset,
    SaveUnique,
    RestoreUnique,
    PrintState,
    RawWrite,
    RawQuery,
}

impl OperationKind {
    /// Whether the operation needs an active session before it may start.
    pub fn requires_connection(&self) -> bool {
        !matches!(self, OperationKind::Connect)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Request {
    Connect { spec: TransportSpec, channel: u8 },
    Disconnect,
    SelectChannel { channel: u8 },
    ApplySettings(ChannelSettings),
    ReadChannel { channel: u8 },
    ToggleOutput { channel: u8, enabled: bool },
    Measure { channel: u8 },
    Reset,
    SaveUnique,
    RestoreUnique,
    PrintState,
    RawWrite { command: String },
    RawQuery { command: String },
}

/// Parameters of an `ApplySettings` request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChannelSettings {
    pub channel: u8,
    pub voltage: f64,
    pub current_limit: f64,
    pub ovp_mode: OvpMode,
}

/// A validated request for one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRequest(pub(crate) Request);

fn check_channel(channel: u8) -> PsuResult<u8> {
    if (1..=MAX_CHANNELS).contains(&channel) {
        Ok(channel)
    } else {
        Err(PsuError::Validation(format!(
            "channel must be between 1 and {MAX_CHANNELS}, got {channel}"
        )))
    }
}

fn check_level(name: &str, value: f64) -> PsuResult<f64> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(PsuError::Validation(format!(
            "{name} must be a non-negative number, got {value}"
        )))
    }
}

fn parse_level(name: &str, text: &str) -> PsuResult<f64> {
    let value = text.trim().parse::<f64>().map_err(|_| {
        PsuError::Validation(format!("{name} must be numeric, got '{}'", text.trim()))
    })?;
    check_level(name, value)
}

fn check_command(command: &str) -> PsuResult<String> {
    let command = command.trim();
    if command.is_empty() {
        return Err(PsuError::Validation("command cannot be empty".to_string()));
    }
    Ok(command.to_string())
}

impl OperationRequest {
    /// Open `spec`, identify, then select `channel`.
    pub fn connect(spec: TransportSpec, channel: u8) -> PsuResult<Self> {
        Ok(Self(Request::Connect {
            spec,
            channel: check_channel(channel)?,
        }))
    }

    pub fn disconnect() -> Self {
        Self(Request::Disconnect)
    }

    pub fn select_channel(channel: u8) -> PsuResult<Self> {
        Ok(Self(Request::SelectChannel {
            channel: check_channel(channel)?,
        }))
    }

    /// Select, set voltage and current limit, set OVP mode.
    pub fn apply_settings(
        channel: u8,
        voltage: f64,
        current_limit: f64,
        ovp_mode: OvpMode,
    ) -> PsuResult<Self> {
        Ok(Self(Request::ApplySettings(ChannelSettings {
            channel: check_channel(channel)?,
            voltage: check_level("voltage", voltage)?,
            current_limit: check_level("current limit", current_limit)?,
            ovp_mode,
        })))
    }

    /// Like [`apply_settings`](Self::apply_settings), from form text.
    pub fn apply_settings_text(
        channel: u8,
        voltage: &str,
        current_limit: &str,
        ovp_mode: &str,
    ) -> PsuResult<Self> {
        let ovp_mode = ovp_mode
            .parse::<OvpMode>()
            .map_err(|e| PsuError::Validation(e.to_string()))?;
        Self::apply_settings(
            channel,
            parse_level("voltage", voltage)?,
            parse_level("current limit", current_limit)?,
            ovp_mode,
        )
    }

    pub fn read_channel(channel: u8) -> PsuResult<Self> {
        Ok(Self(Request::ReadChannel {
            channel: check_channel(channel)?,
        }))
    }

    pub fn toggle_output(channel: u8, enabled: bool) -> PsuResult<Self> {
        Ok(Self(Request::ToggleOutput {
            channel: check_channel(channel)?,
            enabled,
        }))
    }

    pub fn measure(channel: u8) -> PsuResult<Self> {
        Ok(Self(Request::Measure {
            channel: check_channel(channel)?,
        }))
    }

    pub fn reset() -> Self {
        Self(Request::Reset)
    }

    pub fn save_unique() -> Self {
        Self(Request::SaveUnique)
    }

    pub fn restore_unique() -> Self {
        Self(Request::RestoreUnique)
    }

    pub fn print_state() -> Self {
        Self(Request::PrintState)
    }

    /// Sends `command` verbatim. Rejects empty commands.
    pub fn raw_write(command: &str) -> PsuResult<Self> {
        Ok(Self(Request::RawWrite {
            command: check_command(command)?,
        }))
    }

    /// Sends `command` verbatim and returns the response. It must end with `?`.
    pub fn raw_query(command: &str) -> PsuResult<Self> {
        let command = check_command(command)?;
        if !command.ends_with('?') {
            return Err(PsuError::Validation(format!(
                "query must end with '?', got '{command}'"
            )));
        }
        Ok(Self(Request::RawQuery { command }))
    }

    pub fn kind(&self) -> OperationKind {
        match &self.0 {
            Request::Connect { .. } => OperationKind::Connect,
            Request::Disconnect => OperationKind::Disconnect,
            Request::SelectChannel { .. } => OperationKind::SelectChannel,
            Request::ApplySettings(_) => OperationKind::ApplySettings,
            Request::ReadChannel { .. } => OperationKind::ReadChannel,
            Request::ToggleOutput { .. } => OperationKind::ToggleOutput,
            Request::Measure { .. } => OperationKind::Measure,
            Request::Reset => OperationKind::Reset,
            Request::SaveUnique => OperationKind::SaveUnique,
            Request::RestoreUnique => OperationKind::RestoreUnique,
            Request::PrintState => OperationKind::PrintState,
            Request::RawWrite { .. } => OperationKind::RawWrite,
            Request::RawQuery { .. } => OperationKind::RawQuery,
        }
    }

    /// Channel the request targets, if any.
    pub fn channel(&self) -> Option<u8> {
        match &self.0 {
            Request::Connect { channel, .. }
            | Request::SelectChannel { channel }
            | Request::ReadChannel { channel }
            | Request::ToggleOutput { channel, .. }
            | Request::Measure { channel } => Some(*channel),
            Request::ApplySettings(settings) => Some(settings.channel),
            _ => None,
        }
    }
}

/// Measured values of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Measurement {
    pub channel: u8,
    pub voltage: f64,
    pub current: f64,
}

/// Result data of a completed operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationOutput {
    Connected {
        identity: String,
        resource_key: String,
        channel: u8,
    },
    Disconnected,
    ChannelSelected {
        channel: u8,
    },
    Applied(ChannelSettings),
    ChannelRead(ChannelReadback),
    OutputSet {
        channel: u8,
        enabled: bool,
    },
    Measured(Measurement),
    Reset,
    Captured {
        commands: Vec<String>,
    },
    Restored {
        replayed: usize,
    },
    StateDescribed {
        lines: usize,
    },
    Written {
        command: String,
    },
    QueryAnswered {
        command: String,
        response: String,
    },
}

impl fmt::Display for OperationOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationOutput::Connected {
                identity,
                resource_key,
                channel,
            } => write!(f, "[CONNECT] {resource_key}: {identity} (CH{channel})"),
            OperationOutput::Disconnected => f.write_str("[CONNECT] Disconnected"),
            OperationOutput::ChannelSelected { channel } => write!(f, "[SELECT] CH{channel}"),
            OperationOutput::Applied(s) => write!(
                f,
                "[APPLY] CH{} -> V={:.3} V, I={:.4} A, OVP={}",
                s.channel, s.voltage, s.current_limit, s.ovp_mode
            ),
            OperationOutput::ChannelRead(r) => write!(
                f,
                "[READ] CH{} -> V={:.3} V, I={:.4} A, OUT={}, OVP={}",
                r.channel,
                r.voltage_setpoint,
                r.current_setpoint,
                u8::from(r.output_enabled),
                r.ovp_mode
            ),
            OperationOutput::OutputSet { channel, enabled } => write!(
                f,
                "[OUTPUT] CH{channel} -> {}",
                if *enabled { "ON" } else { "OFF" }
            ),
            OperationOutput::Measured(m) => write!(
                f,
                "[MEAS] CH{} -> V={:.3} V, I={:.3} A",
                m.channel, m.voltage, m.current
            ),
            OperationOutput::Reset => f.write_str("[SCPI] *RST"),
            OperationOutput::Captured { commands } => {
                write!(f, "[UNIQUE] Captured {} command(s)", commands.len())?;
                for command in commands {
                    write!(f, "\n  {command}")?;
                }
                Ok(())
            }
            OperationOutput::Restored { replayed } => {
                write!(f, "[UNIQUE] Restored {replayed} saved command(s)")
            }
            OperationOutput::StateDescribed { lines } => {
                write!(f, "[STATE] Printed {lines} line(s)")
            }
            OperationOutput::Written { command } => write!(f, "[WRITE] {command}"),
            OperationOutput::QueryAnswered { command, response } => {
                write!(f, "[QUERY] {command} -> {response}")
            }
        }
    }
}

/// Terminal outcome of one operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Completed {
        output: OperationOutput,
    },
    Failed {
        error: ErrorKind,
        message: String,
        /// Index of the step that failed; `None` when the operation never started.
        step: Option<usize>,
    },
    /// Never started; the session shut down first.
    Aborted,
}

/// What happened to one submitted operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationReport {
    pub id: u64,
    pub operation: OperationKind,
    pub outcome: Outcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl OperationReport {
    pub(crate) fn failed(
        id: u64,
        operation: OperationKind,
        error: &PsuError,
        step: Option<usize>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            operation,
            outcome: Outcome::Failed {
                error: error.kind(),
                message: error.to_string(),
                step,
            },
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub(crate) fn aborted(id: u64, operation: OperationKind) -> Self {
        let now = Utc::now();
        Self {
            id,
            operation,
            outcome: Outcome::Aborted,
            started_at: now,
            finished_at: now,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, Outcome::Completed { .. })
    }

    /// Output of a completed operation.
    pub fn output(&self) -> Option<&OperationOutput> {
        match &self.outcome {
            Outcome::Completed { output } => Some(output),
            _ => None,
        }
    }

    /// Error kind of a failed operation.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.outcome {
            Outcome::Failed { error, .. } => Some(*error),
            _ => None,
        }
    }
}

impl fmt::Display for OperationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            Outcome::Completed { output } => write!(f, "{output}"),
            Outcome::Failed {
                error,
                message,
                step,
            } => {
                write!(f, "[ERROR] {} failed: {error}: {message}", self.operation)?;
                if let Some(step) = step {
                    write!(f, " (step {step})")?;
                }
                Ok(())
            }
            Outcome::Aborted => write!(f, "[ABORT] {} was not started", self.operation),
        }
    }
}
