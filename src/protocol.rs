//! Typed SCPI vocabulary for the supply.
//!
//! [`Command`] and [`Query`] render the long-form mnemonics sent on the wire;
//! [`Psu`] owns a transport and turns typed calls into those strings, decoding
//! each response into the expected type. Anything that fails to decode is a
//! [`PsuError::Protocol`].
//!
//! `Psu` also tracks which channel it last selected, including selections and
//! resets sent as verbatim text. It never re-selects on its own: every operation
//! that targets a channel selects it explicitly first.

use crate::channel::{OvpMode, MAX_CHANNELS};
use crate::error::{PsuError, PsuResult};
use crate::transport::Transport;
use std::fmt;
use tracing::debug;

/// A command that produces no response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    SelectChannel(u8),
    SetVoltage(f64),
    SetCurrent(f64),
    SetOutput(bool),
    SetOvpMode(OvpMode),
    Reset,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::SelectChannel(channel) => write!(f, "INSTrument:NSELect {channel}"),
            Command::SetVoltage(voltage) => write!(f, "SOURce:VOLTage {voltage:.3}"),
            Command::SetCurrent(current) => write!(f, "SOURce:CURRent {current:.4}"),
            Command::SetOutput(enabled) => write!(f, "OUTPut:STATe {}", u8::from(*enabled)),
            Command::SetOvpMode(mode) => write!(f, "VOLTage:PROTection:MODE {mode}"),
            Command::Reset => f.write_str("*RST"),
        }
    }
}

/// A command that produces a single-line response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    Identify,
    VoltageSetpoint,
    CurrentSetpoint,
    OutputState,
    MeasuredVoltage,
    MeasuredCurrent,
    OvpMode,
}

impl Query {
    /// Wire form of the query.
    pub fn as_str(&self) -> &'static str {
        match self {
            Query::Identify => "*IDN?",
            Query::VoltageSetpoint => "SOURce:VOLTage?",
            Query::CurrentSetpoint => "SOURce:CURRent?",
            Query::OutputState => "OUTPut:STATe?",
            Query::MeasuredVoltage => "MEASure:VOLTage?",
            Query::MeasuredCurrent => "MEASure:CURRent?",
            Query::OvpMode => "VOLTage:PROTection:MODE?",
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decodes a decimal response.
pub fn decode_float(response: &str) -> PsuResult<f64> {
    response
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| PsuError::protocol("a decimal number", response))
}

/// Decodes an output-state response (`0`/`1`, also `OFF`/`ON`).
pub fn decode_output_state(response: &str) -> PsuResult<bool> {
    let trimmed = response.trim();
    if trimmed == "1" || trimmed.eq_ignore_ascii_case("ON") {
        Ok(true)
    } else if trimmed == "0" || trimmed.eq_ignore_ascii_case("OFF") {
        Ok(false)
    } else {
        Err(PsuError::protocol("an output state (0|1)", response))
    }
}

/// Decodes an OVP mode response.
pub fn decode_ovp_mode(response: &str) -> PsuResult<OvpMode> {
    response
        .parse::<OvpMode>()
        .map_err(|_| PsuError::protocol("an OVP mode (measured|protected)", response))
}

/// Channel cursor after a verbatim write, given the cursor before it.
///
/// `None` when the write is a selection whose target cannot be read from the text.
fn cursor_after_write(command: &str, before: Option<u8>) -> Option<u8> {
    let upper = command.trim().to_ascii_uppercase();
    if upper.starts_with("*RST") {
        Some(1)
    } else if upper.starts_with("INST") {
        upper
            .split_whitespace()
            .nth(1)
            .and_then(|token| token.parse::<u8>().ok())
            .filter(|channel| (1..=MAX_CHANNELS).contains(channel))
    } else {
        before
    }
}

/// Typed protocol access to one supply over one transport.
pub struct Psu {
    transport: Box<dyn Transport>,
    selected: Option<u8>,
}

impl Psu {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            selected: None,
        }
    }

    /// Channel this handle last selected, if any.
    pub fn selected_channel(&self) -> Option<u8> {
        self.selected
    }

    pub fn describe(&self) -> String {
        self.transport.describe()
    }

    /// Sends one command.
    pub async fn send(&mut self, command: Command) -> PsuResult<()> {
        let wire = command.to_string();
        debug!(command = %wire, "send");
        self.transport.write(&wire).await?;
        match command {
            Command::SelectChannel(channel) => self.selected = Some(channel),
            Command::Reset => self.selected = Some(1),
            _ => {}
        }
        Ok(())
    }

    /// Sends one query and returns the raw response.
    pub async fn ask(&mut self, query: Query) -> PsuResult<String> {
        let response = self.transport.query(query.as_str()).await?;
        debug!(query = %query, response = %response, "ask");
        Ok(response)
    }

    pub async fn select_channel(&mut self, channel: u8) -> PsuResult<()> {
        self.send(Command::SelectChannel(channel)).await
    }

    pub async fn set_voltage(&mut self, voltage: f64) -> PsuResult<()> {
        self.send(Command::SetVoltage(voltage)).await
    }

    pub async fn set_current(&mut self, current: f64) -> PsuResult<()> {
        self.send(Command::SetCurrent(current)).await
    }

    /// Voltage then current limit, as two writes. Stops at the first failure.
    pub async fn set_point(&mut self, voltage: f64, current: f64) -> PsuResult<()> {
        self.set_voltage(voltage).await?;
        self.set_current(current).await
    }

    pub async fn set_output(&mut self, enabled: bool) -> PsuResult<()> {
        self.send(Command::SetOutput(enabled)).await
    }

    pub async fn set_ovp_mode(&mut self, mode: OvpMode) -> PsuResult<()> {
        self.send(Command::SetOvpMode(mode)).await
    }

    /// `*RST`. Leaves channel 1 selected.
    pub async fn reset(&mut self) -> PsuResult<()> {
        self.send(Command::Reset).await
    }

    /// Identity string. An empty response is a protocol error.
    pub async fn identify(&mut self) -> PsuResult<String> {
        let response = self.ask(Query::Identify).await?;
        let identity = response.trim();
        if identity.is_empty() {
            return Err(PsuError::protocol("an identity string", &response));
        }
        Ok(identity.to_string())
    }

    pub async fn read_voltage_setpoint(&mut self) -> PsuResult<f64> {
        decode_float(&self.ask(Query::VoltageSetpoint).await?)
    }

    pub async fn read_current_setpoint(&mut self) -> PsuResult<f64> {
        decode_float(&self.ask(Query::CurrentSetpoint).await?)
    }

    pub async fn read_output_state(&mut self) -> PsuResult<bool> {
        decode_output_state(&self.ask(Query::OutputState).await?)
    }

    pub async fn read_ovp_mode(&mut self) -> PsuResult<OvpMode> {
        decode_ovp_mode(&self.ask(Query::OvpMode).await?)
    }

    pub async fn measure_voltage(&mut self) -> PsuResult<f64> {
        decode_float(&self.ask(Query::MeasuredVoltage).await?)
    }

    pub async fn measure_current(&mut self) -> PsuResult<f64> {
        decode_float(&self.ask(Query::MeasuredCurrent).await?)
    }

    /// Sends `command` verbatim, following any selection or reset it makes.
    pub async fn write_raw(&mut self, command: &str) -> PsuResult<()> {
        debug!(command, "raw write");
        self.transport.write(command).await?;
        self.selected = cursor_after_write(command, self.selected);
        Ok(())
    }

    /// Sends `command` verbatim and returns the response as-is.
    pub async fn query_raw(&mut self, command: &str) -> PsuResult<String> {
        let response = self.transport.query(command).await?;
        debug!(command, response = %response, "raw query");
        Ok(response)
    }

    /// Releases the transport.
    pub async fn close(&mut self) -> PsuResult<()> {
        self.selected = None;
        self.transport.close().await?;
        Ok(())
    }
}
