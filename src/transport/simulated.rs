//! In-process simulator for a multi-channel SCPI power supply.
//!
//! Commands are matched by case-insensitive verb prefix against the long-form
//! mnemonics the protocol layer emits. The model is deliberately permissive:
//! unknown verbs and malformed arguments are ignored on write, and unknown
//! queries answer with an empty line. Measurements are fixed functions of the
//! commanded state, so results are deterministic.

use super::Transport;
use crate::channel::{ChannelTable, OvpMode};
use crate::error::TransportError;
use async_trait::async_trait;
use tracing::{debug, trace};

/// Identity string answered to `*IDN?`.
pub const SIMULATED_IDENTITY: &str = "Rohde&Schwarz,HMP4040,Simulated,1.00";

/// Current drawn by an enabled output on the simulated load.
pub const SIMULATED_LOAD_CURRENT: f64 = 0.01;

/// Simulated supply holding a [`ChannelTable`].
#[derive(Debug, Clone)]
pub struct SimulatedTransport {
    table: ChannelTable,
    open: bool,
}

impl SimulatedTransport {
    /// Creates a simulator with `channel_count` channels in their reset state.
    pub fn new(channel_count: u8) -> Self {
        Self {
            table: ChannelTable::new(channel_count),
            open: true,
        }
    }

    /// Read-only view of the simulated channel table.
    pub fn table(&self) -> &ChannelTable {
        &self.table
    }

    fn handle_write(&mut self, command: &str) {
        let upper = command.trim().to_ascii_uppercase();

        if upper.starts_with("*RST") {
            self.table.reset();
        } else if upper.starts_with("INST") {
            match last_token(&upper).and_then(|t| t.parse::<u8>().ok()) {
                Some(channel) if self.table.select(channel) => {}
                _ => trace!(command, "ignoring channel selection"),
            }
        } else if upper.starts_with("SOURCE:VOLTAGE") {
            if let Some(voltage) = float_argument(&upper) {
                let state = self.table.current_mut();
                state.commanded_voltage = voltage;
                state.measured_voltage = voltage;
            }
        } else if upper.starts_with("SOURCE:CURRENT") {
            if let Some(current) = float_argument(&upper) {
                self.table.current_mut().commanded_current_limit = current;
            }
        } else if upper.starts_with("OUTPUT:STATE") {
            let enabled = match last_token(&upper) {
                Some("1") => true,
                Some("0") => false,
                _ => return,
            };
            let state = self.table.current_mut();
            state.output_enabled = enabled;
            state.measured_current = if enabled { SIMULATED_LOAD_CURRENT } else { 0.0 };
        } else if upper.starts_with("VOLTAGE:PROTECTION:MODE") {
            if let Some(mode) = last_token(&upper).and_then(|t| t.parse::<OvpMode>().ok()) {
                self.table.current_mut().ovp_mode = mode;
            }
        } else {
            trace!(command, "ignoring unknown command");
        }
    }

    fn handle_query(&self, command: &str) -> String {
        let upper = command.trim().to_ascii_uppercase();
        let state = self.table.current();

        if upper.starts_with("*IDN?") {
            SIMULATED_IDENTITY.to_string()
        } else if upper.starts_with("SOURCE:VOLTAGE?") {
            format!("{:.3}", state.commanded_voltage)
        } else if upper.starts_with("SOURCE:CURRENT?") {
            format!("{:.4}", state.commanded_current_limit)
        } else if upper.starts_with("OUTPUT:STATE?") {
            if state.output_enabled { "1" } else { "0" }.to_string()
        } else if upper.starts_with("MEASURE:VOLTAGE?") {
            format!("{:.3}", state.measured_voltage)
        } else if upper.starts_with("MEASURE:CURRENT?") {
            format!("{:.3}", state.measured_current)
        } else if upper.starts_with("VOLTAGE:PROTECTION:MODE?") {
            state.ovp_mode.as_str().to_string()
        } else {
            String::new()
        }
    }
}

/// Last whitespace-separated token after the verb, if there is one.
fn last_token(command: &str) -> Option<&str> {
    let mut tokens = command.split_whitespace();
    tokens.next()?;
    tokens.last()
}

fn float_argument(command: &str) -> Option<f64> {
    last_token(command)
        .and_then(|t| t.parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn write(&mut self, command: &str) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        debug!(command, "sim write");
        self.handle_write(command);
        Ok(())
    }

    async fn query(&mut self, command: &str) -> Result<String, TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        let response = self.handle_query(command);
        debug!(command, response = %response, "sim query");
        Ok(response)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.open = false;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("SimulatedTransport({} channels)", self.table.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelState;

    #[tokio::test]
    async fn test_identity() {
        let mut sim = SimulatedTransport::new(4);
        assert_eq!(sim.query("*IDN?").await.unwrap(), SIMULATED_IDENTITY);
        assert_eq!(sim.query("*idn?").await.unwrap(), SIMULATED_IDENTITY);
    }

    #[tokio::test]
    async fn test_setters_act_on_selected_channel_only() {
        let mut sim = SimulatedTransport::new(4);
        sim.write("INSTrument:NSELect 3").await.unwrap();
        sim.write("SOURce:VOLTage 5.000").await.unwrap();
        sim.write("SOURce:CURRent 0.2500").await.unwrap();
        sim.write("OUTPut:STATe 1").await.unwrap();

        let third = sim.table().get(3).unwrap();
        assert_eq!(third.commanded_voltage, 5.0);
        assert_eq!(third.measured_voltage, 5.0);
        assert_eq!(third.commanded_current_limit, 0.25);
        assert!(third.output_enabled);
        for channel in [1, 2, 4] {
            assert_eq!(sim.table().get(channel).unwrap(), &ChannelState::default());
        }
    }

    #[tokio::test]
    async fn test_query_formats() {
        let mut sim = SimulatedTransport::new(4);
        sim.write("SOURce:VOLTage 12").await.unwrap();
        assert_eq!(sim.query("SOURce:VOLTage?").await.unwrap(), "12.000");
        assert_eq!(sim.query("SOURce:CURRent?").await.unwrap(), "0.1000");
        assert_eq!(sim.query("MEASure:VOLTage?").await.unwrap(), "12.000");
        assert_eq!(sim.query("MEASure:CURRent?").await.unwrap(), "0.000");
        sim.write("OUTPut:STATe 1").await.unwrap();
        assert_eq!(sim.query("OUTPut:STATe?").await.unwrap(), "1");
        assert_eq!(sim.query("MEASure:CURRent?").await.unwrap(), "0.010");
        assert_eq!(
            sim.query("VOLTage:PROTection:MODE?").await.unwrap(),
            "measured"
        );
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_input_is_ignored() {
        let mut sim = SimulatedTransport::new(4);
        let before = sim.table().clone();
        sim.write("SYSTem:BEEPer").await.unwrap();
        sim.write("INSTrument:NSELect 9").await.unwrap();
        sim.write("INSTrument:NSELect two").await.unwrap();
        sim.write("SOURce:VOLTage abc").await.unwrap();
        sim.write("SOURce:VOLTage").await.unwrap();
        sim.write("OUTPut:STATe 2").await.unwrap();
        sim.write("VOLTage:PROTection:MODE sometimes").await.unwrap();
        assert_eq!(sim.table(), &before);
        assert_eq!(sim.query("SYSTem:ERRor?").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_reset_restores_defaults() {
        let mut sim = SimulatedTransport::new(4);
        sim.write("INSTrument:NSELect 2").await.unwrap();
        sim.write("VOLTage:PROTection:MODE protected").await.unwrap();
        sim.write("OUTPut:STATe 1").await.unwrap();
        sim.write("*RST").await.unwrap();
        assert_eq!(sim.table(), &ChannelTable::new(4));
    }

    #[tokio::test]
    async fn test_closed_transport_refuses_calls() {
        let mut sim = SimulatedTransport::new(4);
        sim.close().await.unwrap();
        assert!(matches!(
            sim.write("*RST").await,
            Err(TransportError::NotOpen)
        ));
        assert!(matches!(
            sim.query("*IDN?").await,
            Err(TransportError::NotOpen)
        ));
    }
}
