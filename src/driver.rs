//! Settings-diff and state-dump collaborator.
//!
//! The sequencer treats these as two opaque calls: "compute replay list" and
//! "describe full state". [`SettingsDriver`] is the seam; [`DefaultsDiffDriver`]
//! is the built-in implementation, which walks every channel and compares its
//! setpoints against the reset defaults.
//!
//! Both calls move the instrument's channel cursor while they walk. They put it
//! back on the channel the [`Psu`] handle had selected before the call, which
//! includes selections made by verbatim writes.

use crate::channel::{ChannelState, OvpMode};
use crate::error::{PsuResult, TransportError};
use crate::protocol::{Command, Psu};
use async_trait::async_trait;
use serde::Serialize;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// External collaborator consumed by `SaveUnique` and `PrintState`.
#[async_trait]
pub trait SettingsDriver: Send + Sync {
    /// Ordered write-form commands that reproduce every non-default setting.
    async fn replay_list(&self, psu: &mut Psu) -> PsuResult<Vec<String>>;

    /// Emits a full human-readable snapshot. Returns the number of lines emitted.
    async fn describe_state(&self, psu: &mut Psu) -> PsuResult<usize>;
}

/// Setpoints and measurements of one channel, as read back from the instrument.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelReadback {
    pub channel: u8,
    pub voltage_setpoint: f64,
    pub current_setpoint: f64,
    pub output_enabled: bool,
    pub ovp_mode: OvpMode,
}

/// Readbacks are decimal strings with at most four places.
const READBACK_TOLERANCE: f64 = 5e-5;

fn differs(value: f64, default: f64) -> bool {
    (value - default).abs() > READBACK_TOLERANCE
}

impl ChannelReadback {
    async fn read(psu: &mut Psu, channel: u8) -> PsuResult<Self> {
        psu.select_channel(channel).await?;
        Ok(Self {
            channel,
            voltage_setpoint: psu.read_voltage_setpoint().await?,
            current_setpoint: psu.read_current_setpoint().await?,
            output_enabled: psu.read_output_state().await?,
            ovp_mode: psu.read_ovp_mode().await?,
        })
    }

    /// Commands that move a reset channel to this state; empty when nothing differs.
    pub fn diff_from_defaults(&self) -> Vec<String> {
        let mut commands = Vec::new();
        if differs(self.voltage_setpoint, ChannelState::DEFAULT_VOLTAGE) {
            commands.push(Command::SetVoltage(self.voltage_setpoint).to_string());
        }
        if differs(self.current_setpoint, ChannelState::DEFAULT_CURRENT_LIMIT) {
            commands.push(Command::SetCurrent(self.current_setpoint).to_string());
        }
        if self.ovp_mode != OvpMode::default() {
            commands.push(Command::SetOvpMode(self.ovp_mode).to_string());
        }
        if self.output_enabled {
            commands.push(Command::SetOutput(true).to_string());
        }
        if !commands.is_empty() {
            commands.insert(0, Command::SelectChannel(self.channel).to_string());
        }
        commands
    }
}

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Diffs every channel against the reset defaults.
pub struct DefaultsDiffDriver {
    channel_count: u8,
    writer: SharedWriter,
}

impl DefaultsDiffDriver {
    /// Driver for `channel_count` channels, describing state on stdout.
    pub fn new(channel_count: u8) -> Self {
        Self::with_writer(channel_count, Box::new(std::io::stdout()))
    }

    /// Driver that writes state descriptions to `writer`.
    pub fn with_writer(channel_count: u8, writer: Box<dyn Write + Send>) -> Self {
        Self {
            channel_count,
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    async fn restore_cursor(psu: &mut Psu, previous: Option<u8>) -> PsuResult<()> {
        if let Some(channel) = previous {
            if psu.selected_channel() != Some(channel) {
                psu.select_channel(channel).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SettingsDriver for DefaultsDiffDriver {
    async fn replay_list(&self, psu: &mut Psu) -> PsuResult<Vec<String>> {
        let previous = psu.selected_channel();
        let mut commands = Vec::new();
        for channel in 1..=self.channel_count {
            let readback = ChannelReadback::read(psu, channel).await?;
            commands.extend(readback.diff_from_defaults());
        }
        Self::restore_cursor(psu, previous).await?;
        debug!(count = commands.len(), "computed replay list");
        Ok(commands)
    }

    async fn describe_state(&self, psu: &mut Psu) -> PsuResult<usize> {
        let previous = psu.selected_channel();
        let mut lines = Vec::with_capacity(usize::from(self.channel_count) + 1);
        lines.push(format!("Instrument: {}", psu.identify().await?));
        for channel in 1..=self.channel_count {
            let readback = ChannelReadback::read(psu, channel).await?;
            let measured_voltage = psu.measure_voltage().await?;
            let measured_current = psu.measure_current().await?;
            lines.push(format!(
                "CH{}: VSET={:.3} V ISET={:.4} A OUT={} OVP={} VMEAS={:.3} V IMEAS={:.3} A",
                channel,
                readback.voltage_setpoint,
                readback.current_setpoint,
                u8::from(readback.output_enabled),
                readback.ovp_mode,
                measured_voltage,
                measured_current,
            ));
        }
        Self::restore_cursor(psu, previous).await?;

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        for line in &lines {
            writeln!(writer, "{line}").map_err(TransportError::Io)?;
        }
        writer.flush().map_err(TransportError::Io)?;
        Ok(lines.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{FaultControl, FaultyTransport, SimulatedTransport};

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn psu() -> (Psu, FaultControl) {
        let control = FaultControl::new();
        let transport = FaultyTransport::new(Box::new(SimulatedTransport::new(4)), control.clone());
        (Psu::new(Box::new(transport)), control)
    }

    #[tokio::test]
    async fn test_defaults_produce_empty_replay_list() {
        let (mut psu, _) = psu();
        let driver = DefaultsDiffDriver::new(4);
        assert!(driver.replay_list(&mut psu).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replay_list_contains_only_differences() {
        let (mut psu, _) = psu();
        psu.select_channel(2).await.unwrap();
        psu.set_voltage(7.5).await.unwrap();
        psu.set_output(true).await.unwrap();
        psu.select_channel(4).await.unwrap();
        psu.set_current(0.25).await.unwrap();
        psu.set_ovp_mode(OvpMode::Protected).await.unwrap();
        psu.select_channel(3).await.unwrap();

        let driver = DefaultsDiffDriver::new(4);
        let list = driver.replay_list(&mut psu).await.unwrap();
        assert_eq!(
            list,
            vec![
                "INSTrument:NSELect 2",
                "SOURce:VOLTage 7.500",
                "OUTPut:STATe 1",
                "INSTrument:NSELect 4",
                "SOURce:CURRent 0.2500",
                "VOLTage:PROTection:MODE protected",
            ]
        );
        assert_eq!(psu.selected_channel(), Some(3));
    }

    #[tokio::test]
    async fn test_describe_state_writes_one_line_per_channel() {
        let (mut psu, _) = psu();
        let buffer = Buffer::default();
        let driver = DefaultsDiffDriver::with_writer(4, Box::new(buffer.clone()));
        let lines = driver.describe_state(&mut psu).await.unwrap();
        assert_eq!(lines, 5);

        let text = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        assert!(text.starts_with("Instrument: Rohde&Schwarz,HMP4040"));
        assert!(text.contains("CH4: VSET=0.000 V ISET=0.1000 A OUT=0 OVP=measured"));
    }

    #[tokio::test]
    async fn test_replay_list_propagates_protocol_errors() {
        let (mut psu, control) = psu();
        control.drop_next_response("SOURce:CURRent?");
        let driver = DefaultsDiffDriver::new(4);
        assert!(driver.replay_list(&mut psu).await.is_err());
    }
}
