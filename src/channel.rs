//! Per-channel state of a multi-channel supply.
//!
//! The simulator keeps one [`ChannelState`] per output plus a cursor naming the
//! selected channel. Every setter acts on the selected channel only.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Highest channel number the control surface offers.
pub const MAX_CHANNELS: u8 = 4;

/// Over-voltage protection mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OvpMode {
    /// Trip on the measured output voltage.
    #[default]
    Measured,
    /// Trip on the protected (programmed) level.
    Protected,
}

impl OvpMode {
    /// Wire literal used by `VOLTage:PROTection:MODE`.
    pub fn as_str(&self) -> &'static str {
        match self {
            OvpMode::Measured => "measured",
            OvpMode::Protected => "protected",
        }
    }
}

impl fmt::Display for OvpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when text is not one of the OVP literals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseOvpModeError(pub String);

impl fmt::Display for ParseOvpModeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' is not an OVP mode (measured|protected)", self.0)
    }
}

impl std::error::Error for ParseOvpModeError {}

impl FromStr for OvpMode {
    type Err = ParseOvpModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("measured") {
            Ok(OvpMode::Measured)
        } else if trimmed.eq_ignore_ascii_case("protected") {
            Ok(OvpMode::Protected)
        } else {
            Err(ParseOvpModeError(trimmed.to_string()))
        }
    }
}

/// State of one output channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelState {
    pub commanded_voltage: f64,
    pub commanded_current_limit: f64,
    pub output_enabled: bool,
    /// Mirrors `commanded_voltage` as soon as it is written.
    pub measured_voltage: f64,
    /// `0.01 * output_enabled`, a fixed linear stand-in for a load.
    pub measured_current: f64,
    pub ovp_mode: OvpMode,
}

impl ChannelState {
    /// Power-on / `*RST` state.
    pub const DEFAULT_VOLTAGE: f64 = 0.0;
    /// Power-on / `*RST` current limit.
    pub const DEFAULT_CURRENT_LIMIT: f64 = 0.1;
}

impl Default for ChannelState {
    fn default() -> Self {
        Self {
            commanded_voltage: Self::DEFAULT_VOLTAGE,
            commanded_current_limit: Self::DEFAULT_CURRENT_LIMIT,
            output_enabled: false,
            measured_voltage: 0.0,
            measured_current: 0.0,
            ovp_mode: OvpMode::Measured,
        }
    }
}

/// Channel table plus the selected-channel cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelTable {
    channels: Vec<ChannelState>,
    selected: u8,
}

impl ChannelTable {
    /// Creates `count` channels in their reset state with channel 1 selected.
    pub fn new(count: u8) -> Self {
        Self {
            channels: vec![ChannelState::default(); usize::from(count.max(1))],
            selected: 1,
        }
    }

    /// Number of channels.
    pub fn len(&self) -> u8 {
        // Constructed from a u8 count.
        self.channels.len() as u8
    }

    /// Always false; a table has at least one channel.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Currently selected channel number (1-based).
    pub fn selected(&self) -> u8 {
        self.selected
    }

    /// Moves the cursor. Returns false and leaves it alone when `channel` does not exist.
    pub fn select(&mut self, channel: u8) -> bool {
        if self.contains(channel) {
            self.selected = channel;
            true
        } else {
            false
        }
    }

    /// Whether `channel` names an existing channel.
    pub fn contains(&self, channel: u8) -> bool {
        channel >= 1 && channel <= self.len()
    }

    /// State of `channel`, if it exists.
    pub fn get(&self, channel: u8) -> Option<&ChannelState> {
        if self.contains(channel) {
            self.channels.get(usize::from(channel - 1))
        } else {
            None
        }
    }

    /// State of the selected channel.
    pub fn current(&self) -> &ChannelState {
        &self.channels[usize::from(self.selected - 1)]
    }

    /// Mutable state of the selected channel.
    pub fn current_mut(&mut self) -> &mut ChannelState {
        let index = usize::from(self.selected - 1);
        &mut self.channels[index]
    }

    /// Restores every channel to its reset state and selects channel 1.
    pub fn reset(&mut self) {
        for channel in &mut self.channels {
            *channel = ChannelState::default();
        }
        self.selected = 1;
    }

    /// Iterates `(channel number, state)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (u8, &ChannelState)> {
        self.channels
            .iter()
            .enumerate()
            .map(|(i, state)| (i as u8 + 1, state))
    }
}
