//! Transports carry protocol strings to an instrument and bring responses back.
//!
//! This module contains the [`Transport`] trait and its implementations, providing
//! the low-level I/O seam between the protocol layer and whatever sits on the other
//! end: the in-process simulator, a serial port, or a VISA resource.
//!
//! Every call is atomic from the caller's point of view. Real transports bound each
//! `write`/`query` with the configured timeout; the simulator answers immediately.

pub mod fault;
pub mod serial;
pub mod simulated;
pub mod visa;

pub use fault::{FaultControl, FaultyFactory, FaultyTransport, WireCall};
pub use serial::SerialTransport;
pub use simulated::SimulatedTransport;
pub use visa::VisaTransport;

use crate::error::TransportError;
use async_trait::async_trait;
use std::time::Duration;

/// Command/response link to one instrument.
#[async_trait]
pub trait Transport: Send {
    /// Sends a command that produces no response.
    async fn write(&mut self, command: &str) -> Result<(), TransportError>;

    /// Sends a command and returns the (trimmed) response line.
    async fn query(&mut self, command: &str) -> Result<String, TransportError>;

    /// Releases the underlying resource. Further calls fail with `NotOpen`.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Human-readable description for logs, e.g. `SerialTransport(/dev/ttyUSB0 @ 9600)`.
    fn describe(&self) -> String;
}

/// Which transport to open, with its connection parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportSpec {
    /// In-process simulator.
    Simulated,
    /// Serial port.
    Serial {
        port: String,
        baud_rate: u32,
        timeout: Duration,
    },
    /// VISA resource such as `ASRL6::INSTR` or `TCPIP0::192.168.1.10::INSTR`.
    Visa { resource: String, timeout: Duration },
}

impl TransportSpec {
    /// Whether this spec opens the simulator.
    pub fn is_simulated(&self) -> bool {
        matches!(self, TransportSpec::Simulated)
    }

    /// Resource string for real transports, `None` for the simulator.
    pub fn resource(&self) -> Option<&str> {
        match self {
            TransportSpec::Simulated => None,
            TransportSpec::Serial { port, .. } => Some(port),
            TransportSpec::Visa { resource, .. } => Some(resource),
        }
    }
}

/// Opens transports for `connect`.
///
/// The session holds one factory; tests substitute a [`FaultyFactory`] to inject
/// failures into whatever gets opened.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Opens the transport described by `spec`.
    async fn open(&self, spec: &TransportSpec) -> Result<Box<dyn Transport>, TransportError>;
}

/// Factory for the built-in transports.
#[derive(Debug, Clone)]
pub struct DefaultTransportFactory {
    channel_count: u8,
}

impl DefaultTransportFactory {
    /// `channel_count` sizes the simulator's channel table.
    pub fn new(channel_count: u8) -> Self {
        Self { channel_count }
    }
}

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn open(&self, spec: &TransportSpec) -> Result<Box<dyn Transport>, TransportError> {
        match spec {
            TransportSpec::Simulated => Ok(Box::new(SimulatedTransport::new(self.channel_count))),
            TransportSpec::Serial {
                port,
                baud_rate,
                timeout,
            } => {
                let transport = SerialTransport::open(port, *baud_rate, *timeout).await?;
                Ok(Box::new(transport))
            }
            TransportSpec::Visa { resource, timeout } => {
                let transport = VisaTransport::open(resource, *timeout).await?;
                Ok(Box::new(transport))
            }
        }
    }
}
