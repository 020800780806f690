//! Serial-port transport.
//!
//! Wraps the `serialport` crate. Blocking port I/O runs on Tokio's blocking pool
//! with the port behind an `Arc<Mutex>`, and every exchange is bounded by the
//! configured timeout. Commands are terminated with `\n`; responses are read up
//! to the next `\n`. Input left over from an earlier exchange, such as a reply
//! that arrived after its query timed out, is discarded before each query.
//!
//! Without the `instrument_serial` feature the type still exists, but opening it
//! fails with [`TransportError::FeatureDisabled`].

use super::Transport;
use crate::error::TransportError;
use async_trait::async_trait;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};
use tracing::debug;

#[cfg(feature = "instrument_serial")]
use std::sync::Arc;
#[cfg(feature = "instrument_serial")]
use tokio::sync::Mutex;

/// Internal read poll interval of the port; the exchange deadline is enforced separately.
#[cfg(feature = "instrument_serial")]
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Byte stream to a line-oriented instrument.
#[cfg_attr(not(feature = "instrument_serial"), allow(dead_code))]
trait Line: Read + Write {
    /// Drops everything received but not yet read.
    fn discard_input(&mut self) -> io::Result<()>;
}

#[cfg(feature = "instrument_serial")]
impl Line for Box<dyn serialport::SerialPort> {
    fn discard_input(&mut self) -> io::Result<()> {
        self.clear(serialport::ClearBuffer::Input).map_err(io::Error::from)
    }
}

/// One write, plus one response line when `expect_reply` is set.
#[cfg_attr(not(feature = "instrument_serial"), allow(dead_code))]
fn exchange_line<L: Line + ?Sized>(
    line: &mut L,
    command: &str,
    expect_reply: bool,
    timeout: Duration,
) -> Result<Option<String>, TransportError> {
    if expect_reply {
        line.discard_input()?;
    }
    line.write_all(format!("{command}\n").as_bytes())?;
    line.flush()?;
    if !expect_reply {
        return Ok(None);
    }

    let deadline = Instant::now() + timeout;
    let mut response = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if Instant::now() >= deadline {
            return Err(TransportError::Timeout(timeout));
        }
        match line.read(&mut byte) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            Ok(_) if byte[0] == b'\n' => break,
            Ok(_) => response.push(byte[0]),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Some(String::from_utf8_lossy(&response).trim().to_string()))
}

/// Serial link to an instrument.
pub struct SerialTransport {
    port_name: String,
    baud_rate: u32,
    timeout: Duration,
    #[cfg(feature = "instrument_serial")]
    port: Option<Arc<Mutex<Box<dyn serialport::SerialPort>>>>,
}

impl SerialTransport {
    /// Opens `port_name` at `baud_rate`.
    ///
    /// # Errors
    ///
    /// `InvalidResource` for an empty port name, `Io` if the port cannot be opened,
    /// `FeatureDisabled` when built without serial support.
    pub async fn open(
        port_name: &str,
        baud_rate: u32,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let port_name = port_name.trim();
        if port_name.is_empty() {
            return Err(TransportError::InvalidResource(port_name.to_string()));
        }

        #[cfg(feature = "instrument_serial")]
        {
            let name = port_name.to_string();
            let port = tokio::task::spawn_blocking(move || {
                serialport::new(&name, baud_rate)
                    .timeout(POLL_INTERVAL)
                    .open()
            })
            .await
            .map_err(|e| TransportError::TaskFailed(e.to_string()))?
            .map_err(|e| TransportError::Io(e.into()))?;

            tracing::info!(port = port_name, baud_rate, "serial port opened");
            Ok(Self {
                port_name: port_name.to_string(),
                baud_rate,
                timeout,
                port: Some(Arc::new(Mutex::new(port))),
            })
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = (baud_rate, timeout);
            Err(TransportError::FeatureDisabled("Serial", "instrument_serial"))
        }
    }

    #[cfg(feature = "instrument_serial")]
    async fn exchange(
        &self,
        command: &str,
        expect_reply: bool,
    ) -> Result<Option<String>, TransportError> {
        let port = self.port.as_ref().ok_or(TransportError::NotOpen)?.clone();
        let command = command.to_string();
        let timeout = self.timeout;

        let task = tokio::task::spawn_blocking(move || {
            let mut guard = port.blocking_lock();
            exchange_line(&mut *guard, &command, expect_reply, timeout)
        });

        // The blocking loop has its own deadline; this bounds a stuck write.
        tokio::time::timeout(timeout + POLL_INTERVAL, task)
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
            .map_err(|e| TransportError::TaskFailed(e.to_string()))?
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn write(&mut self, command: &str) -> Result<(), TransportError> {
        debug!(port = %self.port_name, command, "serial write");
        #[cfg(feature = "instrument_serial")]
        {
            self.exchange(command, false).await.map(|_| ())
        }
        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(TransportError::NotOpen)
        }
    }

    async fn query(&mut self, command: &str) -> Result<String, TransportError> {
        #[cfg(feature = "instrument_serial")]
        {
            let response = self.exchange(command, true).await?.unwrap_or_default();
            debug!(port = %self.port_name, command, response = %response, "serial query");
            Ok(response)
        }
        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = command;
            Err(TransportError::NotOpen)
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        #[cfg(feature = "instrument_serial")]
        if self.port.take().is_some() {
            tracing::info!(port = %self.port_name, "serial port closed");
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!(
            "SerialTransport({} @ {}, timeout {:?})",
            self.port_name, self.baud_rate, self.timeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Device that answers every line it receives with `reply`.
    struct Echoing {
        reply: Option<&'static str>,
        input: VecDeque<u8>,
        sent: Vec<u8>,
    }

    impl Echoing {
        fn new(reply: Option<&'static str>, stale: &str) -> Self {
            Self {
                reply,
                input: stale.bytes().collect(),
                sent: Vec::new(),
            }
        }
    }

    impl Read for Echoing {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.input.pop_front() {
                Some(byte) => {
                    buf[0] = byte;
                    Ok(1)
                }
                None => Err(io::ErrorKind::TimedOut.into()),
            }
        }
    }

    impl Write for Echoing {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.sent.extend_from_slice(buf);
            if buf.ends_with(b"\n") {
                if let Some(reply) = self.reply {
                    self.input.extend(reply.bytes());
                }
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Line for Echoing {
        fn discard_input(&mut self) -> io::Result<()> {
            self.input.clear();
            Ok(())
        }
    }

    #[test]
    fn test_query_ignores_reply_left_from_timed_out_query() {
        let mut device = Echoing::new(Some("0.1000\n"), "5.000\n");
        let timeout = Duration::from_secs(1);
        let response = exchange_line(&mut device, "SOURce:CURRent?", true, timeout).unwrap();
        assert_eq!(response.as_deref(), Some("0.1000"));
        assert_eq!(device.sent, b"SOURce:CURRent?\n");
    }

    #[test]
    fn test_write_leaves_pending_input_alone() {
        let mut device = Echoing::new(None, "5.000\n");
        let timeout = Duration::from_secs(1);
        let response = exchange_line(&mut device, "OUTPut:STATe 1", false, timeout).unwrap();
        assert_eq!(response, None);
        assert_eq!(device.input.len(), 6);
    }

    #[test]
    fn test_silent_device_times_out() {
        let mut device = Echoing::new(None, "");
        let timeout = Duration::from_millis(5);
        let err = exchange_line(&mut device, "*IDN?", true, timeout).unwrap_err();
        assert!(matches!(err, TransportError::Timeout(t) if t == timeout));
    }

    #[tokio::test]
    async fn test_empty_port_name_is_invalid() {
        let result = SerialTransport::open("", 9600, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(TransportError::InvalidResource(_))));
    }

    #[cfg(not(feature = "instrument_serial"))]
    #[tokio::test]
    async fn test_open_without_feature_names_the_feature() {
        let err = SerialTransport::open("/dev/ttyUSB0", 9600, Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("--features instrument_serial"));
    }
}
