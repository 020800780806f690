//! VISA transport.
//!
//! Uses the `visa-rs` crate to talk to any resource the installed VISA library can
//! open (`ASRL6::INSTR`, `USB0::...::INSTR`, `TCPIP0::192.168.1.10::INSTR`). The
//! resource manager is kept alive alongside the instrument session for as long as
//! the transport is open. Blocking I/O runs on Tokio's blocking pool. Each
//! exchange sets the configured timeout as the VISA I/O timeout, so a stuck read
//! ends inside the library and releases the link. The device is cleared before
//! every query so a late reply to an earlier query is never taken as this one's.
//!
//! Without the `instrument_visa` feature, opening fails with
//! [`TransportError::FeatureDisabled`].

use super::Transport;
use crate::error::TransportError;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

#[cfg(feature = "instrument_visa")]
use std::sync::Arc;
#[cfg(feature = "instrument_visa")]
use tokio::sync::Mutex;

/// Slack past the VISA I/O timeout before the exchange is abandoned.
#[cfg(feature = "instrument_visa")]
const LIBRARY_GRACE: Duration = Duration::from_millis(100);

#[cfg(feature = "instrument_visa")]
struct VisaLink {
    // Dropping the resource manager closes every session it opened.
    _rm: visa_rs::DefaultRM,
    instrument: visa_rs::Instrument,
}

/// VISA link to an instrument.
pub struct VisaTransport {
    resource: String,
    timeout: Duration,
    #[cfg(feature = "instrument_visa")]
    link: Option<Arc<Mutex<VisaLink>>>,
}

impl VisaTransport {
    /// Opens the VISA `resource`.
    ///
    /// # Errors
    ///
    /// `InvalidResource` when the string is empty or not of the `A::B` form, `Io` if
    /// the VISA library refuses it, `FeatureDisabled` when built without VISA support.
    pub async fn open(resource: &str, timeout: Duration) -> Result<Self, TransportError> {
        let resource = resource.trim();
        if resource.is_empty() || !resource.contains("::") {
            return Err(TransportError::InvalidResource(resource.to_string()));
        }

        #[cfg(feature = "instrument_visa")]
        {
            use std::ffi::CString;
            use visa_rs::prelude::*;

            let name = resource.to_string();
            let link = tokio::task::spawn_blocking(move || -> Result<VisaLink, TransportError> {
                let rm = DefaultRM::new().map_err(visa_io_error)?;
                let c_string = CString::new(name.as_str())
                    .map_err(|_| TransportError::InvalidResource(name.clone()))?;
                let visa_string = VisaString::from(c_string);
                let instrument = rm
                    .open(&visa_string, AccessMode::NO_LOCK, TIMEOUT_IMMEDIATE)
                    .map_err(visa_io_error)?;
                Ok(VisaLink {
                    _rm: rm,
                    instrument,
                })
            })
            .await
            .map_err(|e| TransportError::TaskFailed(e.to_string()))??;

            tracing::info!(resource, "VISA resource opened");
            Ok(Self {
                resource: resource.to_string(),
                timeout,
                link: Some(Arc::new(Mutex::new(link))),
            })
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            let _ = timeout;
            Err(TransportError::FeatureDisabled("VISA", "instrument_visa"))
        }
    }

    #[cfg(feature = "instrument_visa")]
    async fn exchange(
        &self,
        command: &str,
        expect_reply: bool,
    ) -> Result<Option<String>, TransportError> {
        let link = self.link.as_ref().ok_or(TransportError::NotOpen)?.clone();
        let line = format!("{command}\n");
        let timeout = self.timeout;

        let task = tokio::task::spawn_blocking(move || -> Result<Option<String>, TransportError> {
            use std::io::{Read, Write};
            use visa_rs::attribute::AttrTmoValue;
            use visa_rs::prelude::*;

            let mut guard = link.blocking_lock();
            let millis = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
            let tmo = AttrTmoValue::new_checked(millis).ok_or_else(|| {
                TransportError::Io(std::io::Error::other("VISA timeout out of range"))
            })?;
            guard.instrument.set_attr(tmo).map_err(visa_io_error)?;
            if expect_reply {
                guard.instrument.clear().map_err(visa_io_error)?;
            }

            guard.instrument.write_all(line.as_bytes())?;
            if !expect_reply {
                return Ok(None);
            }

            let mut response = Vec::new();
            let mut buf = [0u8; 256];
            loop {
                let n = guard.instrument.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                response.extend_from_slice(&buf[..n]);
                if response.ends_with(b"\n") {
                    break;
                }
            }
            Ok(Some(String::from_utf8_lossy(&response).trim().to_string()))
        });

        // The library enforces the deadline on each read; this bounds a hung call.
        tokio::time::timeout(timeout + LIBRARY_GRACE, task)
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
            .map_err(|e| TransportError::TaskFailed(e.to_string()))?
    }
}

#[cfg(feature = "instrument_visa")]
fn visa_io_error(err: visa_rs::Error) -> TransportError {
    TransportError::Io(std::io::Error::other(err.to_string()))
}

#[async_trait]
impl Transport for VisaTransport {
    async fn write(&mut self, command: &str) -> Result<(), TransportError> {
        debug!(resource = %self.resource, command, "visa write");
        #[cfg(feature = "instrument_visa")]
        {
            self.exchange(command, false).await.map(|_| ())
        }
        #[cfg(not(feature = "instrument_visa"))]
        {
            Err(TransportError::NotOpen)
        }
    }

    async fn query(&mut self, command: &str) -> Result<String, TransportError> {
        #[cfg(feature = "instrument_visa")]
        {
            let response = self.exchange(command, true).await?.unwrap_or_default();
            debug!(resource = %self.resource, command, response = %response, "visa query");
            Ok(response)
        }
        #[cfg(not(feature = "instrument_visa"))]
        {
            let _ = command;
            Err(TransportError::NotOpen)
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        #[cfg(feature = "instrument_visa")]
        if self.link.take().is_some() {
            tracing::info!(resource = %self.resource, "VISA resource closed");
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("VisaTransport({}, timeout {:?})", self.resource, self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_malformed_resource_is_invalid() {
        for resource in ["", "   ", "COM3"] {
            let result = VisaTransport::open(resource, Duration::from_secs(1)).await;
            assert!(
                matches!(result, Err(TransportError::InvalidResource(_))),
                "{resource:?} should be rejected"
            );
        }
    }

    #[cfg(not(feature = "instrument_visa"))]
    #[tokio::test]
    async fn test_open_without_feature_names_the_feature() {
        let err = VisaTransport::open("ASRL6::INSTR", Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("--features instrument_visa"));
    }
}
