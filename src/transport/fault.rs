//! Fault-injecting transport wrapper for testing
//!
//! Wraps any [`Transport`] and provides:
//! - A shared call log of every write, query and close that reached the wrapper
//! - Failure injection on commands matching a prefix (once or always)
//! - Dropped responses, where the command executes but the reply comes back empty
//!
//! A [`FaultControl`] handle is cloned into the wrapper, so a test keeps one copy
//! and steers the transport after it has been handed to a session.

use super::{Transport, TransportFactory, TransportSpec};
use crate::error::TransportError;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// One call observed by a [`FaultyTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireCall {
    Write(String),
    Query(String),
    Close,
}

impl WireCall {
    /// Command text, `None` for `Close`.
    pub fn command(&self) -> Option<&str> {
        match self {
            WireCall::Write(command) | WireCall::Query(command) => Some(command),
            WireCall::Close => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FaultAction {
    Fail,
    DropResponse,
}

#[derive(Debug)]
struct FaultRule {
    prefix: String,
    action: FaultAction,
    /// `None` fires forever.
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct FaultState {
    calls: Vec<WireCall>,
    rules: Vec<FaultRule>,
    fail_next_open: bool,
    opens: usize,
}

/// Shared control surface for [`FaultyTransport`] and [`FaultyFactory`].
#[derive(Debug, Clone, Default)]
pub struct FaultControl {
    state: Arc<Mutex<FaultState>>,
}

impl FaultControl {
    /// Create a control with no faults armed.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FaultState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arm(&self, prefix: &str, action: FaultAction, remaining: Option<usize>) {
        self.lock().rules.push(FaultRule {
            prefix: prefix.to_ascii_uppercase(),
            action,
            remaining,
        });
    }

    /// Fail the next call whose command starts with `prefix` (case-insensitive).
    pub fn fail_next(&self, prefix: &str) {
        self.arm(prefix, FaultAction::Fail, Some(1));
    }

    /// Fail every call whose command starts with `prefix`.
    pub fn fail_always(&self, prefix: &str) {
        self.arm(prefix, FaultAction::Fail, None);
    }

    /// Let the next matching query execute but return an empty response.
    pub fn drop_next_response(&self, prefix: &str) {
        self.arm(prefix, FaultAction::DropResponse, Some(1));
    }

    /// Make the next [`FaultyFactory::open`] fail before a transport exists.
    pub fn fail_next_open(&self) {
        self.lock().fail_next_open = true;
    }

    /// Disarm every rule.
    pub fn clear_faults(&self) {
        let mut state = self.lock();
        state.rules.clear();
        state.fail_next_open = false;
    }

    /// Every call observed so far, in order.
    pub fn calls(&self) -> Vec<WireCall> {
        self.lock().calls.clone()
    }

    /// Command text of every write and query observed so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| call.command().map(str::to_string))
            .collect()
    }

    /// Writes observed so far, in order.
    pub fn writes(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                WireCall::Write(command) => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    /// Forget the call log.
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Number of transports opened through a [`FaultyFactory`].
    pub fn opens(&self) -> usize {
        self.lock().opens
    }

    /// Records `call` and returns the action of the first armed rule it matches.
    fn intercept(&self, call: WireCall) -> Option<FaultAction> {
        let mut state = self.lock();
        let is_query = matches!(call, WireCall::Query(_));
        let upper = call.command().map(str::to_ascii_uppercase);
        state.calls.push(call);

        let upper = upper?;
        let index = state.rules.iter().position(|rule| {
            upper.starts_with(&rule.prefix)
                && (rule.action == FaultAction::Fail || is_query)
                && rule.remaining != Some(0)
        })?;
        let rule = &mut state.rules[index];
        if let Some(remaining) = rule.remaining.as_mut() {
            *remaining -= 1;
        }
        let action = rule.action;
        state.rules.retain(|rule| rule.remaining != Some(0));
        Some(action)
    }
}

/// Transport wrapper that logs calls and injects faults.
pub struct FaultyTransport {
    inner: Box<dyn Transport>,
    control: FaultControl,
}

impl FaultyTransport {
    /// Wrap `inner`, steered by `control`.
    pub fn new(inner: Box<dyn Transport>, control: FaultControl) -> Self {
        Self { inner, control }
    }
}

#[async_trait]
impl Transport for FaultyTransport {
    async fn write(&mut self, command: &str) -> Result<(), TransportError> {
        match self.control.intercept(WireCall::Write(command.to_string())) {
            Some(FaultAction::Fail) => {
                debug!(command, "injecting write failure");
                Err(TransportError::Injected(command.to_string()))
            }
            _ => self.inner.write(command).await,
        }
    }

    async fn query(&mut self, command: &str) -> Result<String, TransportError> {
        match self.control.intercept(WireCall::Query(command.to_string())) {
            Some(FaultAction::Fail) => {
                debug!(command, "injecting query failure");
                Err(TransportError::Injected(command.to_string()))
            }
            Some(FaultAction::DropResponse) => {
                debug!(command, "dropping query response");
                self.inner.query(command).await.map(|_| String::new())
            }
            None => self.inner.query(command).await,
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.control.intercept(WireCall::Close);
        self.inner.close().await
    }

    fn describe(&self) -> String {
        format!("Faulty({})", self.inner.describe())
    }
}

/// Factory that wraps every transport it opens in a [`FaultyTransport`].
pub struct FaultyFactory {
    inner: Arc<dyn TransportFactory>,
    control: FaultControl,
}

impl FaultyFactory {
    /// Wrap transports opened by `inner`.
    pub fn new(inner: Arc<dyn TransportFactory>, control: FaultControl) -> Self {
        Self { inner, control }
    }
}

#[async_trait]
impl TransportFactory for FaultyFactory {
    async fn open(&self, spec: &TransportSpec) -> Result<Box<dyn Transport>, TransportError> {
        {
            let mut state = self.control.lock();
            if std::mem::take(&mut state.fail_next_open) {
                return Err(TransportError::Injected("open".to_string()));
            }
            state.opens += 1;
        }
        let inner = self.inner.open(spec).await?;
        Ok(Box::new(FaultyTransport::new(inner, self.control.clone())))
    }
}
