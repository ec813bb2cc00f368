//! Scriptable in-memory transport.
//!
//! [`MockTransport`] stands in for a serial port in tests and offline runs.
//! Each named port gets a behaviour: open normally, refuse to open, or
//! never signal that it opened. An opened port answers with pre-loaded
//! replies: when the engine sends bytes matching the next expectation for
//! that port, the scripted reply is queued as [`TransportEvent`]s.
//! Sends that match nothing are recorded and left unanswered.
//!
//! ```
//! use oxilink_lib::serial::MockTransport;
//!
//! let mock = MockTransport::new();
//! mock.expect("/dev/ttyUSB0", &[0x55, 0xAA, 0x01], &[0x55, 0xAA, 0x01, 0x00]);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::transport::{LineParams, Transport, TransportEvent};
use super::{PortCandidate, Result, SerialError};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenBehavior {
    #[default]
    Opens,
    Refuses,
    Stalls,
}

#[derive(Debug, Clone)]
struct Expectation {
    request: Vec<u8>,
    events: Vec<TransportEvent>,
}

#[derive(Debug, Default)]
struct MockPort {
    behavior: OpenBehavior,
    expectations: VecDeque<Expectation>,
}

#[derive(Debug, Default)]
struct MockState {
    ports: HashMap<String, MockPort>,
    open_port: Option<String>,
    events: Option<mpsc::Sender<TransportEvent>>,
    sent: Vec<(String, Vec<u8>)>,
    opens: Vec<String>,
    last_line: Option<LineParams>,
}

/// Cloning shares the script, so a test can keep one clone for inspection
/// while the session owns the other.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_open_behavior(&self, port: &str, behavior: OpenBehavior) {
        self.state().ports.entry(port.to_string()).or_default().behavior = behavior;
    }

    /// When `request` is sent on `port`, reply with `response` in one chunk.
    pub fn expect(&self, port: &str, request: &[u8], response: &[u8]) {
        self.expect_chunks(port, request, &[response]);
    }

    /// When `request` is sent on `port`, reply with each chunk as a separate event.
    pub fn expect_chunks(&self, port: &str, request: &[u8], chunks: &[&[u8]]) {
        let events = chunks
            .iter()
            .map(|c| TransportEvent::Data(c.to_vec()))
            .collect();
        self.expect_events(port, request, events);
    }

    /// When `request` is sent on `port`, deliver `events` in order. Used to
    /// script unplugging or errors at a precise point of an exchange.
    pub fn expect_events(&self, port: &str, request: &[u8], events: Vec<TransportEvent>) {
        self.state()
            .ports
            .entry(port.to_string())
            .or_default()
            .expectations
            .push_back(Expectation {
                request: request.to_vec(),
                events,
            });
    }

    /// Deliver an event on the currently open port. Returns `false` when
    /// no port is open.
    pub fn inject(&self, event: TransportEvent) -> bool {
        match &self.state().events {
            Some(tx) => tx.try_send(event).is_ok(),
            None => false,
        }
    }

    /// Every send, as `(port, bytes)`, in order.
    pub fn sent(&self) -> Vec<(String, Vec<u8>)> {
        self.state().sent.clone()
    }

    pub fn sent_to(&self, port: &str) -> Vec<Vec<u8>> {
        self.state()
            .sent
            .iter()
            .filter(|(p, _)| p == port)
            .map(|(_, bytes)| bytes.clone())
            .collect()
    }

    /// Port names passed to `open`, in order.
    pub fn opens(&self) -> Vec<String> {
        self.state().opens.clone()
    }

    pub fn open_port(&self) -> Option<String> {
        self.state().open_port.clone()
    }

    pub fn last_line_params(&self) -> Option<LineParams> {
        self.state().last_line.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(
        &mut self,
        port: &PortCandidate,
        params: &LineParams,
    ) -> Result<mpsc::Receiver<TransportEvent>> {
        let mut state = self.state();
        state.opens.push(port.port_name.clone());
        state.last_line = Some(params.clone());
        state.events = None;
        state.open_port = None;

        let behavior = state
            .ports
            .get(&port.port_name)
            .map_or(OpenBehavior::Opens, |p| p.behavior);
        if behavior == OpenBehavior::Refuses {
            return Err(SerialError::ConnectionFailed(format!(
                "{}: refused",
                port.port_name
            )));
        }

        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        if behavior == OpenBehavior::Opens {
            let _ = tx.try_send(TransportEvent::Opened);
        }
        state.events = Some(tx);
        state.open_port = Some(port.port_name.clone());
        Ok(rx)
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.state();
        let port = state.open_port.clone().ok_or(SerialError::NotConnected)?;
        state.sent.push((port.clone(), data.to_vec()));

        let matched = match state.ports.get_mut(&port) {
            Some(p) if p.expectations.front().is_some_and(|e| e.request == data) => {
                p.expectations.pop_front()
            }
            _ => None,
        };
        if let (Some(expectation), Some(tx)) = (matched, state.events.as_ref()) {
            for event in expectation.events {
                let _ = tx.try_send(event);
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = self.state();
        state.events = None;
        state.open_port = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state().open_port.is_some()
    }
}
