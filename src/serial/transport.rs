//! Byte-level link to the oximeter.
//!
//! The [`Transport`] trait is the only way the protocol engine touches the
//! wire. Opening a port hands back a receiver of [`TransportEvent`]s; every
//! lifecycle signal and every chunk of received bytes for that port arrives
//! on it, in order. Dropping the receiver detaches the engine from the old
//! port, so a stale event can never reach the next connection.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{PortCandidate, Result};

/// Line parameters applied when opening a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineParams {
    pub baud_rate: u32,
    pub assert_rts: bool,
}

impl Default for LineParams {
    fn default() -> Self {
        Self {
            baud_rate: 38_400,
            assert_rts: true,
        }
    }
}

/// Signals delivered by an open transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The port finished opening and accepts writes.
    Opened,
    /// Bytes received from the device.
    Data(Vec<u8>),
    /// The port closed on its own (EOF or orderly shutdown).
    Closed,
    /// The underlying device disappeared from the system.
    Removed,
    /// A non-fatal error was reported by the port.
    Error(String),
}

#[async_trait]
pub trait Transport: Send {
    /// Begin opening `port`. Returns the event stream for this port;
    /// [`TransportEvent::Opened`] is delivered on it once the port is usable.
    async fn open(
        &mut self,
        port: &PortCandidate,
        params: &LineParams,
    ) -> Result<mpsc::Receiver<TransportEvent>>;

    /// Write all of `data` to the open port.
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Close the port. Closing an already closed transport is a no-op.
    async fn close(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;
}
