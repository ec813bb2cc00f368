pub mod engine;
pub mod framing;
pub mod interface;
pub mod mock;
pub mod protocol;
pub mod session;
pub mod transport;

pub use engine::{EngineState, ProtocolEngine};
pub use framing::{FrameMatcher, MatchResult};
pub use interface::{SerialInterface, SerialTransport};
pub use mock::{MockTransport, OpenBehavior};
pub use protocol::{CommandKind, Response, ResponseDescriptor, Timeouts};
pub use session::{SessionBuilder, SessionHandle, SessionMetrics};
pub use transport::{LineParams, Transport, TransportEvent};

use serde::{Deserialize, Serialize};

/// A serial endpoint considered during device discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortCandidate {
    pub port_name: String,
    pub display_name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl PortCandidate {
    pub fn new(port_name: impl Into<String>) -> Self {
        let port_name = port_name.into();
        Self {
            display_name: port_name.clone(),
            port_name,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
        }
    }
}

impl std::fmt::Display for PortCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.display_name == self.port_name {
            write!(f, "{}", self.port_name)
        } else {
            write!(f, "{} ({})", self.display_name, self.port_name)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("No serial ports available")]
    NoPortsAvailable,

    #[error("Timed out waiting for the port to open")]
    PortOpenTimeout,

    #[error("No handshake response from device")]
    HandshakeTimeout,

    #[error("No response to {0}")]
    CommandTimeout(CommandKind),

    #[error("Malformed response: {0}")]
    FramingError(String),

    #[error("Device removed")]
    DeviceRemoved,

    #[error("Report {requested} out of range (device holds {available})")]
    ReportIndexOutOfRange { requested: u16, available: u16 },

    #[error("Request canceled")]
    Canceled,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("{0} already in flight")]
    RequestInFlight(CommandKind),

    #[error("Port closed")]
    PortClosed,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;
