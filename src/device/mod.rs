pub mod manager;
pub mod models;
pub mod scanner;

pub use manager::DeviceManager;
pub use models::*;
pub use scanner::{PortScanner, ScanOutcome};

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Device not connected")]
    NotConnected,

    #[error("Serial communication error: {0}")]
    SerialError(#[from] crate::serial::SerialError),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
