pub mod config;
pub mod device;
pub mod report;
pub mod serial;

pub use config::Settings;
pub use device::{DeviceManager, DownloadEvent, DownloadOutcome, DownloadSummary, ScanOutcome};
pub use report::{Mode, Report, ReportSummary};
pub use serial::{PortCandidate, SerialError, SessionBuilder, SessionHandle};
