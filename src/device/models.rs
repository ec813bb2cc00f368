use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::report::Report;
use crate::serial::PortCandidate;

/// Device connection state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Scanning,
    Connected,
    Error(String),
}

/// The oximeter currently held by a [`super::DeviceManager`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedDevice {
    pub port: PortCandidate,
    pub connected_at: DateTime<Utc>,
    pub report_count: Option<u16>,
}

impl ConnectedDevice {
    pub fn new(port: PortCandidate) -> Self {
        Self {
            port,
            connected_at: Utc::now(),
            report_count: None,
        }
    }
}

/// Progress of a report download, in the order it happens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DownloadEvent {
    ReportCount(u16),
    HeaderReceived { number: u16 },
    ReportDownloaded(Report),
    Failed { number: u16, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadOutcome {
    Completed,
    Canceled,
    /// The link went away; carries the reason.
    Interrupted(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSummary {
    pub available: u16,
    pub attempted: u16,
    pub completed: u16,
    pub reports: Vec<Report>,
    pub outcome: DownloadOutcome,
}

impl DownloadSummary {
    pub fn new(available: u16) -> Self {
        Self {
            available,
            attempted: 0,
            completed: 0,
            reports: Vec::new(),
            outcome: DownloadOutcome::Completed,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.outcome == DownloadOutcome::Completed && self.completed == self.available
    }
}
