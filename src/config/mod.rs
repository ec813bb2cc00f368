use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::serial::protocol::Timeouts;
use crate::serial::LineParams;

const MIN_HANDSHAKE_FRAME: usize = 10;
const MAX_HANDSHAKE_FRAME: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Runtime settings. Missing fields in a config file take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub baud_rate: u32,
    pub assert_rts: bool,
    pub open_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub data_timeout_ms: u64,
    pub max_scan_passes: u32,
    pub rescan_delay_ms: u64,
    pub handshake_max_frame: usize,
    pub usb_only: bool,
}

impl Default for Settings {
    fn default() -> Self {
        let line = LineParams::default();
        let timeouts = Timeouts::default();
        Self {
            baud_rate: line.baud_rate,
            assert_rts: line.assert_rts,
            open_timeout_ms: timeouts.open.as_millis() as u64,
            handshake_timeout_ms: timeouts.handshake.as_millis() as u64,
            command_timeout_ms: timeouts.command.as_millis() as u64,
            data_timeout_ms: timeouts.data.as_millis() as u64,
            max_scan_passes: 5,
            rescan_delay_ms: 250,
            handshake_max_frame: MAX_HANDSHAKE_FRAME,
            usb_only: false,
        }
    }
}

impl Settings {
    /// Read settings from a JSON file and validate them.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&text)?;
        settings.validate()?;
        log::debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.baud_rate == 0 {
            return Err(ConfigError::Invalid("baud_rate must be non-zero".into()));
        }
        let timeouts = [
            ("open_timeout_ms", self.open_timeout_ms),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("command_timeout_ms", self.command_timeout_ms),
            ("data_timeout_ms", self.data_timeout_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, ms)| *ms == 0) {
            return Err(ConfigError::Invalid(format!("{} must be non-zero", name)));
        }
        if self.max_scan_passes == 0 {
            return Err(ConfigError::Invalid("max_scan_passes must be at least 1".into()));
        }
        if !(MIN_HANDSHAKE_FRAME..=MAX_HANDSHAKE_FRAME).contains(&self.handshake_max_frame) {
            return Err(ConfigError::Invalid(format!(
                "handshake_max_frame must be between {} and {}, got {}",
                MIN_HANDSHAKE_FRAME, MAX_HANDSHAKE_FRAME, self.handshake_max_frame
            )));
        }
        Ok(())
    }

    pub fn line_params(&self) -> LineParams {
        LineParams {
            baud_rate: self.baud_rate,
            assert_rts: self.assert_rts,
        }
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            open: Duration::from_millis(self.open_timeout_ms),
            handshake: Duration::from_millis(self.handshake_timeout_ms),
            command: Duration::from_millis(self.command_timeout_ms),
            data: Duration::from_millis(self.data_timeout_ms),
        }
    }

    pub fn rescan_delay(&self) -> Duration {
        Duration::from_millis(self.rescan_delay_ms)
    }
}
