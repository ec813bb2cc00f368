//! Handshake-driven device discovery.
//!
//! The scanner walks the candidate list in order, one connect attempt at a
//! time, and starts over from the first candidate after each full pass
//! until the pass budget runs out. The first port that answers the
//! handshake wins and stays open on the session.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::serial::{PortCandidate, SerialError, SessionHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    DeviceFound(PortCandidate),
    NoDeviceFound,
    Canceled,
}

pub struct PortScanner {
    session: SessionHandle,
    max_passes: u32,
    rescan_delay: Duration,
}

impl PortScanner {
    pub fn new(session: SessionHandle, max_passes: u32, rescan_delay: Duration) -> Self {
        Self {
            session,
            max_passes: max_passes.max(1),
            rescan_delay,
        }
    }

    pub fn from_settings(session: SessionHandle, settings: &Settings) -> Self {
        Self::new(session, settings.max_scan_passes, settings.rescan_delay())
    }

    /// Try every candidate until one answers the handshake.
    ///
    /// An empty list fails with [`SerialError::NoPortsAvailable`]. Once
    /// `cancel` fires, no further port is opened and the result is
    /// [`ScanOutcome::Canceled`], never `NoDeviceFound`.
    pub async fn scan(
        &self,
        candidates: &[PortCandidate],
        cancel: &CancellationToken,
    ) -> Result<ScanOutcome, SerialError> {
        if candidates.is_empty() {
            return Err(SerialError::NoPortsAvailable);
        }

        for pass in 1..=self.max_passes {
            log::info!(
                "Scan pass {}/{} over {} port(s)",
                pass,
                self.max_passes,
                candidates.len()
            );

            for candidate in candidates {
                if cancel.is_cancelled() {
                    return Ok(self.abandon().await);
                }
                log::debug!("Trying {}", candidate);

                let attempt = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    result = self.session.connect(candidate) => Some(result),
                };
                match attempt {
                    None => return Ok(self.abandon().await),
                    Some(Ok(())) => {
                        log::info!("Found device on {}", candidate);
                        return Ok(ScanOutcome::DeviceFound(candidate.clone()));
                    }
                    Some(Err(e)) => log::debug!("{}: {}", candidate, e),
                }
            }

            if pass < self.max_passes && !self.rescan_delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(self.abandon().await),
                    _ = tokio::time::sleep(self.rescan_delay) => {}
                }
            }
        }

        log::info!("No device found after {} pass(es)", self.max_passes);
        Ok(ScanOutcome::NoDeviceFound)
    }

    async fn abandon(&self) -> ScanOutcome {
        log::info!("Scan canceled");
        self.session.cancel().await;
        ScanOutcome::Canceled
    }
}
