use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::report::Report;
use crate::serial::{
    PortCandidate, SerialError, SerialInterface, SerialTransport, SessionBuilder, SessionHandle,
};
use super::{
    ConnectedDevice, ConnectionState, DeviceError, DownloadEvent, DownloadOutcome,
    DownloadSummary, PortScanner, Result, ScanOutcome,
};

/// Central device management system
/// Handles discovery, the connection, and report download for one oximeter
pub struct DeviceManager {
    session: SessionHandle,
    settings: Settings,
    connected: Arc<RwLock<Option<ConnectedDevice>>>,
    state: Arc<RwLock<ConnectionState>>,
}

/// Why a single download request did not produce a value.
enum Halt {
    Canceled,
    Failed(SerialError),
}

impl DeviceManager {
    pub fn new(session: SessionHandle, settings: Settings) -> Self {
        Self {
            session,
            settings,
            connected: Arc::new(RwLock::new(None)),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
        }
    }

    /// Manager backed by real serial ports.
    pub fn with_serial(settings: Settings) -> Self {
        let session = SessionBuilder::new(SerialTransport::new())
            .settings(&settings)
            .build();
        Self::new(session, settings)
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.state.read().await.clone()
    }

    pub async fn connected_device(&self) -> Option<ConnectedDevice> {
        self.connected.read().await.clone()
    }

    pub async fn connected_port(&self) -> Option<PortCandidate> {
        self.connected.read().await.as_ref().map(|d| d.port.clone())
    }

    /// True while a port is held and the session has not lost it.
    pub async fn is_connected(&self) -> bool {
        self.connected.read().await.is_some() && self.session.state().is_connected()
    }

    /// List serial ports that could host the device
    pub fn discover_ports(&self) -> Result<Vec<PortCandidate>> {
        let ports = SerialInterface::discover_ports(self.settings.usb_only)?;
        log::debug!("Discovered {} port(s)", ports.len());
        Ok(ports)
    }

    /// Find the oximeter among `candidates`, or among all discovered ports
    /// when none are given. On success the device stays connected.
    pub async fn scan_for_device(
        &self,
        candidates: Option<Vec<PortCandidate>>,
        cancel: &CancellationToken,
    ) -> Result<ScanOutcome> {
        let candidates = match candidates {
            Some(candidates) => candidates,
            None => self.discover_ports()?,
        };

        self.forget().await;
        *self.state.write().await = ConnectionState::Scanning;

        let scanner = PortScanner::from_settings(self.session.clone(), &self.settings);
        let outcome = match scanner.scan(&candidates, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                *self.state.write().await = ConnectionState::Error(e.to_string());
                return Err(e.into());
            }
        };

        match &outcome {
            ScanOutcome::DeviceFound(port) => self.remember(port.clone()).await,
            ScanOutcome::NoDeviceFound => {
                *self.state.write().await =
                    ConnectionState::Error("no device found".to_string());
            }
            ScanOutcome::Canceled => {
                *self.state.write().await = ConnectionState::Disconnected;
            }
        }
        Ok(outcome)
    }

    /// Connect straight to a known port, skipping the scan.
    pub async fn connect(&self, port: &PortCandidate) -> Result<()> {
        self.forget().await;
        match self.session.connect(port).await {
            Ok(()) => {
                log::info!("Connected to {}", port);
                self.remember(port.clone()).await;
                Ok(())
            }
            Err(e) => {
                *self.state.write().await = ConnectionState::Error(e.to_string());
                Err(e.into())
            }
        }
    }

    /// Download every stored report, one at a time.
    ///
    /// Reports are fetched in order, header then data, each request fully
    /// resolved before the next is sent. A report whose header or data
    /// request fails is reported through `events` and skipped; a report
    /// whose header arrived but whose data did not is still returned.
    /// After `cancel` fires nothing more is sent on `events`.
    pub async fn download_reports(
        &self,
        cancel: &CancellationToken,
        events: Option<mpsc::UnboundedSender<DownloadEvent>>,
    ) -> Result<DownloadSummary> {
        if self.connected.read().await.is_none() {
            return Err(DeviceError::NotConnected);
        }
        let emit = |event: DownloadEvent| {
            if cancel.is_cancelled() {
                return;
            }
            if let Some(tx) = &events {
                let _ = tx.send(event);
            }
        };

        let count = match self.guarded(cancel, self.session.report_count()).await {
            Ok(count) => count,
            Err(halt) => {
                let mut summary = DownloadSummary::new(0);
                summary.outcome = self.halt(halt).await?;
                return Ok(summary);
            }
        };
        if let Some(device) = self.connected.write().await.as_mut() {
            device.report_count = Some(count);
        }
        log::info!("Device holds {} report(s)", count);
        emit(DownloadEvent::ReportCount(count));

        let mut summary = DownloadSummary::new(count);
        for number in 1..=count {
            summary.attempted += 1;

            let mut report = match self.guarded(cancel, self.session.report_header(number)).await {
                Ok(report) => report,
                Err(Halt::Failed(e)) if !is_link_loss(&e) => {
                    log::warn!("Report {} header failed: {}", number, e);
                    emit(DownloadEvent::Failed { number, error: e.to_string() });
                    continue;
                }
                Err(halt) => {
                    summary.outcome = self.halt(halt).await?;
                    break;
                }
            };
            emit(DownloadEvent::HeaderReceived { number });

            match self.guarded(cancel, self.session.report_data(&mut report)).await {
                Ok(()) => {
                    log::info!("Downloaded report {}/{}", number, count);
                    summary.completed += 1;
                    emit(DownloadEvent::ReportDownloaded(report.clone()));
                    summary.reports.push(report);
                }
                Err(Halt::Failed(e)) if !is_link_loss(&e) => {
                    log::warn!("Report {} data failed: {}", number, e);
                    emit(DownloadEvent::Failed { number, error: e.to_string() });
                    summary.reports.push(report);
                }
                Err(halt) => {
                    summary.reports.push(report);
                    summary.outcome = self.halt(halt).await?;
                    break;
                }
            }
        }

        Ok(summary)
    }

    /// Release the port.
    pub async fn disconnect(&self) -> Result<()> {
        self.session.disconnect().await?;
        self.forget().await;
        log::info!("Disconnected");
        Ok(())
    }

    /// Run one request unless `cancel` fires first. Errors come back as
    /// `Halt::Failed` and are sorted out by the caller.
    async fn guarded<T>(
        &self,
        cancel: &CancellationToken,
        request: impl std::future::Future<Output = std::result::Result<T, SerialError>>,
    ) -> std::result::Result<T, Halt> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Halt::Canceled),
            result = request => match result {
                Ok(value) => Ok(value),
                Err(SerialError::Canceled) => Err(Halt::Canceled),
                Err(e) => Err(Halt::Failed(e)),
            },
        }
    }

    /// Turn a halt into the outcome recorded on the summary. Errors other
    /// than link loss propagate.
    async fn halt(&self, halt: Halt) -> Result<DownloadOutcome> {
        match halt {
            Halt::Canceled => {
                log::info!("Download canceled");
                self.session.cancel().await;
                self.forget().await;
                Ok(DownloadOutcome::Canceled)
            }
            Halt::Failed(e) if is_link_loss(&e) => {
                log::warn!("Download interrupted: {}", e);
                self.forget().await;
                *self.state.write().await = ConnectionState::Error(e.to_string());
                Ok(DownloadOutcome::Interrupted(e.to_string()))
            }
            Halt::Failed(e) => Err(e.into()),
        }
    }

    async fn remember(&self, port: PortCandidate) {
        *self.connected.write().await = Some(ConnectedDevice::new(port));
        *self.state.write().await = ConnectionState::Connected;
    }

    async fn forget(&self) {
        *self.connected.write().await = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }
}

fn is_link_loss(error: &SerialError) -> bool {
    matches!(
        error,
        SerialError::DeviceRemoved | SerialError::PortClosed | SerialError::NotConnected
    )
}

/// Decode each downloaded report's summary, skipping ones that fail to decode.
pub fn summarize(reports: &[Report]) -> Vec<crate::report::ReportSummary> {
    reports
        .iter()
        .filter_map(|report| match report.summary() {
            Ok(summary) => Some(summary),
            Err(e) => {
                log::warn!("Report {} could not be decoded: {}", report.number, e);
                None
            }
        })
        .collect()
}
