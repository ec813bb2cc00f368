use async_trait::async_trait;
use serialport::SerialPortType;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};

use super::transport::{LineParams, Transport, TransportEvent};
use super::{PortCandidate, Result, SerialError};

const EVENT_CAPACITY: usize = 64;
const WRITE_CAPACITY: usize = 8;
const READ_CHUNK: usize = 512;

pub struct SerialInterface;

impl SerialInterface {
    /// Enumerate candidate ports. With `usb_only`, ports that are not
    /// USB-serial adapters are skipped.
    pub fn discover_ports(usb_only: bool) -> Result<Vec<PortCandidate>> {
        let ports = serialport::available_ports()?;
        let mut candidates = Vec::new();

        for port in ports {
            let mut candidate = PortCandidate::new(port.port_name.clone());
            match port.port_type {
                SerialPortType::UsbPort(usb_info) => {
                    candidate.vid = Some(usb_info.vid);
                    candidate.pid = Some(usb_info.pid);
                    if let Some(product) = &usb_info.product {
                        candidate.display_name = product.clone();
                    }
                    candidate.manufacturer = usb_info.manufacturer;
                    candidate.product = usb_info.product;
                }
                _ if usb_only => continue,
                _ => {}
            }
            candidates.push(candidate);
        }

        log::debug!("Discovered {} candidate port(s)", candidates.len());
        Ok(candidates)
    }

    /// Whether `port_name` is still listed by the operating system.
    pub fn port_present(port_name: &str) -> bool {
        serialport::available_ports()
            .map(|ports| ports.iter().any(|p| p.port_name == port_name))
            .unwrap_or(false)
    }
}

/// [`Transport`] over a real serial port. The port itself lives in a
/// background task that multiplexes writes and reads; this struct only
/// holds the write queue and the task handle.
pub struct SerialTransport {
    write_tx: Option<mpsc::Sender<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
    port_name: Option<String>,
}

impl SerialTransport {
    pub fn new() -> Self {
        Self {
            write_tx: None,
            task: None,
            port_name: None,
        }
    }
}

impl Default for SerialTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(
        &mut self,
        port: &PortCandidate,
        params: &LineParams,
    ) -> Result<mpsc::Receiver<TransportEvent>> {
        self.close().await?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let (write_tx, write_rx) = mpsc::channel(WRITE_CAPACITY);

        log::info!("Opening {} at {} baud", port.port_name, params.baud_rate);
        self.task = Some(tokio::spawn(port_task(
            port.port_name.clone(),
            params.clone(),
            event_tx,
            write_rx,
        )));
        self.write_tx = Some(write_tx);
        self.port_name = Some(port.port_name.clone());
        Ok(event_rx)
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let tx = self.write_tx.as_ref().ok_or(SerialError::NotConnected)?;
        tx.send(data.to_vec())
            .await
            .map_err(|_| SerialError::PortClosed)
    }

    async fn close(&mut self) -> Result<()> {
        self.write_tx = None;
        if let Some(task) = self.task.take() {
            task.abort();
            // The port is released when the aborted task drops its stream.
            let _ = task.await;
        }
        if let Some(name) = self.port_name.take() {
            log::info!("Closed {}", name);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.write_tx.is_some()
    }
}

fn open_stream(port_name: &str, params: &LineParams) -> Result<SerialStream> {
    let mut stream = tokio_serial::new(port_name, params.baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| SerialError::ConnectionFailed(format!("{}: {}", port_name, e)))?;

    if params.assert_rts {
        stream.write_request_to_send(true)?;
    }
    Ok(stream)
}

async fn port_task(
    port_name: String,
    params: LineParams,
    events: mpsc::Sender<TransportEvent>,
    mut write_rx: mpsc::Receiver<Vec<u8>>,
) {
    let mut stream = match open_stream(&port_name, &params) {
        Ok(stream) => stream,
        Err(e) => {
            log::warn!("{}", e);
            let _ = events.send(TransportEvent::Error(e.to_string())).await;
            let _ = events.send(TransportEvent::Closed).await;
            return;
        }
    };

    if events.send(TransportEvent::Opened).await.is_err() {
        return;
    }

    let mut buf = [0u8; READ_CHUNK];
    loop {
        tokio::select! {
            outgoing = write_rx.recv() => {
                let Some(data) = outgoing else { break };
                let written = async {
                    stream.write_all(&data).await?;
                    stream.flush().await
                }.await;
                if let Err(e) = written {
                    report_io_error(&port_name, &e, &events).await;
                    break;
                }
            }
            read = stream.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        let _ = events.send(TransportEvent::Closed).await;
                        break;
                    }
                    Ok(n) => {
                        if events.send(TransportEvent::Data(buf[..n].to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(e) => {
                        report_io_error(&port_name, &e, &events).await;
                        break;
                    }
                }
            }
        }
    }
}

// An I/O error on a port the OS no longer lists means the adapter was
// unplugged. Any other error ends the port task, so it is followed by Closed.
async fn report_io_error(
    port_name: &str,
    error: &std::io::Error,
    events: &mpsc::Sender<TransportEvent>,
) {
    if !SerialInterface::port_present(port_name) {
        log::warn!("{} disappeared: {}", port_name, error);
        let _ = events.send(TransportEvent::Removed).await;
    } else {
        log::warn!("I/O error on {}: {}", port_name, error);
        let _ = events.send(TransportEvent::Error(error.to_string())).await;
        let _ = events.send(TransportEvent::Closed).await;
    }
}
