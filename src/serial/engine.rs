//! Protocol engine: one connection, one command in flight.
//!
//! The engine is advanced by exactly three kinds of stimulus: caller
//! requests ([`ProtocolEngine::connect`], [`ProtocolEngine::submit`]),
//! transport events, and expiry of the pending request's deadline. The
//! session task feeds all three from a single loop, so the engine itself
//! never needs a lock.
//!
//! ```text
//!   Idle/Closed --connect--> Connecting --Opened--> AwaitingResponse(Handshake)
//!        ^                        |                        |
//!        |<----- open timeout ----+                        | frame
//!        |<----- handshake timeout / overflow -------------+
//!        |                                                 v
//!        |<----- Removed / Closed (any state) ----------  Ready <--+
//!                                                          |      |
//!                                        submit(kind)      v      | frame / timeout / overflow
//!                                              AwaitingResponse(kind)
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::framing::{FrameMatcher, MatchResult};
use super::protocol::{
    decode_response, CommandKind, Response, Timeouts, DEFAULT_HANDSHAKE_MAX_FRAME,
};
use super::session::SessionMetrics;
use super::transport::{LineParams, Transport, TransportEvent};
use super::{PortCandidate, Result, SerialError};

pub type Responder<T> = oneshot::Sender<Result<T>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    Idle,
    Connecting,
    Ready,
    AwaitingResponse(CommandKind),
    Closed,
}

impl EngineState {
    pub fn is_connected(&self) -> bool {
        matches!(self, EngineState::Ready | EngineState::AwaitingResponse(_))
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub line: LineParams,
    pub timeouts: Timeouts,
    pub handshake_max_frame: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            line: LineParams::default(),
            timeouts: Timeouts::default(),
            handshake_max_frame: DEFAULT_HANDSHAKE_MAX_FRAME,
        }
    }
}

/// What the pending request is waiting for.
enum Waiting {
    Open(Responder<()>),
    Handshake(Responder<()>),
    Command(CommandKind, Responder<Response>),
}

struct PendingRequest {
    waiting: Waiting,
    started: Instant,
    deadline: Instant,
}

impl PendingRequest {
    fn new(waiting: Waiting, timeout: std::time::Duration) -> Self {
        let started = Instant::now();
        Self {
            waiting,
            started,
            deadline: started + timeout,
        }
    }

    fn kind(&self) -> CommandKind {
        match &self.waiting {
            Waiting::Open(_) | Waiting::Handshake(_) => CommandKind::Handshake,
            Waiting::Command(kind, _) => *kind,
        }
    }

    fn fail(self, error: SerialError) {
        match self.waiting {
            Waiting::Open(r) | Waiting::Handshake(r) => {
                let _ = r.send(Err(error));
            }
            Waiting::Command(_, r) => {
                let _ = r.send(Err(error));
            }
        }
    }
}

/// Input to [`ProtocolEngine::handle`].
#[derive(Debug)]
pub enum Stimulus {
    Transport(TransportEvent),
    Deadline,
}

pub struct ProtocolEngine<T: Transport> {
    transport: T,
    events: Option<mpsc::Receiver<TransportEvent>>,
    state: EngineState,
    pending: Option<PendingRequest>,
    matcher: FrameMatcher,
    config: EngineConfig,
    port: Option<PortCandidate>,
    report_count: Option<u16>,
    metrics: SessionMetrics,
}

impl<T: Transport> ProtocolEngine<T> {
    pub fn new(transport: T, config: EngineConfig) -> Self {
        Self {
            transport,
            events: None,
            state: EngineState::Idle,
            pending: None,
            matcher: FrameMatcher::new(),
            config,
            port: None,
            report_count: None,
            metrics: SessionMetrics::default(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn port(&self) -> Option<&PortCandidate> {
        self.port.as_ref()
    }

    pub fn metrics(&self) -> &SessionMetrics {
        &self.metrics
    }

    /// Open `port` and run the handshake. The responder resolves once the
    /// device answers, or with the reason it did not.
    pub async fn connect(&mut self, port: PortCandidate, responder: Responder<()>) {
        if let Some(pending) = &self.pending {
            let _ = responder.send(Err(SerialError::RequestInFlight(pending.kind())));
            return;
        }

        // The previous port is fully released before the next one opens.
        self.release().await;

        match self.transport.open(&port, &self.config.line).await {
            Ok(events) => {
                log::debug!("Waiting for {} to open", port);
                self.events = Some(events);
                self.port = Some(port);
                self.state = EngineState::Connecting;
                self.pending = Some(PendingRequest::new(
                    Waiting::Open(responder),
                    self.config.timeouts.open,
                ));
            }
            Err(e) => {
                log::warn!("Could not open {}: {}", port, e);
                self.state = EngineState::Closed;
                let _ = responder.send(Err(e));
            }
        }
    }

    /// Issue one command. Fails fast if another request is pending.
    pub async fn submit(&mut self, kind: CommandKind, responder: Responder<Response>) {
        if let Some(pending) = &self.pending {
            let _ = responder.send(Err(SerialError::RequestInFlight(pending.kind())));
            return;
        }
        if self.state != EngineState::Ready {
            let _ = responder.send(Err(SerialError::NotConnected));
            return;
        }
        if let Some(number) = kind.report_number() {
            let out_of_range = number == 0 || self.report_count.is_some_and(|count| number > count);
            if out_of_range {
                let _ = responder.send(Err(SerialError::ReportIndexOutOfRange {
                    requested: number,
                    available: self.report_count.unwrap_or(0),
                }));
                return;
            }
        }

        let bytes = kind.encode();
        self.matcher.arm(kind.descriptor(self.config.handshake_max_frame));
        if let Err(e) = self.transport.send(&bytes).await {
            log::warn!("Failed to send {}: {}", kind, e);
            self.matcher.disarm();
            let _ = responder.send(Err(e));
            return;
        }
        log::debug!("-> {} [{}]", kind, hex::encode(&bytes));

        self.pending = Some(PendingRequest::new(
            Waiting::Command(kind, responder),
            self.config.timeouts.for_kind(kind),
        ));
        self.state = EngineState::AwaitingResponse(kind);
    }

    /// Abandon the session: the pending request is dropped without an
    /// outcome and the port is released.
    pub async fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            log::info!("Canceled {}", pending.kind());
        }
        self.matcher.disarm();
        if self.transport.is_open() || self.events.is_some() {
            self.release().await;
            self.state = EngineState::Closed;
        }
    }

    /// Close the port on request. A pending request fails with `Canceled`.
    pub async fn disconnect(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.fail(SerialError::Canceled);
        }
        self.matcher.disarm();
        self.release().await;
        self.state = EngineState::Idle;
    }

    /// Wait for the next transport event or for the pending deadline.
    pub async fn next_stimulus(&mut self) -> Stimulus {
        let deadline = self.pending.as_ref().map(|p| p.deadline);
        let events = &mut self.events;
        tokio::select! {
            event = async {
                match events {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => Stimulus::Transport(event.unwrap_or(TransportEvent::Closed)),
            _ = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            } => Stimulus::Deadline,
        }
    }

    pub async fn handle(&mut self, stimulus: Stimulus) {
        match stimulus {
            Stimulus::Deadline => self.on_deadline().await,
            Stimulus::Transport(event) => self.on_event(event).await,
        }
    }

    async fn on_deadline(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        self.metrics.command_timeouts += 1;
        let partial = self.matcher.disarm();
        if partial.is_empty() {
            log::warn!("{} timed out; no bytes received", pending.kind());
        } else {
            log::warn!(
                "{} timed out; partial reply: {}",
                pending.kind(),
                hex::encode(&partial)
            );
        }

        let error = match &pending.waiting {
            Waiting::Open(_) => SerialError::PortOpenTimeout,
            Waiting::Handshake(_) => SerialError::HandshakeTimeout,
            Waiting::Command(kind, _) => SerialError::CommandTimeout(*kind),
        };
        self.metrics.last_error = Some(error.to_string());
        if matches!(pending.waiting, Waiting::Command(..)) {
            self.state = EngineState::Ready;
        } else {
            self.release().await;
            self.state = EngineState::Closed;
        }
        pending.fail(error);
    }

    async fn on_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => self.on_opened().await,
            TransportEvent::Data(bytes) => self.on_data(&bytes).await,
            TransportEvent::Closed => self.on_link_lost(SerialError::PortClosed).await,
            TransportEvent::Removed => self.on_link_lost(SerialError::DeviceRemoved).await,
            TransportEvent::Error(message) => self.on_transport_error(message).await,
        }
    }

    async fn on_opened(&mut self) {
        let responder = match self.pending.take() {
            Some(PendingRequest {
                waiting: Waiting::Open(responder),
                ..
            }) => responder,
            other => {
                log::debug!("Ignoring unexpected opened signal");
                self.pending = other;
                return;
            }
        };

        let kind = CommandKind::Handshake;
        let bytes = kind.encode();
        self.matcher.arm(kind.descriptor(self.config.handshake_max_frame));
        if let Err(e) = self.transport.send(&bytes).await {
            self.matcher.disarm();
            self.release().await;
            self.state = EngineState::Closed;
            let _ = responder.send(Err(e));
            return;
        }
        log::debug!("-> {} [{}]", kind, hex::encode(&bytes));

        self.pending = Some(PendingRequest::new(
            Waiting::Handshake(responder),
            self.config.timeouts.handshake,
        ));
        self.state = EngineState::AwaitingResponse(kind);
    }

    async fn on_data(&mut self, bytes: &[u8]) {
        match self.matcher.push(bytes) {
            MatchResult::Incomplete => {}
            MatchResult::Unsolicited(n) => {
                log::debug!("Dropped {} unsolicited byte(s)", n);
            }
            MatchResult::Frame(frame) => {
                let Some(pending) = self.pending.take() else {
                    return;
                };
                log::debug!("<- {} [{}]", pending.kind(), hex::encode(&frame));
                self.complete(pending, frame).await;
            }
            MatchResult::Overflow(dropped) => {
                let Some(pending) = self.pending.take() else {
                    return;
                };
                self.metrics.framing_errors += 1;
                let error = SerialError::FramingError(format!(
                    "no terminator for {} within {} bytes",
                    pending.kind(),
                    dropped.len()
                ));
                log::warn!("{}; dropped {}", error, hex::encode(&dropped));
                self.metrics.last_error = Some(error.to_string());
                if matches!(pending.waiting, Waiting::Command(..)) {
                    self.state = EngineState::Ready;
                } else {
                    self.release().await;
                    self.state = EngineState::Closed;
                }
                pending.fail(error);
            }
        }
    }

    async fn complete(&mut self, pending: PendingRequest, frame: Vec<u8>) {
        let PendingRequest {
            waiting,
            started,
            deadline,
        } = pending;

        match waiting {
            Waiting::Open(responder) => {
                // Nothing is expected before the handshake goes out; the open keeps waiting.
                log::debug!("Dropped {} byte(s) received while opening", frame.len());
                self.pending = Some(PendingRequest {
                    waiting: Waiting::Open(responder),
                    started,
                    deadline,
                });
            }
            Waiting::Handshake(responder) => {
                self.metrics.record_latency(started.elapsed());
                self.state = EngineState::Ready;
                if let Some(port) = &self.port {
                    log::info!("Device answered handshake on {}", port);
                }
                self.metrics.commands_completed += 1;
                let _ = responder.send(Ok(()));
            }
            Waiting::Command(kind, responder) => {
                self.metrics.record_latency(started.elapsed());
                self.state = EngineState::Ready;
                self.decoded(kind, &frame, responder);
            }
        }
    }

    fn decoded(&mut self, kind: CommandKind, frame: &[u8], responder: Responder<Response>) {
        match decode_response(kind, frame) {
            Ok(response) => {
                if let Response::ReportCount(count) = response {
                    self.report_count = Some(count);
                }
                self.metrics.commands_completed += 1;
                let _ = responder.send(Ok(response));
            }
            Err(e) => {
                log::warn!("Could not decode {}: {}", kind, e);
                self.metrics.framing_errors += 1;
                self.metrics.last_error = Some(e.to_string());
                let _ = responder.send(Err(e));
            }
        }
    }

    async fn on_transport_error(&mut self, message: String) {
        log::warn!("Transport error: {}", message);
        self.metrics.last_error = Some(message.clone());
        let Some(pending) = self.pending.take() else {
            return;
        };
        self.matcher.disarm();
        match pending.waiting {
            Waiting::Command(..) => {
                self.state = EngineState::Ready;
                pending.fail(SerialError::Transport(message));
            }
            Waiting::Open(_) => {
                self.release().await;
                self.state = EngineState::Closed;
                pending.fail(SerialError::ConnectionFailed(message));
            }
            Waiting::Handshake(_) => {
                self.release().await;
                self.state = EngineState::Closed;
                pending.fail(SerialError::Transport(message));
            }
        }
    }

    async fn on_link_lost(&mut self, error: SerialError) {
        let pending = self.pending.take();
        self.matcher.disarm();
        if let Some(port) = &self.port {
            log::warn!("{}: {}", port, error);
        }
        self.metrics.last_error = Some(error.to_string());
        self.release().await;
        self.state = EngineState::Closed;
        if let Some(pending) = pending {
            pending.fail(error);
        }
    }

    async fn release(&mut self) {
        self.events = None;
        self.report_count = None;
        if self.transport.is_open() {
            if let Err(e) = self.transport.close().await {
                log::warn!("Error closing transport: {}", e);
            }
        }
        self.port = None;
    }
}
