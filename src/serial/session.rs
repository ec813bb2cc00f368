//! Session task and its handle.
//!
//! [`SessionBuilder::build`] moves a [`ProtocolEngine`] into a dedicated
//! task. Every caller operation is a message on one channel, and every
//! transport event and timeout is observed by the same task, so requests
//! and replies can never interleave. Each operation carries a `oneshot`
//! responder and resolves exactly once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};

use super::engine::{EngineConfig, EngineState, ProtocolEngine, Responder};
use super::protocol::{CommandKind, Response, Timeouts};
use super::transport::{LineParams, Transport};
use super::{PortCandidate, Result, SerialError};
use crate::config::Settings;
use crate::report::Report;

const COMMAND_CAPACITY: usize = 16;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub commands_completed: u64,
    pub command_timeouts: u64,
    pub framing_errors: u64,
    pub last_error: Option<String>,
    pub last_latency_ms: Option<u64>,
    pub min_latency_ms: Option<u64>,
    pub max_latency_ms: Option<u64>,
}

impl SessionMetrics {
    pub(crate) fn record_latency(&mut self, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        self.last_latency_ms = Some(ms);
        self.min_latency_ms = Some(self.min_latency_ms.map_or(ms, |m| m.min(ms)));
        self.max_latency_ms = Some(self.max_latency_ms.map_or(ms, |m| m.max(ms)));
    }
}

#[derive(Debug)]
enum SessionCommand {
    Connect {
        port: PortCandidate,
        responder: Responder<()>,
    },
    Request {
        kind: CommandKind,
        responder: Responder<Response>,
    },
    Cancel {
        done: oneshot::Sender<()>,
    },
    Disconnect {
        done: oneshot::Sender<()>,
    },
    Shutdown,
}

#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::Sender<SessionCommand>,
    state_rx: watch::Receiver<EngineState>,
    metrics_rx: watch::Receiver<SessionMetrics>,
    // Bumped by every cancel; a request issued under an older value
    // resolves as canceled whatever the engine answered.
    cancel_epoch: Arc<AtomicU64>,
}

impl SessionHandle {
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn metrics(&self) -> SessionMetrics {
        self.metrics_rx.borrow().clone()
    }

    pub fn metrics_receiver(&self) -> watch::Receiver<SessionMetrics> {
        self.metrics_rx.clone()
    }

    /// Open `port` and perform the handshake. Any previous port is closed first.
    pub async fn connect(&self, port: &PortCandidate) -> Result<()> {
        let epoch = self.cancel_epoch.load(Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.dispatch(SessionCommand::Connect {
            port: port.clone(),
            responder: tx,
        })
        .await?;
        self.outcome(epoch, rx).await
    }

    pub async fn report_count(&self) -> Result<u16> {
        match self.request(CommandKind::GetReportCount).await? {
            Response::ReportCount(count) => Ok(count),
            other => Err(unexpected(CommandKind::GetReportCount, &other)),
        }
    }

    /// Fetch the header of report `number` (1-based) as a new [`Report`].
    pub async fn report_header(&self, number: u16) -> Result<Report> {
        let kind = CommandKind::GetReportHeader(number);
        match self.request(kind).await? {
            Response::ReportHeader { number, header } => Ok(Report::from_header(number, &header)),
            other => Err(unexpected(kind, &other)),
        }
    }

    /// Fetch the sample stream of `report` and store it on the report.
    pub async fn report_data(&self, report: &mut Report) -> Result<()> {
        let kind = CommandKind::GetReportData(report.number);
        match self.request(kind).await? {
            Response::ReportData { samples, .. } => {
                report.set_data(&samples);
                Ok(())
            }
            other => Err(unexpected(kind, &other)),
        }
    }

    /// Issue a raw command and wait for its single outcome.
    pub async fn request(&self, kind: CommandKind) -> Result<Response> {
        let epoch = self.cancel_epoch.load(Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.dispatch(SessionCommand::Request {
            kind,
            responder: tx,
        })
        .await?;
        self.outcome(epoch, rx).await
    }

    /// Abandon whatever is in flight and release the port. Callers waiting
    /// on a request issued before this point get [`SerialError::Canceled`]
    /// and never see its reply, even one already received. Returns once
    /// the port has been released.
    pub async fn cancel(&self) {
        self.cancel_epoch.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(SessionCommand::Cancel { done: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn disconnect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(SessionCommand::Disconnect { done: tx }).await?;
        rx.await.map_err(|_| SerialError::Canceled)
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Shutdown).await;
    }

    async fn outcome<T>(&self, epoch: u64, rx: oneshot::Receiver<Result<T>>) -> Result<T> {
        let result = rx.await.map_err(|_| SerialError::Canceled)?;
        if self.cancel_epoch.load(Ordering::SeqCst) != epoch {
            return Err(SerialError::Canceled);
        }
        result
    }

    async fn dispatch(&self, command: SessionCommand) -> Result<()> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| SerialError::Transport("session task stopped".into()))
    }
}

fn unexpected(kind: CommandKind, response: &Response) -> SerialError {
    SerialError::FramingError(format!("unexpected reply to {}: {:?}", kind, response))
}

pub struct SessionBuilder<T: Transport> {
    pub transport: T,
    pub config: EngineConfig,
    pub command_capacity: usize,
}

impl<T: Transport + 'static> SessionBuilder<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            config: EngineConfig::default(),
            command_capacity: COMMAND_CAPACITY,
        }
    }

    pub fn settings(mut self, settings: &Settings) -> Self {
        self.config = EngineConfig {
            line: settings.line_params(),
            timeouts: settings.timeouts(),
            handshake_max_frame: settings.handshake_max_frame,
        };
        self
    }

    pub fn line_params(mut self, line: LineParams) -> Self {
        self.config.line = line;
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.config.timeouts = timeouts;
        self
    }

    pub fn build(self) -> SessionHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(self.command_capacity);
        let (state_tx, state_rx) = watch::channel(EngineState::Idle);
        let (metrics_tx, metrics_rx) = watch::channel(SessionMetrics::default());

        let engine = ProtocolEngine::new(self.transport, self.config);
        tokio::spawn(session_task(engine, cmd_rx, state_tx, metrics_tx));

        SessionHandle {
            cmd_tx,
            state_rx,
            metrics_rx,
            cancel_epoch: Arc::new(AtomicU64::new(0)),
        }
    }
}

async fn session_task<T: Transport>(
    mut engine: ProtocolEngine<T>,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    state_tx: watch::Sender<EngineState>,
    metrics_tx: watch::Sender<SessionMetrics>,
) {
    loop {
        // Caller commands first, so a queued cancel beats a buffered reply.
        tokio::select! {
            biased;
            command = cmd_rx.recv() => match command {
                Some(SessionCommand::Connect { port, responder }) => {
                    engine.connect(port, responder).await;
                }
                Some(SessionCommand::Request { kind, responder }) => {
                    engine.submit(kind, responder).await;
                }
                Some(SessionCommand::Cancel { done }) => {
                    engine.cancel().await;
                    let _ = done.send(());
                }
                Some(SessionCommand::Disconnect { done }) => {
                    engine.disconnect().await;
                    let _ = done.send(());
                }
                Some(SessionCommand::Shutdown) | None => break,
            },
            stimulus = engine.next_stimulus() => engine.handle(stimulus).await,
        }
        publish(&engine, &state_tx, &metrics_tx);
    }

    engine.disconnect().await;
    publish(&engine, &state_tx, &metrics_tx);
    log::debug!("Session task stopped");
}

fn publish<T: Transport>(
    engine: &ProtocolEngine<T>,
    state_tx: &watch::Sender<EngineState>,
    metrics_tx: &watch::Sender<SessionMetrics>,
) {
    let state = engine.state();
    state_tx.send_if_modified(|current| {
        if *current != state {
            *current = state;
            true
        } else {
            false
        }
    });
    let metrics = engine.metrics();
    metrics_tx.send_if_modified(|current| {
        if *current != *metrics {
            *current = metrics.clone();
            true
        } else {
            false
        }
    });
}
