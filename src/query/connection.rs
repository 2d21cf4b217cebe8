//! The task that owns one query connection.
//!
//! A single spawned task owns the socket halves, the line framer, the
//! handshake and the [`Correlator`]. Callers never touch that state directly;
//! they send [`Request`]s over an unbounded channel, so queue mutation is
//! always single-writer.
//!
//! The task reacts to three sources:
//!
//! - a line from the server (handshake, status, notification or data),
//! - a request from a [`QueryClient`](super::client::QueryClient) handle,
//! - the idle timeout, if one is configured.
//!
//! After each of them it writes the head of the queue if the connection is
//! ready and no command is in flight.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};

use super::client::QueryError;
use super::command::{CommandSnapshot, QueuedCommand};
use super::correlator::{Correlator, LineOutcome};
use super::events::{ConnectionEvent, EventBus};
use super::framing::{write_line, LineFramer};
use super::handshake::{ConnectionState, Handshake, HandshakeStep};
use crate::config::ClientConfig;

/// Outcome of the preamble: `None` until decided.
pub(crate) type HandshakeOutcome = Option<Result<(), String>>;

/// Messages from client handles to the connection task.
#[derive(Debug)]
pub(crate) enum Request {
    Send(QueuedCommand),
    Pending(oneshot::Sender<Vec<CommandSnapshot>>),
    ClearPending(oneshot::Sender<Vec<QueuedCommand>>),
    SetIdleTimeout(Option<Duration>),
    Shutdown,
}

/// Channels a client handle keeps to talk to a spawned task.
#[derive(Debug)]
pub(crate) struct ConnectionHandles {
    pub requests: mpsc::UnboundedSender<Request>,
    pub state: watch::Receiver<ConnectionState>,
    pub handshake: watch::Receiver<HandshakeOutcome>,
    pub events: EventBus,
}

/// Why the task stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CloseReason {
    /// Server closed the stream.
    Eof,
    /// Explicit shutdown, or every client handle was dropped.
    Shutdown,
    IdleTimeout,
    Transport(String),
    Handshake(String),
}

impl CloseReason {
    fn describe(&self) -> String {
        match self {
            CloseReason::Eof => "Connection closed by server".to_string(),
            CloseReason::Shutdown => "Connection shut down".to_string(),
            CloseReason::IdleTimeout => "Connection idle timeout".to_string(),
            CloseReason::Transport(msg) | CloseReason::Handshake(msg) => msg.clone(),
        }
    }
}

/// What woke the task up.
enum Wakeup {
    Line(anyhow::Result<Option<String>>),
    Request(Option<Request>),
    Idle,
}

/// Spawn the connection task over an already-connected stream.
///
/// Must be called from within a Tokio runtime.
pub(crate) fn spawn<R, W>(reader: R, writer: W, config: &ClientConfig) -> ConnectionHandles
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ConnectionState::AwaitingGreeting);
    let (handshake_tx, handshake_rx) = watch::channel(None);
    let events = EventBus::new(config.event_capacity);

    let handshake = if config.strict_greeting {
        Handshake::strict(config.greeting.clone())
    } else {
        Handshake::lenient()
    };

    let task = ConnectionTask {
        framer: LineFramer::new(reader),
        writer,
        requests: request_rx,
        correlator: Correlator::new(config.escape_policy),
        handshake,
        events: events.clone(),
        state_tx,
        handshake_tx,
        idle_timeout: config.idle_timeout(),
        last_activity: Instant::now(),
    };
    tokio::spawn(task.run());

    ConnectionHandles {
        requests: request_tx,
        state: state_rx,
        handshake: handshake_rx,
        events,
    }
}

struct ConnectionTask<R, W> {
    framer: LineFramer<R>,
    writer: W,
    requests: mpsc::UnboundedReceiver<Request>,
    correlator: Correlator,
    handshake: Handshake,
    events: EventBus,
    state_tx: watch::Sender<ConnectionState>,
    handshake_tx: watch::Sender<HandshakeOutcome>,
    idle_timeout: Option<Duration>,
    last_activity: Instant,
}

impl<R, W> ConnectionTask<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn run(mut self) {
        let reason = self.drive().await;
        self.close(reason).await;
    }

    async fn drive(&mut self) -> CloseReason {
        loop {
            if let Err(reason) = self.pump().await {
                return reason;
            }

            let idle_deadline = self.idle_timeout.map(|limit| self.last_activity + limit);

            let wakeup = tokio::select! {
                line = self.framer.next_line() => Wakeup::Line(line),
                request = self.requests.recv() => Wakeup::Request(request),
                _ = idle(idle_deadline) => Wakeup::Idle,
            };

            match wakeup {
                Wakeup::Line(Ok(Some(line))) => {
                    self.last_activity = Instant::now();
                    if let Err(reason) = self.on_line(&line) {
                        return reason;
                    }
                }
                Wakeup::Line(Ok(None)) => return CloseReason::Eof,
                Wakeup::Line(Err(e)) => return CloseReason::Transport(format!("{:#}", e)),
                Wakeup::Request(None) | Wakeup::Request(Some(Request::Shutdown)) => {
                    return CloseReason::Shutdown
                }
                Wakeup::Request(Some(request)) => self.on_request(request),
                Wakeup::Idle => return CloseReason::IdleTimeout,
            }
        }
    }

    /// Transmit the head of the queue if ready and idle.
    async fn pump(&mut self) -> Result<(), CloseReason> {
        if !self.handshake.is_ready() {
            return Ok(());
        }

        if let Some(text) = self.correlator.dispatch() {
            // Only the verb is logged; parameters may hold credentials.
            let verb = text.split(' ').next().unwrap_or_default();
            debug!(command = verb, queued = self.correlator.queued(), "Dispatching command");

            write_line(&mut self.writer, &text)
                .await
                .map_err(|e| CloseReason::Transport(format!("{:#}", e)))?;
            self.last_activity = Instant::now();
        }

        Ok(())
    }

    fn on_line(&mut self, raw: &str) -> Result<(), CloseReason> {
        let line = raw.trim();
        if line.is_empty() {
            trace!("Skipping blank line");
            return Ok(());
        }

        if !self.handshake.is_ready() {
            match self.handshake.on_line(line) {
                HandshakeStep::Consumed => {
                    debug!("Greeting received");
                    self.state_tx.send_replace(self.handshake.state());
                    return Ok(());
                }
                HandshakeStep::Ready => {
                    info!("ServerQuery connection ready");
                    self.state_tx.send_replace(ConnectionState::Ready);
                    self.handshake_tx.send_replace(Some(Ok(())));
                    self.events.emit(ConnectionEvent::Connected);
                    return Ok(());
                }
                HandshakeStep::Rejected(reason) => return Err(CloseReason::Handshake(reason)),
                HandshakeStep::Passthrough => {}
            }
        }

        match self.correlator.handle_line(line) {
            LineOutcome::Completed(status) => {
                debug!(id = status.id, msg = %status.msg, "Command completed");
            }
            LineOutcome::Notification(notification) => {
                debug!(name = notification.name(), "Notification received");
                self.events.emit(ConnectionEvent::Notification(notification));
            }
            LineOutcome::Data => trace!("Response data received"),
            LineOutcome::Unsolicited => {
                warn!("Discarding line received with no command in flight: {}", line);
            }
        }

        Ok(())
    }

    fn on_request(&mut self, request: Request) {
        match request {
            Request::Send(command) => {
                debug!(command = command.command().name(), "Command queued");
                self.correlator.enqueue(command);
            }
            Request::Pending(reply) => {
                let _ = reply.send(self.correlator.pending());
            }
            Request::ClearPending(reply) => {
                let removed = self.correlator.clear_pending();
                debug!("Cleared {} pending commands", removed.len());
                // If the caller is gone the commands are dropped unsettled.
                let _ = reply.send(removed);
            }
            Request::SetIdleTimeout(limit) => {
                let limit = limit.filter(|d| !d.is_zero());
                debug!("Idle timeout set to {:?}", limit);
                self.idle_timeout = limit;
                self.last_activity = Instant::now();
            }
            Request::Shutdown => {}
        }
    }

    async fn close(mut self, reason: CloseReason) {
        self.handshake.close();

        match &reason {
            CloseReason::Transport(msg) | CloseReason::Handshake(msg) => {
                error!("Query connection error: {}", msg);
                self.events.emit(ConnectionEvent::Error(msg.clone()));
            }
            CloseReason::IdleTimeout => {
                warn!("No activity within idle timeout, closing query connection");
                self.events.emit(ConnectionEvent::Timeout);
            }
            CloseReason::Eof => info!("Server closed the query connection"),
            CloseReason::Shutdown => info!("Query connection shut down"),
        }

        self.handshake_tx.send_if_modified(|outcome| {
            if outcome.is_some() {
                return false;
            }
            *outcome = Some(Err(reason.describe()));
            true
        });
        self.state_tx.send_replace(ConnectionState::Closed);

        self.events.emit(ConnectionEvent::Closed {
            pending: self.correlator.pending(),
        });

        let failure = match &reason {
            CloseReason::Handshake(msg) => Some(msg.clone()),
            _ => None,
        };
        let make_error = || match &failure {
            Some(msg) => QueryError::Handshake(msg.clone()),
            None => QueryError::ConnectionClosed,
        };
        self.correlator.fail_all(make_error);

        // Commands that raced with the shutdown.
        self.requests.close();
        while let Ok(request) = self.requests.try_recv() {
            if let Request::Send(command) = request {
                command.reject(make_error());
            }
        }

        if let Err(e) = self.writer.shutdown().await {
            debug!("Failed to shut down query socket: {}", e);
        }
    }
}

async fn idle(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
