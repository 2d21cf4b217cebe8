//! Public client handle for a ServerQuery connection.
//!
//! `QueryClient` is a cheap, cloneable handle to the connection task. Sending
//! a command only appends it to the task's queue and returns a
//! [`PendingResponse`] right away; the response arrives once the server has
//! answered every command queued before it.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info};

use super::command::{Command, CommandResponse, CommandResult, CommandSnapshot, QueryStatus, QueuedCommand};
use super::connection::{self, HandshakeOutcome, Request};
use super::escape::EscapePolicy;
use super::events::{EventBus, EventSubscription, NotificationKind, NotificationSubscription};
use super::handshake::ConnectionState;
use crate::config::ClientConfig;

/// Query-specific error types.
///
/// Protocol errors are local to one command; transport errors close the
/// connection and reject every outstanding command.
#[derive(Debug, Error)]
pub enum QueryError {
    /// Failed to connect to the server.
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] std::io::Error),

    /// Connecting and reading the preamble took too long.
    #[error("Connection timed out after {0}s")]
    ConnectTimeout(u64),

    /// The server did not complete the ServerQuery preamble.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// `send` was called with an empty command name.
    #[error("Empty command")]
    EmptyCommand,

    /// The server answered with a non-zero status id.
    #[error("Query error {}: {}", .0.status_id(), .0.status_message())]
    Query(Box<CommandResponse>),

    /// The connection is closed; the command was not (fully) executed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The command was removed from the queue and dropped unsettled.
    #[error("Command cancelled before completion")]
    Cancelled,

    /// The response could not be decoded into the expected type.
    #[error("Failed to decode response: {0}")]
    Decode(String),

    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

impl QueryError {
    /// Server status of a failed command.
    pub fn status(&self) -> Option<&QueryStatus> {
        match self {
            QueryError::Query(response) => response.error.as_ref(),
            _ => None,
        }
    }
}

impl From<std::io::Error> for QueryError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
                QueryError::ConnectionFailed(err)
            }
            _ => QueryError::Io(err),
        }
    }
}

impl From<serde_json::Error> for QueryError {
    fn from(err: serde_json::Error) -> Self {
        QueryError::Decode(err.to_string())
    }
}

/// Result handle for a queued command.
///
/// Resolves once the command's status line has been received, or with
/// [`QueryError::ConnectionClosed`] if the connection goes away first.
#[derive(Debug)]
#[must_use = "a command's result is only observable through its PendingResponse"]
pub struct PendingResponse {
    rx: oneshot::Receiver<CommandResult>,
}

impl Future for PendingResponse {
    type Output = CommandResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(QueryError::Cancelled)))
    }
}

/// Handle to a ServerQuery connection.
///
/// # Example
///
/// ```ignore
/// use ts3_serverquery::{Command, QueryClient};
///
/// let client = QueryClient::connect("localhost", 10011).await?;
/// client
///     .send(
///         Command::new("login")
///             .param("client_login_name", "serveradmin")
///             .param("client_login_password", "secret"),
///     )
///     .await?;
/// let channels = client.send(Command::new("channellist")).await?;
/// ```
#[derive(Debug, Clone)]
pub struct QueryClient {
    requests: mpsc::UnboundedSender<Request>,
    state: watch::Receiver<ConnectionState>,
    handshake: watch::Receiver<HandshakeOutcome>,
    events: EventBus,
    escape_policy: EscapePolicy,
}

impl QueryClient {
    /// Connect to `host:port` and wait for the preamble.
    ///
    /// # Errors
    ///
    /// Returns `QueryError::ConnectionFailed` if the connection is refused,
    /// `QueryError::Handshake` if the server is not a ServerQuery endpoint
    /// and `QueryError::ConnectTimeout` if either step takes too long.
    pub async fn connect(host: &str, port: u16) -> Result<Self, QueryError> {
        Self::connect_with(&ClientConfig::new(host, port)).await
    }

    /// Connect using a full configuration.
    pub async fn connect_with(config: &ClientConfig) -> Result<Self, QueryError> {
        let limit = config.connect_timeout();

        let attempt = async {
            info!("Connecting to ServerQuery at {}:{}", config.host, config.port);
            let stream = TcpStream::connect((config.host.as_str(), config.port)).await?;
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Failed to set TCP_NODELAY: {}", e);
            }

            let (reader, writer) = stream.into_split();
            let client = Self::from_stream(reader, writer, config);
            client.ready().await?;
            Ok::<_, QueryError>(client)
        };

        match timeout(limit, attempt).await {
            Ok(result) => result,
            Err(_) => Err(QueryError::ConnectTimeout(limit.as_secs())),
        }
    }

    /// Start a connection over an already-open stream.
    ///
    /// Returns immediately; commands sent before the preamble completes are
    /// queued. Use [`QueryClient::ready`] to wait for the handshake. Must be
    /// called from within a Tokio runtime.
    ///
    /// Subscribing between this call and `ready()` is the only way to observe
    /// [`ConnectionEvent::Connected`](super::events::ConnectionEvent::Connected);
    /// `connect` returns after it has been emitted.
    pub fn from_stream<R, W>(reader: R, writer: W, config: &ClientConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let handles = connection::spawn(reader, writer, config);
        Self {
            requests: handles.requests,
            state: handles.state,
            handshake: handles.handshake,
            events: handles.events,
            escape_policy: config.escape_policy,
        }
    }

    /// Wait until the server preamble has been consumed.
    ///
    /// # Errors
    ///
    /// Returns `QueryError::Handshake` if the connection failed or closed
    /// before becoming ready, and `QueryError::ConnectionClosed` if it became
    /// ready but has closed since.
    pub async fn ready(&self) -> Result<(), QueryError> {
        let mut handshake = self.handshake.clone();
        let outcome = handshake
            .wait_for(Option::is_some)
            .await
            .map_err(|_| QueryError::ConnectionClosed)?
            .clone();

        match outcome {
            Some(Ok(())) if self.is_closed() => Err(QueryError::ConnectionClosed),
            Some(Ok(())) => Ok(()),
            Some(Err(reason)) => Err(QueryError::Handshake(reason)),
            None => Err(QueryError::ConnectionClosed),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Whether the connection has closed for good.
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Wait until the connection has closed.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    /// Queue a command and return its result handle without waiting.
    ///
    /// # Errors
    ///
    /// Returns `QueryError::EmptyCommand` for an empty command name and
    /// `QueryError::ConnectionClosed` if the connection is gone. Neither
    /// touches the queue.
    pub fn submit(&self, command: Command) -> Result<PendingResponse, QueryError> {
        if command.name().is_empty() {
            return Err(QueryError::EmptyCommand);
        }

        let (queued, rx) = QueuedCommand::new(command, self.escape_policy);
        self.requests
            .send(Request::Send(queued))
            .map_err(|_| QueryError::ConnectionClosed)?;

        Ok(PendingResponse { rx })
    }

    /// Queue a command and wait for its response.
    ///
    /// # Errors
    ///
    /// Returns `QueryError::Query` with the full response when the server
    /// reports a non-zero status id.
    pub async fn send(&self, command: Command) -> Result<CommandResponse, QueryError> {
        self.submit(command)?.await
    }

    /// Snapshot of the commands waiting for transmission, in order.
    /// The command currently in flight is not included.
    pub async fn pending(&self) -> Result<Vec<CommandSnapshot>, QueryError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request::Pending(reply))
            .map_err(|_| QueryError::ConnectionClosed)?;
        rx.await.map_err(|_| QueryError::ConnectionClosed)
    }

    /// Remove every command that has not been transmitted yet.
    ///
    /// The removed commands are returned unsettled: their callers keep
    /// waiting until the returned values are resolved, rejected or dropped
    /// (which yields `QueryError::Cancelled`). The command in flight is not
    /// affected.
    pub async fn clear_pending(&self) -> Result<Vec<QueuedCommand>, QueryError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request::ClearPending(reply))
            .map_err(|_| QueryError::ConnectionClosed)?;
        rx.await.map_err(|_| QueryError::ConnectionClosed)
    }

    /// Close the connection after `limit` without socket activity, or never
    /// with `None` or a zero duration. On expiry a `Timeout` event is emitted and the
    /// connection closes.
    pub fn set_idle_timeout(&self, limit: Option<Duration>) -> Result<(), QueryError> {
        self.requests
            .send(Request::SetIdleTimeout(limit))
            .map_err(|_| QueryError::ConnectionClosed)
    }

    /// Close the connection. Outstanding commands are rejected with
    /// `QueryError::ConnectionClosed`.
    pub fn shutdown(&self) {
        let _ = self.requests.send(Request::Shutdown);
    }

    /// Subscribe to all connection events.
    ///
    /// Only events emitted after this call are received. A client returned by
    /// `connect` is already ready, so its subscribers never see `Connected`.
    pub fn subscribe(&self) -> EventSubscription {
        let subscription = self.events.subscribe();
        if self.is_closed() {
            subscription.finish()
        } else {
            subscription
        }
    }

    /// Subscribe to one kind of server notification.
    ///
    /// The server only sends notifications after `servernotifyregister`.
    pub fn subscribe_to(&self, kind: NotificationKind) -> NotificationSubscription {
        let subscription = self.events.subscribe_to(kind);
        if self.is_closed() {
            subscription.finish()
        } else {
            subscription
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parser::parse_response;

    fn failed_response(id: i64, msg: &str) -> CommandResponse {
        CommandResponse {
            cmd: "use".into(),
            options: vec![],
            text: "use sid=9".into(),
            parameters: vec![],
            error: Some(QueryStatus {
                id,
                msg: msg.into(),
                extra_msg: None,
                failed_permid: None,
            }),
            response: None,
            raw_response: None,
        }
    }

    #[test]
    fn test_query_error_display() {
        let err = QueryError::Query(Box::new(failed_response(1024, "invalid serverID")));
        assert_eq!(err.to_string(), "Query error 1024: invalid serverID");
        assert_eq!(err.status().map(|s| s.id), Some(1024));

        assert_eq!(QueryError::ConnectTimeout(10).to_string(), "Connection timed out after 10s");
        assert_eq!(QueryError::EmptyCommand.to_string(), "Empty command");
        assert_eq!(QueryError::ConnectionClosed.status(), None);
    }

    #[test]
    fn test_query_error_from_io() {
        let not_found = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let err: QueryError = not_found.into();
        assert!(matches!(err, QueryError::ConnectionFailed(_)));

        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: QueryError = refused.into();
        assert!(matches!(err, QueryError::ConnectionFailed(_)));

        let other = std::io::Error::new(std::io::ErrorKind::Other, "other");
        let err: QueryError = other.into();
        assert!(matches!(err, QueryError::Io(_)));
    }

    #[test]
    fn test_query_error_from_json() {
        let response = CommandResponse {
            response: parse_response("cid=abc"),
            ..failed_response(0, "ok")
        };

        #[derive(Debug, serde::Deserialize)]
        #[allow(dead_code)]
        struct Entry {
            cid: i64,
        }

        let err: QueryError = response.decode::<Entry>().unwrap_err().into();
        assert!(matches!(err, QueryError::Decode(_)));
    }

    #[tokio::test]
    async fn test_empty_command_rejected_without_queueing() {
        let (client_io, _server_io) = tokio::io::duplex(64);
        let (reader, writer) = tokio::io::split(client_io);
        let client = QueryClient::from_stream(reader, writer, &ClientConfig::default());

        assert!(matches!(client.submit(Command::new("")), Err(QueryError::EmptyCommand)));
        assert!(client.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_queued_command_reports_cancelled() {
        let (client_io, _server_io) = tokio::io::duplex(64);
        let (reader, writer) = tokio::io::split(client_io);
        let client = QueryClient::from_stream(reader, writer, &ClientConfig::default());

        // Not ready yet, so the command stays queued.
        let pending = client.submit(Command::new("version")).unwrap();
        let removed = client.clear_pending().await.unwrap();
        assert_eq!(removed.len(), 1);
        drop(removed);

        assert!(matches!(pending.await, Err(QueryError::Cancelled)));
    }

    #[tokio::test]
    async fn test_from_stream_subscriber_sees_connected_and_ready_reports_close() {
        use crate::query::events::ConnectionEvent;
        use tokio::io::AsyncWriteExt;
        use tokio::time::timeout;

        const TEST_TIMEOUT: Duration = Duration::from_secs(5);

        let (client_io, mut server_io) = tokio::io::duplex(256);
        let (reader, writer) = tokio::io::split(client_io);
        let client = QueryClient::from_stream(reader, writer, &ClientConfig::default());
        let mut events = client.subscribe();

        server_io.write_all(b"TS3\n\rWelcome\n\r").await.unwrap();
        timeout(TEST_TIMEOUT, client.ready())
            .await
            .expect("Test timed out")
            .expect("Handshake should succeed");
        let event = timeout(TEST_TIMEOUT, events.recv()).await.expect("Test timed out");
        assert!(matches!(event, Some(ConnectionEvent::Connected)));

        client.shutdown();
        timeout(TEST_TIMEOUT, client.closed()).await.expect("Test timed out");

        let result = timeout(TEST_TIMEOUT, client.ready()).await.expect("Test timed out");
        assert!(matches!(result, Err(QueryError::ConnectionClosed)));
    }
}
