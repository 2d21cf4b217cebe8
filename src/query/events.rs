//! Connection events and server notifications.
//!
//! Unsolicited `notify<name> ...` lines are turned into [`Notification`]s and
//! broadcast together with connection lifecycle events. Subscribers either
//! receive everything ([`EventSubscription`]) or only one notification kind
//! ([`NotificationSubscription`]).

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use super::command::CommandSnapshot;
use super::parser::Record;

/// Default number of buffered events per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Lifecycle and notification events of one connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Preamble consumed; commands are being dispatched.
    Connected,
    /// A notification line arrived.
    Notification(Notification),
    /// Transport or handshake failure. Always followed by `Closed`.
    Error(String),
    /// No socket activity within the idle timeout. Followed by `Closed`.
    Timeout,
    /// The connection is gone. Carries the commands that were still queued;
    /// their callers receive `QueryError::ConnectionClosed`.
    Closed { pending: Vec<CommandSnapshot> },
}

/// Notification names the server is known to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    ClientEnterView,
    ClientLeftView,
    ServerEdited,
    ChannelDescriptionChanged,
    ChannelPasswordChanged,
    ChannelMoved,
    ChannelEdited,
    ChannelCreated,
    ChannelDeleted,
    ClientMoved,
    TextMessage,
    TokenUsed,
    Unknown,
}

impl NotificationKind {
    /// Map a wire name (the text after `notify`) to a kind.
    pub fn from_name(name: &str) -> Self {
        match name {
            "cliententerview" => NotificationKind::ClientEnterView,
            "clientleftview" => NotificationKind::ClientLeftView,
            "serveredited" => NotificationKind::ServerEdited,
            "channeldescriptionchanged" => NotificationKind::ChannelDescriptionChanged,
            "channelpasswordchanged" => NotificationKind::ChannelPasswordChanged,
            "channelmoved" => NotificationKind::ChannelMoved,
            "channeledited" => NotificationKind::ChannelEdited,
            "channelcreated" => NotificationKind::ChannelCreated,
            "channeldeleted" => NotificationKind::ChannelDeleted,
            "clientmoved" => NotificationKind::ClientMoved,
            "textmessage" => NotificationKind::TextMessage,
            "tokenused" => NotificationKind::TokenUsed,
            _ => NotificationKind::Unknown,
        }
    }

    /// Wire name, or `None` for [`NotificationKind::Unknown`].
    pub fn name(&self) -> Option<&'static str> {
        match self {
            NotificationKind::ClientEnterView => Some("cliententerview"),
            NotificationKind::ClientLeftView => Some("clientleftview"),
            NotificationKind::ServerEdited => Some("serveredited"),
            NotificationKind::ChannelDescriptionChanged => Some("channeldescriptionchanged"),
            NotificationKind::ChannelPasswordChanged => Some("channelpasswordchanged"),
            NotificationKind::ChannelMoved => Some("channelmoved"),
            NotificationKind::ChannelEdited => Some("channeledited"),
            NotificationKind::ChannelCreated => Some("channelcreated"),
            NotificationKind::ChannelDeleted => Some("channeldeleted"),
            NotificationKind::ClientMoved => Some("clientmoved"),
            NotificationKind::TextMessage => Some("textmessage"),
            NotificationKind::TokenUsed => Some("tokenused"),
            NotificationKind::Unknown => None,
        }
    }
}

/// Target of a text message (`targetmode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextMessageTargetMode {
    Client = 1,
    Channel = 2,
    Server = 3,
}

impl TextMessageTargetMode {
    /// Map the wire value; unknown modes give `None`.
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(TextMessageTargetMode::Client),
            2 => Some(TextMessageTargetMode::Channel),
            3 => Some(TextMessageTargetMode::Server),
            _ => None,
        }
    }

    /// Wire value of this mode.
    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

/// Payload of `notifytextmessage`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextMessage {
    pub targetmode: Option<TextMessageTargetMode>,
    pub msg: String,
    /// Only present for private messages.
    pub target: Option<i64>,
    pub invoker_id: Option<i64>,
    pub invoker_name: Option<String>,
    pub invoker_uid: Option<String>,
}

impl TextMessage {
    fn from_records(records: &[Record]) -> Self {
        let record = records.first();
        let int = |key: &str| record.and_then(|r| r.get_int(key));
        let text = |key: &str| record.and_then(|r| r.get_string(key));

        Self {
            targetmode: int("targetmode").and_then(TextMessageTargetMode::from_i64),
            msg: text("msg").unwrap_or_default(),
            target: int("target"),
            invoker_id: int("invokerid"),
            invoker_name: text("invokername"),
            invoker_uid: text("invokeruid"),
        }
    }
}

/// A decoded server notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    ClientEnterView(Vec<Record>),
    ClientLeftView(Vec<Record>),
    ServerEdited(Vec<Record>),
    ChannelDescriptionChanged(Vec<Record>),
    ChannelPasswordChanged(Vec<Record>),
    ChannelMoved(Vec<Record>),
    ChannelEdited(Vec<Record>),
    ChannelCreated(Vec<Record>),
    ChannelDeleted(Vec<Record>),
    ClientMoved(Vec<Record>),
    /// Decoded text message plus the raw records it came from.
    TextMessage {
        message: TextMessage,
        records: Vec<Record>,
    },
    TokenUsed(Vec<Record>),
    /// Any notification without a dedicated variant.
    Unknown { name: String, records: Vec<Record> },
}

impl Notification {
    /// Build from the event name and the parsed records that followed it.
    pub fn from_wire(name: &str, records: Vec<Record>) -> Self {
        match NotificationKind::from_name(name) {
            NotificationKind::ClientEnterView => Notification::ClientEnterView(records),
            NotificationKind::ClientLeftView => Notification::ClientLeftView(records),
            NotificationKind::ServerEdited => Notification::ServerEdited(records),
            NotificationKind::ChannelDescriptionChanged => {
                Notification::ChannelDescriptionChanged(records)
            }
            NotificationKind::ChannelPasswordChanged => Notification::ChannelPasswordChanged(records),
            NotificationKind::ChannelMoved => Notification::ChannelMoved(records),
            NotificationKind::ChannelEdited => Notification::ChannelEdited(records),
            NotificationKind::ChannelCreated => Notification::ChannelCreated(records),
            NotificationKind::ChannelDeleted => Notification::ChannelDeleted(records),
            NotificationKind::ClientMoved => Notification::ClientMoved(records),
            NotificationKind::TextMessage => Notification::TextMessage {
                message: TextMessage::from_records(&records),
                records,
            },
            NotificationKind::TokenUsed => Notification::TokenUsed(records),
            NotificationKind::Unknown => Notification::Unknown {
                name: name.to_string(),
                records,
            },
        }
    }

    /// Kind of this notification.
    pub fn kind(&self) -> NotificationKind {
        match self {
            Notification::ClientEnterView(_) => NotificationKind::ClientEnterView,
            Notification::ClientLeftView(_) => NotificationKind::ClientLeftView,
            Notification::ServerEdited(_) => NotificationKind::ServerEdited,
            Notification::ChannelDescriptionChanged(_) => NotificationKind::ChannelDescriptionChanged,
            Notification::ChannelPasswordChanged(_) => NotificationKind::ChannelPasswordChanged,
            Notification::ChannelMoved(_) => NotificationKind::ChannelMoved,
            Notification::ChannelEdited(_) => NotificationKind::ChannelEdited,
            Notification::ChannelCreated(_) => NotificationKind::ChannelCreated,
            Notification::ChannelDeleted(_) => NotificationKind::ChannelDeleted,
            Notification::ClientMoved(_) => NotificationKind::ClientMoved,
            Notification::TextMessage { .. } => NotificationKind::TextMessage,
            Notification::TokenUsed(_) => NotificationKind::TokenUsed,
            Notification::Unknown { .. } => NotificationKind::Unknown,
        }
    }

    /// Wire name of this notification.
    pub fn name(&self) -> &str {
        match self {
            Notification::Unknown { name, .. } => name.as_str(),
            other => other.kind().name().unwrap_or_default(),
        }
    }

    /// Raw records of the notification line.
    pub fn records(&self) -> &[Record] {
        match self {
            Notification::ClientEnterView(r)
            | Notification::ClientLeftView(r)
            | Notification::ServerEdited(r)
            | Notification::ChannelDescriptionChanged(r)
            | Notification::ChannelPasswordChanged(r)
            | Notification::ChannelMoved(r)
            | Notification::ChannelEdited(r)
            | Notification::ChannelCreated(r)
            | Notification::ChannelDeleted(r)
            | Notification::ClientMoved(r)
            | Notification::TokenUsed(r)
            | Notification::TextMessage { records: r, .. }
            | Notification::Unknown { records: r, .. } => r,
        }
    }
}

/// Sending side of the event fan-out, owned by the connection task.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ConnectionEvent>,
}

impl EventBus {
    /// Bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: ConnectionEvent) {
        let _ = self.tx.send(event);
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            finished: false,
        }
    }

    /// Receive notifications of `kind` emitted from now on.
    pub fn subscribe_to(&self, kind: NotificationKind) -> NotificationSubscription {
        NotificationSubscription {
            rx: self.tx.subscribe(),
            kind,
            finished: false,
        }
    }
}

/// Receives every connection event.
#[derive(Debug)]
pub struct EventSubscription {
    rx: broadcast::Receiver<ConnectionEvent>,
    finished: bool,
}

impl EventSubscription {
    /// Subscription on a connection that already closed.
    pub(crate) fn finish(mut self) -> Self {
        self.finished = true;
        self
    }

    /// Next event. Yields `Closed` once, then `None`.
    ///
    /// A subscriber that falls behind skips the overwritten events.
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        if self.finished {
            return None;
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    self.finished = matches!(event, ConnectionEvent::Closed { .. });
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }
}

/// Receives notifications of a single kind.
#[derive(Debug)]
pub struct NotificationSubscription {
    rx: broadcast::Receiver<ConnectionEvent>,
    kind: NotificationKind,
    finished: bool,
}

impl NotificationSubscription {
    /// Kind this subscription filters on.
    pub fn kind(&self) -> NotificationKind {
        self.kind
    }

    /// Subscription on a connection that already closed.
    pub(crate) fn finish(mut self) -> Self {
        self.finished = true;
        self
    }

    /// Next matching notification, or `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Notification> {
        while !self.finished {
            match self.rx.recv().await {
                Ok(ConnectionEvent::Notification(n)) if n.kind() == self.kind => return Some(n),
                Ok(ConnectionEvent::Closed { .. }) | Err(broadcast::error::RecvError::Closed) => {
                    self.finished = true;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "Notification subscriber for {:?} lagged, skipped {} events",
                        self.kind, skipped
                    );
                }
            }
        }
        None
    }
}
