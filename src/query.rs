//! ServerQuery client core.
//!
//! This module implements the request/response correlation engine for the
//! line-based ServerQuery protocol: escaping, line framing, response parsing,
//! the serial command queue and the dispatch of out-of-band notifications.
//!
//! # Architecture
//!
//! A single connection task owns the socket. `QueryClient` handles only talk
//! to it through channels:
//!
//! ```text
//! ┌──────────────┐  Request (mpsc)   ┌──────────────────────────┐   TCP    ┌────────────┐
//! │ QueryClient  │ ─────────────────►│     connection task      │ ◄──────► │ ServerQuery│
//! │  (clones)    │ ◄─ oneshot ───────│ Handshake -> Correlator  │  lines   │   server   │
//! └──────────────┘                   └────────────┬─────────────┘          └────────────┘
//!        ▲                                        │ ConnectionEvent
//!        └────────────── broadcast ───────────────┘
//! ```
//!
//! # Protocol
//!
//! Every command is one escaped line. The server answers with zero or more
//! data lines and exactly one status line; notifications may arrive at any
//! time in between:
//!
//! ```text
//! > channellist
//! < cid=1 channel_name=Default\sChannel|cid=2 channel_name=AFK
//! < notifycliententerview clid=5 client_nickname=alice
//! < error id=0 msg=ok
//! ```
//!
//! Commands are transmitted one at a time in submission order.
//!
//! # Usage
//!
//! ```ignore
//! use ts3_serverquery::query::{Command, NotificationKind, QueryClient};
//!
//! let client = QueryClient::connect("localhost", 10011).await?;
//! let mut joins = client.subscribe_to(NotificationKind::ClientEnterView);
//! client.send(Command::new("servernotifyregister").param("event", "server")).await?;
//! while let Some(notification) = joins.recv().await {
//!     println!("{:?}", notification.records());
//! }
//! ```

mod client;
pub mod command;
mod connection;
pub mod correlator;
pub mod escape;
pub mod events;
pub mod framing;
pub mod handshake;
pub mod parser;

pub use client::{PendingResponse, QueryClient, QueryError};
pub use command::{
    Command, CommandResponse, CommandResult, CommandSnapshot, ParamValue, QueryStatus,
    QueuedCommand,
};
pub use escape::{escape, unescape, EscapePolicy};
pub use events::{
    ConnectionEvent, EventSubscription, Notification, NotificationKind,
    NotificationSubscription, TextMessage, TextMessageTargetMode,
};
pub use handshake::ConnectionState;
pub use parser::{parse_response, Record, Value};
