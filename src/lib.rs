//! TeamSpeak 3 ServerQuery client library.
//!
//! This library provides:
//!
//! - `query` - the connection core: command queue, response correlation and
//!   notification events
//! - `commands` - typed helpers for common commands
//! - `config` - connection settings
//!
//! # Example
//!
//! ```ignore
//! use ts3_serverquery::{ClientConfig, QueryClient};
//!
//! let client = QueryClient::connect_with(&ClientConfig::from_env()).await?;
//! client.login("serveradmin", "secret").await?;
//! client.use_server(1).await?;
//! for channel in client.channel_list(&[]).await? {
//!     println!("{} {}", channel.cid, channel.channel_name);
//! }
//! ```

pub mod commands;
pub mod config;
pub mod query;

pub use commands::NotifyEvent;
pub use config::ClientConfig;
pub use query::{Command, CommandResponse, ConnectionEvent, QueryClient, QueryError};
