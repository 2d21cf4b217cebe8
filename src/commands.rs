//! Typed helpers for common ServerQuery commands.
//!
//! Every helper builds a [`Command`] and goes through [`QueryClient::send`],
//! so it is queued and correlated like any other command. Responses are
//! decoded with serde from the parsed records.
//!
//! The parser turns canonical numbers into integers, so text fields that may
//! look numeric (a channel called `42`, a build number) are decoded with a
//! lenient deserializer that accepts either form.

use serde::{Deserialize, Deserializer, Serialize};

use crate::query::parser::Value;
use crate::query::{Command, CommandResponse, QueryClient, QueryError, TextMessageTargetMode};

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(|v| v.to_string())
}

fn lenient_opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<Value>::deserialize(deserializer).map(|v| v.map(|v| v.to_string()))
}

/// Decode the first record of a response.
fn decode_first<T: serde::de::DeserializeOwned>(response: &CommandResponse) -> Result<T, QueryError> {
    response
        .decode::<T>()?
        .into_iter()
        .next()
        .ok_or_else(|| QueryError::Decode(format!("'{}' returned no records", response.cmd)))
}

/// Event groups for `servernotifyregister`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyEvent {
    /// Clients joining and leaving, server edits.
    Server,
    /// Channel events for one channel; `0` means all channels.
    Channel(u64),
    TextServer,
    TextChannel,
    TextPrivate,
    TokenUsed,
}

impl NotifyEvent {
    /// Value of the `event` parameter.
    pub fn event_name(&self) -> &'static str {
        match self {
            NotifyEvent::Server => "server",
            NotifyEvent::Channel(_) => "channel",
            NotifyEvent::TextServer => "textserver",
            NotifyEvent::TextChannel => "textchannel",
            NotifyEvent::TextPrivate => "textprivate",
            NotifyEvent::TokenUsed => "tokenused",
        }
    }

    /// Build the `servernotifyregister` command for this event.
    pub fn register_command(&self) -> Command {
        let command = Command::new("servernotifyregister").param("event", self.event_name());
        match self {
            NotifyEvent::Channel(id) => command.param("id", *id),
            _ => command,
        }
    }
}

/// Reason for `clientkick`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KickReason {
    /// Move the client to the default channel.
    Channel = 4,
    /// Disconnect the client from the server.
    Server = 5,
}

/// Response of `version`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionInfo {
    #[serde(deserialize_with = "lenient_string")]
    pub version: String,
    #[serde(deserialize_with = "lenient_string")]
    pub build: String,
    #[serde(deserialize_with = "lenient_string")]
    pub platform: String,
}

/// Response of `whoami`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WhoAmI {
    #[serde(deserialize_with = "lenient_string")]
    pub virtualserver_status: String,
    pub virtualserver_id: i64,
    #[serde(deserialize_with = "lenient_string")]
    pub virtualserver_unique_identifier: String,
    pub virtualserver_port: i64,
    pub client_id: i64,
    pub client_channel_id: i64,
    #[serde(deserialize_with = "lenient_string")]
    pub client_nickname: String,
    pub client_database_id: i64,
    #[serde(deserialize_with = "lenient_string")]
    pub client_login_name: String,
    #[serde(deserialize_with = "lenient_string")]
    pub client_unique_identifier: String,
}

/// One entry of `serverlist`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerEntry {
    pub virtualserver_id: i64,
    pub virtualserver_port: i64,
    #[serde(deserialize_with = "lenient_string")]
    pub virtualserver_status: String,
    pub virtualserver_clientsonline: i64,
    pub virtualserver_queryclientsonline: i64,
    pub virtualserver_maxclients: i64,
    pub virtualserver_uptime: i64,
    #[serde(deserialize_with = "lenient_string")]
    pub virtualserver_name: String,
    pub virtualserver_autostart: i64,
}

/// One entry of `channellist`. Optional fields are only sent when the
/// matching option (`-topic`, `-flags`, ...) was requested.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelEntry {
    pub cid: i64,
    pub pid: i64,
    pub channel_order: i64,
    #[serde(deserialize_with = "lenient_string")]
    pub channel_name: String,
    pub total_clients: i64,
    pub channel_needed_subscribe_power: i64,
    #[serde(deserialize_with = "lenient_opt_string")]
    pub channel_topic: Option<String>,
    pub channel_flag_default: Option<i64>,
    pub channel_flag_password: Option<i64>,
    pub channel_flag_permanent: Option<i64>,
    pub channel_maxclients: Option<i64>,
}

/// One entry of `clientlist`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientEntry {
    pub clid: i64,
    pub cid: i64,
    pub client_database_id: i64,
    #[serde(deserialize_with = "lenient_string")]
    pub client_nickname: String,
    /// `0` for voice clients, `1` for query clients.
    pub client_type: i64,
    #[serde(deserialize_with = "lenient_opt_string")]
    pub client_unique_identifier: Option<String>,
    pub client_away: Option<i64>,
    #[serde(deserialize_with = "lenient_opt_string")]
    pub client_away_message: Option<String>,
    pub client_idle_time: Option<i64>,
    #[serde(deserialize_with = "lenient_opt_string")]
    pub client_platform: Option<String>,
    #[serde(deserialize_with = "lenient_opt_string")]
    pub client_version: Option<String>,
}

impl ClientEntry {
    /// Whether this is a ServerQuery connection rather than a voice client.
    pub fn is_query_client(&self) -> bool {
        self.client_type == 1
    }
}

impl QueryClient {
    /// Authenticate with ServerQuery credentials.
    ///
    /// # Errors
    ///
    /// Returns `QueryError::Query` with status 520 for bad credentials.
    pub async fn login(&self, username: &str, password: &str) -> Result<CommandResponse, QueryError> {
        self.send(
            Command::new("login")
                .param("client_login_name", username)
                .param("client_login_password", password),
        )
        .await
    }

    /// Drop the authentication of this connection.
    pub async fn logout(&self) -> Result<CommandResponse, QueryError> {
        self.send(Command::new("logout")).await
    }

    /// Ask the server to close the connection.
    pub async fn quit(&self) -> Result<CommandResponse, QueryError> {
        self.send(Command::new("quit")).await
    }

    /// Server version, build and platform.
    pub async fn version(&self) -> Result<VersionInfo, QueryError> {
        decode_first(&self.send(Command::new("version")).await?)
    }

    /// Identity and selected server of this query connection.
    pub async fn whoami(&self) -> Result<WhoAmI, QueryError> {
        decode_first(&self.send(Command::new("whoami")).await?)
    }

    /// Select a virtual server by id.
    pub async fn use_server(&self, sid: u64) -> Result<CommandResponse, QueryError> {
        self.send(Command::new("use").param("sid", sid)).await
    }

    /// Select a virtual server by its voice port.
    pub async fn use_port(&self, port: u16) -> Result<CommandResponse, QueryError> {
        self.send(Command::new("use").param("port", port)).await
    }

    /// List the virtual servers of the instance.
    pub async fn server_list(&self) -> Result<Vec<ServerEntry>, QueryError> {
        Ok(self.send(Command::new("serverlist")).await?.decode()?)
    }

    /// List channels. `options` are flag names without the leading `-`,
    /// e.g. `["topic", "flags"]`.
    pub async fn channel_list(&self, options: &[&str]) -> Result<Vec<ChannelEntry>, QueryError> {
        let command = options
            .iter()
            .fold(Command::new("channellist"), |cmd, opt| cmd.option(*opt));
        Ok(self.send(command).await?.decode()?)
    }

    /// List clients. `options` are flag names such as `uid` or `away`.
    pub async fn client_list(&self, options: &[&str]) -> Result<Vec<ClientEntry>, QueryError> {
        let command = options
            .iter()
            .fold(Command::new("clientlist"), |cmd, opt| cmd.option(*opt));
        Ok(self.send(command).await?.decode()?)
    }

    /// Send a text message to a client, channel or the whole server.
    pub async fn send_text_message(
        &self,
        mode: TextMessageTargetMode,
        target: u64,
        message: &str,
    ) -> Result<CommandResponse, QueryError> {
        self.send(
            Command::new("sendtextmessage")
                .param("targetmode", mode.as_i64())
                .param("target", target)
                .param("msg", message),
        )
        .await
    }

    /// Broadcast a message to every virtual server.
    pub async fn gm(&self, message: &str) -> Result<CommandResponse, QueryError> {
        self.send(Command::new("gm").param("msg", message)).await
    }

    /// Send a poke message to a client.
    pub async fn client_poke(&self, clid: u64, message: &str) -> Result<CommandResponse, QueryError> {
        self.send(Command::new("clientpoke").param("clid", clid).param("msg", message))
            .await
    }

    /// Kick one or more clients in a single command.
    pub async fn client_kick(
        &self,
        clids: &[u64],
        reason: KickReason,
        message: Option<&str>,
    ) -> Result<CommandResponse, QueryError> {
        let mut command = Command::new("clientkick")
            .param("clid", clids.to_vec())
            .param("reasonid", reason as i64);
        if let Some(message) = message {
            command = command.param("reasonmsg", message);
        }
        self.send(command).await
    }

    /// Start receiving notifications for `event`.
    pub async fn register_notifications(&self, event: NotifyEvent) -> Result<CommandResponse, QueryError> {
        self.send(event.register_command()).await
    }

    /// Stop receiving all notifications.
    pub async fn unregister_notifications(&self) -> Result<CommandResponse, QueryError> {
        self.send(Command::new("servernotifyunregister")).await
    }
}
