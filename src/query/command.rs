//! Outgoing commands, their rendered wire text and the results handed back
//! to callers.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use super::client::QueryError;
use super::escape::{escape_with, EscapePolicy};
use super::parser::Record;

/// Outcome delivered through a command's result sink.
pub type CommandResult = Result<CommandResponse, QueryError>;

/// A parameter value: one scalar, or one value per record for multi-record
/// commands such as `servergroupaddperm`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Single(String),
    List(Vec<String>),
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::Single(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        ParamValue::Single(s)
    }
}

impl From<&String> for ParamValue {
    fn from(s: &String) -> Self {
        ParamValue::Single(s.clone())
    }
}

macro_rules! param_from_number {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for ParamValue {
                fn from(n: $ty) -> Self {
                    ParamValue::Single(n.to_string())
                }
            }
        )*
    };
}

param_from_number!(i32, i64, u16, u32, u64);

impl From<bool> for ParamValue {
    fn from(b: bool) -> Self {
        ParamValue::Single(if b { "1" } else { "0" }.to_string())
    }
}

impl<T: ToString> From<Vec<T>> for ParamValue {
    fn from(values: Vec<T>) -> Self {
        ParamValue::List(values.iter().map(ToString::to_string).collect())
    }
}

/// A command as built by the caller, before it is queued.
///
/// # Example
///
/// ```ignore
/// let cmd = Command::new("clientlist").option("uid").option("away");
/// let cmd = Command::new("use").param("sid", 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    name: String,
    options: Vec<String>,
    parameters: Vec<(String, ParamValue)>,
}

impl Command {
    /// Start a command with the given verb and no options or parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: Vec::new(),
            parameters: Vec::new(),
        }
    }

    /// Add a `-flag` option.
    pub fn option(mut self, option: impl Into<String>) -> Self {
        self.options.push(option.into());
        self
    }

    /// Add or replace a parameter. Insertion order is kept on the wire.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        let key = key.into();
        let value = value.into();
        match self.parameters.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.parameters.push((key, value)),
        }
        self
    }

    /// Command verb.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Option names, without the leading `-`.
    pub fn options(&self) -> &[String] {
        &self.options
    }

    /// Parameters in insertion order.
    pub fn parameters(&self) -> &[(String, ParamValue)] {
        &self.parameters
    }

    /// Render the escaped command line, without the line terminator.
    ///
    /// Layout: name, then `-option`s, then scalar `key=value` pairs, then the
    /// list parameters as `|`-separated records. Record `i` holds the `i`-th
    /// value of every list parameter; lists shorter than the longest simply
    /// contribute nothing to the later records.
    pub fn render(&self, policy: EscapePolicy) -> String {
        let esc = |s: &str| escape_with(s, policy);

        let mut text = esc(&self.name);

        for option in &self.options {
            text.push_str(" -");
            text.push_str(&esc(option));
        }

        let mut lists: Vec<(&str, &[String])> = Vec::new();
        for (key, value) in &self.parameters {
            match value {
                ParamValue::Single(v) => {
                    text.push(' ');
                    text.push_str(&esc(key));
                    text.push('=');
                    text.push_str(&esc(v));
                }
                ParamValue::List(values) => lists.push((key, values)),
            }
        }

        let record_count = lists.iter().map(|(_, v)| v.len()).max().unwrap_or(0);
        if record_count > 0 {
            let records: Vec<String> = (0..record_count)
                .map(|i| {
                    lists
                        .iter()
                        .filter_map(|(key, values)| {
                            values.get(i).map(|v| format!("{}={}", esc(key), esc(v)))
                        })
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .collect();
            text.push(' ');
            text.push_str(&records.join("|"));
        }

        text
    }
}

/// Status carried by the terminating `error id=.. msg=..` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryStatus {
    pub id: i64,
    pub msg: String,
    /// Additional detail some failures carry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_msg: Option<String>,
    /// Permission that caused an `insufficient client permissions` failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_permid: Option<i64>,
}

impl QueryStatus {
    /// Build from the record of a status line. Missing fields read as a
    /// success, matching a bare `error` line.
    pub fn from_record(record: Option<&Record>) -> Self {
        let Some(record) = record else {
            return Self::ok();
        };

        // A non-numeric id is a malformed status, never a success.
        let id = match record.get("id") {
            Some(value) => value.as_int().unwrap_or(-1),
            None => 0,
        };

        Self {
            id,
            msg: record.get_string("msg").unwrap_or_default(),
            extra_msg: record.get_string("extra_msg"),
            failed_permid: record.get_int("failed_permid"),
        }
    }

    /// The `id=0 msg=ok` status.
    pub fn ok() -> Self {
        Self {
            id: 0,
            msg: "ok".to_string(),
            extra_msg: None,
            failed_permid: None,
        }
    }

    /// Whether the status id is zero.
    pub fn is_ok(&self) -> bool {
        self.id == 0
    }
}

/// Everything known about a finished command.
///
/// Delivered on success and, inside [`QueryError::Query`], on failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandResponse {
    pub cmd: String,
    pub options: Vec<String>,
    pub text: String,
    pub parameters: Vec<(String, ParamValue)>,
    /// Present only when the status id was non-zero.
    pub error: Option<QueryStatus>,
    /// Records of the last data line, if the command produced one.
    pub response: Option<Vec<Record>>,
    pub raw_response: Option<String>,
}

impl CommandResponse {
    /// Records of the response, empty if there was no data line.
    pub fn records(&self) -> &[Record] {
        self.response.as_deref().unwrap_or(&[])
    }

    /// First record of the response, if any.
    pub fn first(&self) -> Option<&Record> {
        self.records().first()
    }

    /// Status id, `0` for success.
    pub fn status_id(&self) -> i64 {
        self.error.as_ref().map_or(0, |e| e.id)
    }

    /// Status message, `ok` for success.
    pub fn status_message(&self) -> &str {
        self.error.as_ref().map_or("ok", |e| e.msg.as_str())
    }

    /// Decode every record into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Vec<T>, serde_json::Error> {
        self.records()
            .iter()
            .map(|r| serde_json::from_value(r.to_json()))
            .collect()
    }
}

/// Read-only view of a queued command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandSnapshot {
    pub cmd: String,
    pub options: Vec<String>,
    pub parameters: Vec<(String, ParamValue)>,
    pub text: String,
}

/// A command accepted into the queue together with its result sink.
///
/// The sink is settled at most once: [`QueuedCommand::resolve`] and
/// [`QueuedCommand::reject`] consume the command. Dropping it unsettled makes
/// the caller's [`PendingResponse`](super::client::PendingResponse) yield
/// [`QueryError::Cancelled`].
#[derive(Debug)]
pub struct QueuedCommand {
    command: Command,
    text: String,
    sink: oneshot::Sender<CommandResult>,
}

impl QueuedCommand {
    /// Render `command` and create the receiving half of its sink.
    pub fn new(command: Command, policy: EscapePolicy) -> (Self, oneshot::Receiver<CommandResult>) {
        let (sink, rx) = oneshot::channel();
        let text = command.render(policy);
        (Self { command, text, sink }, rx)
    }

    /// The command as submitted.
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// The rendered line, fixed at enqueue time.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Read-only copy for `pending()` and the `Closed` event.
    pub fn snapshot(&self) -> CommandSnapshot {
        CommandSnapshot {
            cmd: self.command.name.clone(),
            options: self.command.options.clone(),
            parameters: self.command.parameters.clone(),
            text: self.text.clone(),
        }
    }

    /// Combine the command with what the server sent back.
    pub(crate) fn into_response(
        self,
        error: Option<QueryStatus>,
        response: Option<Vec<Record>>,
        raw_response: Option<String>,
    ) -> (CommandResponse, oneshot::Sender<CommandResult>) {
        let Command {
            name,
            options,
            parameters,
        } = self.command;
        let response = CommandResponse {
            cmd: name,
            options,
            text: self.text,
            parameters,
            error,
            response,
            raw_response,
        };
        (response, self.sink)
    }

    /// Settle the caller's result with `response`.
    pub fn resolve(self, response: CommandResponse) {
        if self.sink.send(Ok(response)).is_err() {
            tracing::debug!("Result receiver dropped before resolve");
        }
    }

    /// Settle the caller's result with `error`.
    pub fn reject(self, error: QueryError) {
        if self.sink.send(Err(error)).is_err() {
            tracing::debug!("Result receiver dropped before reject");
        }
    }
}
