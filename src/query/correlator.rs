//! Command queue and response correlation.
//!
//! The protocol has no request ids: the server answers commands strictly in
//! order and ends every answer with exactly one status line
//! (`error id=<n> msg=<text>`). Correlation therefore relies on keeping at
//! most one command in flight:
//!
//! ```text
//!            enqueue                 dispatch
//!   caller ──────────► [queue] ─────────────────► Executing ──► socket
//!                                                  │   ▲
//!                       data line (overwrites) ────┘   │
//!                       status line ──► settle sink ───┘ back to Idle
//! ```
//!
//! Notification lines can arrive at any point and never touch the queue.
//! This type does no I/O; the connection task feeds it lines and writes the
//! text returned by [`Correlator::dispatch`].

use std::collections::VecDeque;

use super::client::QueryError;
use super::command::{CommandSnapshot, QueryStatus, QueuedCommand};
use super::escape::EscapePolicy;
use super::events::Notification;
use super::parser::{parse_response_with, Record};

const STATUS_TOKEN: &str = "error";
const NOTIFY_PREFIX: &str = "notify";

/// How a received line is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind<'a> {
    /// Terminating status line; holds the text after the `error` token.
    Status(&'a str),
    /// Notification; `name` is the text between `notify` and the first space.
    /// The payload starts after that space, so the name never appears as a
    /// record field.
    Notification { name: &'a str, payload: &'a str },
    /// Anything else: data for the executing command.
    Data(&'a str),
}

/// Classify a trimmed line by its prefix.
pub fn classify(line: &str) -> LineKind<'_> {
    let (first, rest) = line.split_once(' ').unwrap_or((line, ""));

    if first == STATUS_TOKEN {
        return LineKind::Status(rest.trim_start());
    }

    if let Some(body) = line.strip_prefix(NOTIFY_PREFIX) {
        let (name, payload) = body.split_once(' ').unwrap_or((body, ""));
        return LineKind::Notification { name, payload };
    }

    LineKind::Data(line)
}

/// Result of feeding one line to the correlator.
#[derive(Debug, Clone, PartialEq)]
pub enum LineOutcome {
    /// The executing command finished with this status.
    Completed(QueryStatus),
    /// A notification to publish.
    Notification(Notification),
    /// Data stored on the executing command.
    Data,
    /// A status or data line arrived while nothing was executing.
    Unsolicited,
}

/// Whether a command is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelatorState {
    Idle,
    Executing,
}

/// The command currently awaiting its status line.
#[derive(Debug)]
struct InFlight {
    command: QueuedCommand,
    response: Option<Vec<Record>>,
    raw_response: Option<String>,
}

/// Serial command queue plus the single in-flight slot.
#[derive(Debug, Default)]
pub struct Correlator {
    queue: VecDeque<QueuedCommand>,
    executing: Option<InFlight>,
    policy: EscapePolicy,
}

impl Correlator {
    /// Empty correlator using `policy` to parse lines.
    pub fn new(policy: EscapePolicy) -> Self {
        Self {
            queue: VecDeque::new(),
            executing: None,
            policy,
        }
    }

    /// `Executing` while a command awaits its status line.
    pub fn state(&self) -> CorrelatorState {
        if self.executing.is_some() {
            CorrelatorState::Executing
        } else {
            CorrelatorState::Idle
        }
    }

    /// Whether no command is in flight.
    pub fn is_idle(&self) -> bool {
        self.executing.is_none()
    }

    /// Number of commands waiting for transmission.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Append to the tail of the queue.
    pub fn enqueue(&mut self, command: QueuedCommand) {
        self.queue.push_back(command);
    }

    /// Promote the head of the queue to executing and return its text.
    ///
    /// Returns `None` while a command is in flight or when the queue is
    /// empty. The caller writes the text followed by the line terminator.
    pub fn dispatch(&mut self) -> Option<String> {
        if self.executing.is_some() {
            return None;
        }
        let command = self.queue.pop_front()?;
        let text = command.text().to_string();
        self.executing = Some(InFlight {
            command,
            response: None,
            raw_response: None,
        });
        Some(text)
    }

    /// Route one trimmed, non-blank protocol line.
    pub fn handle_line(&mut self, line: &str) -> LineOutcome {
        match classify(line) {
            LineKind::Status(body) => {
                let records = parse_response_with(body, self.policy);
                let status = QueryStatus::from_record(records.as_ref().and_then(|r| r.first()));
                if self.complete(status.clone()) {
                    LineOutcome::Completed(status)
                } else {
                    LineOutcome::Unsolicited
                }
            }
            LineKind::Notification { name, payload } => {
                let records = parse_response_with(payload, self.policy).unwrap_or_default();
                LineOutcome::Notification(Notification::from_wire(name, records))
            }
            LineKind::Data(data) => match self.executing.as_mut() {
                Some(in_flight) => {
                    in_flight.response = parse_response_with(data, self.policy);
                    in_flight.raw_response = Some(data.to_string());
                    LineOutcome::Data
                }
                None => LineOutcome::Unsolicited,
            },
        }
    }

    /// Settle the executing command. Returns false if nothing was executing.
    fn complete(&mut self, status: QueryStatus) -> bool {
        let Some(in_flight) = self.executing.take() else {
            return false;
        };

        let error = (!status.is_ok()).then_some(status);
        let failed = error.is_some();
        let (response, sink) =
            in_flight
                .command
                .into_response(error, in_flight.response, in_flight.raw_response);

        let result = if failed {
            Err(QueryError::Query(Box::new(response)))
        } else {
            Ok(response)
        };
        if sink.send(result).is_err() {
            tracing::debug!("Caller dropped result receiver before completion");
        }
        true
    }

    /// Snapshots of the queued (not yet transmitted) commands, in order.
    pub fn pending(&self) -> Vec<CommandSnapshot> {
        self.queue.iter().map(QueuedCommand::snapshot).collect()
    }

    /// Remove every queued command without settling it. The executing
    /// command is not affected.
    pub fn clear_pending(&mut self) -> Vec<QueuedCommand> {
        self.queue.drain(..).collect()
    }

    /// Reject the executing command and every queued command.
    pub fn fail_all(&mut self, mut error: impl FnMut() -> QueryError) {
        if let Some(in_flight) = self.executing.take() {
            in_flight.command.reject(error());
        }
        for command in self.queue.drain(..) {
            command.reject(error());
        }
    }
}
