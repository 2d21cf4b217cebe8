//! Connection preamble handling.
//!
//! Right after connecting the server sends two lines before it accepts
//! commands: a greeting token (`TS3`) and a welcome message. Both are
//! consumed here; only then does the connection become [`ConnectionState::Ready`].

use serde::Serialize;

/// Greeting sent by a ServerQuery endpoint.
pub const DEFAULT_GREETING: &str = "TS3";

/// Lifecycle of one query connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    AwaitingGreeting,
    AwaitingWelcome,
    Ready,
    Closed,
}

/// What the handshake did with a line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Preamble line consumed, more expected.
    Consumed,
    /// Last preamble line consumed; commands may now be dispatched.
    Ready,
    /// The greeting did not match. The connection must be closed.
    Rejected(String),
    /// Handshake already complete; the line is protocol traffic.
    Passthrough,
}

/// Preamble state machine.
#[derive(Debug, Clone)]
pub struct Handshake {
    state: ConnectionState,
    /// Required first line; `None` accepts any greeting.
    expected_greeting: Option<String>,
}

impl Handshake {
    /// Start a handshake that requires `expected_greeting` as the first line.
    pub fn strict(expected_greeting: impl Into<String>) -> Self {
        Self {
            state: ConnectionState::AwaitingGreeting,
            expected_greeting: Some(expected_greeting.into()),
        }
    }

    /// Start a handshake that discards the first two lines unchecked.
    pub fn lenient() -> Self {
        Self {
            state: ConnectionState::AwaitingGreeting,
            expected_greeting: None,
        }
    }

    /// Current preamble state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether both preamble lines have been consumed.
    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    /// Mark the connection closed. Terminal.
    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }

    /// Feed one trimmed, non-blank line.
    pub fn on_line(&mut self, line: &str) -> HandshakeStep {
        match self.state {
            ConnectionState::AwaitingGreeting => {
                if let Some(expected) = &self.expected_greeting {
                    if line != expected {
                        let reason = format!(
                            "Remote server is not a ServerQuery endpoint (expected greeting {:?}, got {:?})",
                            expected, line
                        );
                        self.state = ConnectionState::Closed;
                        return HandshakeStep::Rejected(reason);
                    }
                }
                self.state = ConnectionState::AwaitingWelcome;
                HandshakeStep::Consumed
            }
            ConnectionState::AwaitingWelcome => {
                self.state = ConnectionState::Ready;
                HandshakeStep::Ready
            }
            ConnectionState::Ready | ConnectionState::Closed => HandshakeStep::Passthrough,
        }
    }
}
