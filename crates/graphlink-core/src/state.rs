//! Connection lifecycle shared by both sides of the protocol.
//!
//! `CONNECTED → BOUND → RUNNING → {FINISHED | ERRORED}`
//!
//! The controller and the engine each own one [`StateMachine`]. Every public
//! operation goes through [`StateMachine::begin`] before any transport or
//! callback work happens, and reports its outcome through
//! [`StateMachine::succeed`] or [`StateMachine::fail`].

use crate::{ErrorKind, ProtocolError};
use std::fmt;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Constructed, not yet bound.
    Connected,
    /// Graph identity and incoming edges are fixed.
    Bound,
    /// Poll, send and halt are legal.
    Running,
    /// A halt has been delivered.
    Finished,
    /// Something failed, or the connection was closed.
    Errored,
}

impl ConnectionState {
    /// The transition table: which operations each state accepts.
    pub fn permits(self, op: Operation) -> bool {
        match self {
            ConnectionState::Connected => op == Operation::Bind,
            ConnectionState::Bound => op == Operation::Run,
            ConnectionState::Running => {
                matches!(op, Operation::Poll | Operation::Send | Operation::Halt)
            }
            ConnectionState::Finished | ConnectionState::Errored => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Bound => "BOUND",
            ConnectionState::Running => "RUNNING",
            ConnectionState::Finished => "FINISHED",
            ConnectionState::Errored => "ERRORED",
        };
        f.write_str(name)
    }
}

/// A protocol operation, named as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Bind,
    Run,
    Poll,
    Send,
    Halt,
}

impl Operation {
    pub const ALL: [Operation; 5] = [
        Operation::Bind,
        Operation::Run,
        Operation::Poll,
        Operation::Send,
        Operation::Halt,
    ];

    /// The JSON-RPC method name.
    pub fn method(self) -> &'static str {
        match self {
            Operation::Bind => "bind",
            Operation::Run => "run",
            Operation::Poll => "poll",
            Operation::Send => "send",
            Operation::Halt => "halt",
        }
    }

    pub fn from_method(method: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.method() == method)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method())
    }
}

/// Monotonic connection state plus the rules for moving along it.
#[derive(Debug)]
pub struct StateMachine {
    state: ConnectionState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Connected,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Gate an operation before any work is done for it.
    ///
    /// A terminal state reports itself and stays put. Any other illegal
    /// operation is a usage error and moves the machine to `ERRORED`.
    pub fn begin(&mut self, op: Operation) -> Result<(), ProtocolError> {
        match self.state {
            ConnectionState::Errored => Err(ProtocolError::errored()),
            ConnectionState::Finished => Err(ProtocolError::finished()),
            state if state.permits(op) => Ok(()),
            state => {
                self.state = ConnectionState::Errored;
                Err(ProtocolError::new(
                    ErrorKind::InvalidState,
                    format!("`{op}` is not permitted in state {state}"),
                ))
            }
        }
    }

    /// Record a successful operation. `halted` is only meaningful for `poll`.
    pub fn succeed(&mut self, op: Operation, halted: bool) -> ConnectionState {
        debug_assert!(self.state.permits(op));
        self.state = match op {
            Operation::Bind => ConnectionState::Bound,
            Operation::Run => ConnectionState::Running,
            Operation::Poll if halted => ConnectionState::Finished,
            Operation::Poll | Operation::Send | Operation::Halt => self.state,
        };
        self.state
    }

    /// Record a failed operation.
    pub fn fail(&mut self) {
        self.state = ConnectionState::Errored;
    }

    /// Force the terminal error state. Idempotent.
    pub fn close(&mut self) {
        self.state = ConnectionState::Errored;
    }
}
