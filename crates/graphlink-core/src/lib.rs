//! Core types for the graphlink external connection protocol.
//!
//! A controller (upward side) binds a set of devices inside a running graph
//! engine (downward side), exchanges multicast messages with them, and
//! terminates the run. This crate provides what both sides share: endpoint
//! addressing, the event model, the error taxonomy, the connection state
//! machine, and the JSON-RPC framing over a [`transport::Channel`].

mod endpoint;
mod error;
mod event;
pub mod protocol;
pub mod rpc;
mod state;
pub mod transport;

pub use endpoint::{AddressingError, Endpoint};
pub use error::{ErrorKind, ProtocolError, TransportError};
pub use event::{Event, Halt, MulticastMessage, contains_halt};
pub use protocol::{BindParams, BindResult, IncomingEdges};
pub use state::{ConnectionState, Operation, StateMachine};
