//! Engine side of the graphlink protocol.
//!
//! [`DownwardConnection`] takes calls off a channel and dispatches them to an
//! [`EngineHandler`]. [`PseudoEngine`] is an in-memory engine running a small
//! echo graph, served over TCP, WebSocket or stdio by [`Listener`].

mod config;
mod connection;
mod handler;
mod listener;
mod pseudo;
pub mod topology;

pub use config::{ConfigError, DEFAULT_LISTEN, EngineConfig};
pub use connection::DownwardConnection;
pub use handler::EngineHandler;
pub use listener::{Listener, serve_stdio};
pub use pseudo::{EngineOptions, PseudoEngine, Session};
