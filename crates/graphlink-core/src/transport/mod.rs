//! Message-framed, order-preserving channels carrying JSON values.
//!
//! Two framings are provided:
//! - [`LineChannel`]: one JSON value per line over any async byte stream
//!   (`tcp://` URLs, stdio, in-memory pipes).
//! - [`WsChannel`]: one JSON value per WebSocket text frame (`ws://` URLs).

mod lines;
mod ws;

pub use lines::{LineChannel, MAX_FRAME, MemoryChannel, TcpChannel, memory_pair};
pub use ws::WsChannel;

use crate::TransportError;
use serde_json::Value;
use std::future::Future;

/// A reliable, bidirectional frame channel.
pub trait Channel: Send {
    /// Write one frame.
    fn send(&mut self, frame: Value) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Read the next frame. `None` means the peer closed the channel.
    fn recv(&mut self) -> impl Future<Output = Result<Option<Value>, TransportError>> + Send;

    /// Close the channel. Further sends fail and further receives see end of
    /// stream.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Channel flavour selected by a listen or connect URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// `tcp://host:port`
    Tcp(String),
    /// `ws://host:port[/path]`
    WebSocket(String),
}

impl Address {
    /// Parse `tcp://...` or `ws://...`.
    pub fn parse(url: &str) -> Result<Self, TransportError> {
        if let Some(rest) = url.strip_prefix("tcp://") {
            Ok(Address::Tcp(rest.to_string()))
        } else if let Some(rest) = url.strip_prefix("ws://") {
            Ok(Address::WebSocket(rest.to_string()))
        } else {
            Err(TransportError::UnsupportedUrl(url.to_string()))
        }
    }

    /// The `host:port` part, without any path.
    pub fn host_port(&self) -> &str {
        let rest = match self {
            Address::Tcp(rest) | Address::WebSocket(rest) => rest.as_str(),
        };
        rest.split('/').next().unwrap_or(rest)
    }
}
