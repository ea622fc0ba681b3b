//! Protocol error taxonomy shared by both sides of a connection.

use std::fmt;

/// Enumerated protocol error conditions.
///
/// The first group mirrors the codes carried on the wire between controller
/// and engine. The remaining kinds cover JSON-RPC framing and failures that
/// are only ever observed locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Operation attempted after a `Halt` was observed.
    ConnectionFinished,
    /// Operation attempted after the connection already failed.
    ConnectionErrored,
    /// A referenced device id is unknown (or not available) to the engine.
    InvalidDevice,
    /// A referenced endpoint does not exist on the named device.
    InvalidEndpoint,
    /// An endpoint was used in the wrong direction.
    InvalidDirection,
    /// Non-wildcard graph type filter did not match.
    GraphTypeMismatch,
    /// Non-wildcard graph instance filter did not match.
    GraphInstanceMismatch,
    /// Ownership credentials rejected.
    InvalidOwner,
    /// Owner cookie rejected.
    InvalidCookie,
    /// Operation not permitted in the current connection state.
    InvalidState,
    /// Malformed JSON-RPC request.
    InvalidRequest,
    /// Unknown RPC method.
    MethodNotFound,
    /// RPC params could not be decoded.
    InvalidParams,
    /// An engine callback failed for a reason outside the taxonomy.
    Engine,
    /// Malformed JSON-RPC response (controller side only).
    InvalidResponse,
    /// The underlying channel failed.
    Transport,
    /// The peer closed the channel.
    EndOfStream,
    /// A code received from the peer that this side does not know.
    Remote(i64),
}

impl ErrorKind {
    /// The wire code for this kind.
    pub fn code(self) -> i64 {
        match self {
            ErrorKind::ConnectionFinished => -1,
            ErrorKind::ConnectionErrored => -2,
            ErrorKind::InvalidDevice => -3,
            ErrorKind::InvalidEndpoint => -4,
            ErrorKind::InvalidDirection => -5,
            ErrorKind::GraphTypeMismatch => -6,
            ErrorKind::GraphInstanceMismatch => -7,
            ErrorKind::InvalidOwner => -9,
            ErrorKind::InvalidCookie => -10,
            ErrorKind::InvalidState => -11,
            ErrorKind::InvalidRequest => -32600,
            ErrorKind::MethodNotFound => -32601,
            ErrorKind::InvalidParams => -32602,
            ErrorKind::Engine => -32000,
            ErrorKind::InvalidResponse => -32001,
            ErrorKind::Transport => -32002,
            ErrorKind::EndOfStream => -32003,
            ErrorKind::Remote(code) => code,
        }
    }

    /// Map a wire code back to its kind.
    pub fn from_code(code: i64) -> Self {
        match code {
            -1 => ErrorKind::ConnectionFinished,
            -2 => ErrorKind::ConnectionErrored,
            -3 => ErrorKind::InvalidDevice,
            -4 => ErrorKind::InvalidEndpoint,
            -5 => ErrorKind::InvalidDirection,
            -6 => ErrorKind::GraphTypeMismatch,
            -7 => ErrorKind::GraphInstanceMismatch,
            -9 => ErrorKind::InvalidOwner,
            -10 => ErrorKind::InvalidCookie,
            -11 => ErrorKind::InvalidState,
            -32600 => ErrorKind::InvalidRequest,
            -32601 => ErrorKind::MethodNotFound,
            -32602 => ErrorKind::InvalidParams,
            -32000 => ErrorKind::Engine,
            other => ErrorKind::Remote(other),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Remote(code) => write!(f, "Remote({code})"),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

/// A protocol failure: the kind, plus a human-readable explanation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ProtocolError {
    kind: ErrorKind,
    message: String,
}

impl ProtocolError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Rebuild an error from the `{code, message}` pair of an RPC response.
    pub fn from_wire(code: i64, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::from_code(code), message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> i64 {
        self.kind.code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn finished() -> Self {
        Self::new(
            ErrorKind::ConnectionFinished,
            "connection has finished due to halt",
        )
    }

    pub fn errored() -> Self {
        Self::new(
            ErrorKind::ConnectionErrored,
            "connection has encountered an unrecoverable error",
        )
    }

    pub fn invalid_device(device: &str, reason: &str) -> Self {
        Self::new(ErrorKind::InvalidDevice, format!("{device}: {reason}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidParams, message)
    }

    pub fn transport(err: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Transport, err.to_string())
    }

    pub fn end_of_stream() -> Self {
        Self::new(ErrorKind::EndOfStream, "peer closed the channel")
    }
}

impl From<crate::endpoint::AddressingError> for ProtocolError {
    fn from(err: crate::endpoint::AddressingError) -> Self {
        Self::invalid_params(err.to_string())
    }
}

/// Failure of the byte/frame channel underneath the protocol.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("frame exceeds {0} bytes")]
    FrameTooLarge(usize),
    #[error("unsupported url '{0}', expected tcp:// or ws://")]
    UnsupportedUrl(String),
    #[error("channel is closed")]
    Closed,
}

impl From<TransportError> for ProtocolError {
    fn from(err: TransportError) -> Self {
        ProtocolError::transport(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_round_trip() {
        for kind in [
            ErrorKind::ConnectionFinished,
            ErrorKind::ConnectionErrored,
            ErrorKind::InvalidDevice,
            ErrorKind::InvalidEndpoint,
            ErrorKind::InvalidDirection,
            ErrorKind::GraphTypeMismatch,
            ErrorKind::GraphInstanceMismatch,
            ErrorKind::InvalidOwner,
            ErrorKind::InvalidCookie,
            ErrorKind::InvalidState,
            ErrorKind::MethodNotFound,
        ] {
            assert_eq!(ErrorKind::from_code(kind.code()), kind);
        }
    }

    #[test]
    fn unknown_codes_are_preserved() {
        let err = ProtocolError::from_wire(-77, "odd");
        assert_eq!(err.kind(), ErrorKind::Remote(-77));
        assert_eq!(err.code(), -77);
        assert_eq!(err.to_string(), "Remote(-77): odd");
    }

    #[test]
    fn addressing_errors_become_invalid_params() {
        let err: ProtocolError = "nosep"
            .parse::<crate::Endpoint>()
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), ErrorKind::InvalidParams);
    }
}
