use crate::UpwardConnection;
use graphlink_core::transport::{Address, Channel, TcpChannel, WsChannel};
use graphlink_core::{ProtocolError, TransportError};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::MaybeTlsStream;

/// Either channel flavour a controller can dial.
pub enum ClientChannel {
    Tcp(TcpChannel),
    WebSocket(WsChannel<MaybeTlsStream<TcpStream>>),
}

impl Channel for ClientChannel {
    async fn send(&mut self, frame: Value) -> Result<(), TransportError> {
        match self {
            ClientChannel::Tcp(chan) => chan.send(frame).await,
            ClientChannel::WebSocket(chan) => chan.send(frame).await,
        }
    }

    async fn recv(&mut self) -> Result<Option<Value>, TransportError> {
        match self {
            ClientChannel::Tcp(chan) => chan.recv().await,
            ClientChannel::WebSocket(chan) => chan.recv().await,
        }
    }

    async fn close(&mut self) {
        match self {
            ClientChannel::Tcp(chan) => chan.close().await,
            ClientChannel::WebSocket(chan) => chan.close().await,
        }
    }
}

/// Dial an engine at `tcp://host:port` or `ws://host:port[/path]`.
pub async fn connect(url: &str) -> Result<UpwardConnection<ClientChannel>, ProtocolError> {
    let channel = match Address::parse(url)? {
        addr @ Address::Tcp(_) => {
            let stream = TcpStream::connect(addr.host_port())
                .await
                .map_err(TransportError::from)?;
            stream.set_nodelay(true).map_err(TransportError::from)?;
            ClientChannel::Tcp(TcpChannel::tcp(stream))
        }
        Address::WebSocket(_) => {
            let (ws, _) = tokio_tungstenite::connect_async(url)
                .await
                .map_err(TransportError::from)?;
            ClientChannel::WebSocket(WsChannel::new(ws))
        }
    };
    tracing::info!(%url, "connected to engine");
    Ok(UpwardConnection::new(channel))
}
