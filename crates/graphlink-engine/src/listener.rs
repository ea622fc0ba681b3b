//! Accept loops that hand each connection to a [`PseudoEngine`] session.

use crate::DownwardConnection;
use crate::pseudo::PseudoEngine;
use graphlink_core::TransportError;
use graphlink_core::transport::{Address, LineChannel, TcpChannel, WsChannel};
use std::net::SocketAddr;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tracing::Instrument;

/// A bound listening socket.
pub struct Listener {
    tcp: TcpListener,
    websocket: bool,
}

impl Listener {
    /// Bind `tcp://host:port` or `ws://host:port`. Port 0 picks a free port.
    pub async fn bind(url: &str) -> Result<Self, TransportError> {
        let address = Address::parse(url)?;
        let tcp = TcpListener::bind(address.host_port()).await?;
        Ok(Self {
            tcp,
            websocket: matches!(address, Address::WebSocket(_)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.tcp.local_addr()?)
    }

    /// The URL a controller should dial to reach this listener.
    pub fn url(&self) -> Result<String, TransportError> {
        let scheme = if self.websocket { "ws" } else { "tcp" };
        Ok(format!("{scheme}://{}", self.local_addr()?))
    }

    /// Serve connections until accepting fails.
    pub async fn run(self, engine: PseudoEngine) -> Result<(), TransportError> {
        tracing::info!(url = %self.url()?, "listening");
        loop {
            let (stream, peer) = self.tcp.accept().await?;
            let engine = engine.clone();
            let websocket = self.websocket;
            let span = tracing::info_span!("connection", %peer);
            tokio::spawn(
                async move {
                    tracing::info!("controller connected");
                    if let Err(e) = handle(stream, websocket, engine).await {
                        tracing::warn!(error = %e, "connection setup failed");
                    }
                }
                .instrument(span),
            );
        }
    }
}

async fn handle(
    stream: TcpStream,
    websocket: bool,
    engine: PseudoEngine,
) -> Result<(), TransportError> {
    stream.set_nodelay(true)?;
    let session = engine.session();
    if websocket {
        let ws = tokio_tungstenite::accept_async(stream).await?;
        DownwardConnection::new(WsChannel::new(ws)).serve(session).await;
    } else {
        DownwardConnection::new(TcpChannel::tcp(stream)).serve(session).await;
    }
    Ok(())
}

/// Serve a single controller over stdin/stdout.
pub async fn serve_stdio(engine: PseudoEngine) {
    let channel = LineChannel::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout());
    DownwardConnection::new(channel).serve(engine.session()).await;
}
