//! WebSocket framing: one JSON value per text frame.

use super::Channel;
use crate::TransportError;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{self, Message};

pub struct WsChannel<S> {
    ws: WebSocketStream<S>,
    closed: bool,
}

impl<S> WsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(ws: WebSocketStream<S>) -> Self {
        Self { ws, closed: false }
    }
}

impl<S> Channel for WsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: Value) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let text = serde_json::to_string(&frame)?;
        self.ws.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Value>, TransportError> {
        if self.closed {
            return Ok(None);
        }
        while let Some(msg) = self.ws.next().await {
            match msg {
                Ok(Message::Text(text)) => return Ok(Some(serde_json::from_str(text.as_str())?)),
                Ok(Message::Close(_)) => return Ok(None),
                // Control and binary frames carry no protocol traffic.
                Ok(_) => continue,
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            if let Err(e) = self.ws.close(None).await {
                tracing::debug!(error = %e, "websocket close failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn frames_cross_a_websocket() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(async move {
            let ws = tokio_tungstenite::accept_async(server_io).await.unwrap();
            let mut chan = WsChannel::new(ws);
            let frame = chan.recv().await.unwrap().unwrap();
            chan.send(json!({"echo": frame})).await.unwrap();
            chan.recv().await.unwrap()
        });

        let (ws, _) = tokio_tungstenite::client_async("ws://localhost/", client_io)
            .await
            .unwrap();
        let mut chan = WsChannel::new(ws);
        chan.send(json!([1])).await.unwrap();
        assert_eq!(chan.recv().await.unwrap(), Some(json!({"echo": [1]})));
        chan.close().await;
        assert_eq!(server.await.unwrap(), None);
    }
}
