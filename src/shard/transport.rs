//! Transport seam between the shard state machine and the network
//!
//! The state machine only sees text frames and close notifications, which
//! keeps it testable against an in-memory gateway.

use crate::error::GatewayError;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close frame sent by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

/// Something received from the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Closed(Option<CloseInfo>),
}

/// One live, exclusively owned connection
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, text: String) -> Result<(), GatewayError>;

    /// Next inbound item, `None` once the stream has ended.
    /// Must be cancel safe: it is polled inside `select!`.
    async fn recv(&mut self) -> Option<Result<Inbound, GatewayError>>;

    /// Release the connection; errors are irrelevant at this point
    async fn close(&mut self);
}

/// Opens transports
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, GatewayError>;
}

/// WebSocket connector backed by `tokio-tungstenite`
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, GatewayError> {
        debug!(url, "Opening gateway websocket");
        let (stream, _response) = connect_async(url).await.map_err(|e| GatewayError::Dial {
            url: url.to_string(),
            source: Box::new(e),
        })?;
        Ok(Box::new(WsTransport { stream }))
    }
}

struct WsTransport {
    stream: WsStream,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, text: String) -> Result<(), GatewayError> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| GatewayError::Transport(format!("send failed: {e}")))
    }

    async fn recv(&mut self) -> Option<Result<Inbound, GatewayError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(Inbound::Text(text.to_string()))),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Some(Ok(Inbound::Text(text))),
                    Err(e) => {
                        warn!(len = bytes.len(), error = %e, "Skipping non-utf8 binary frame");
                    }
                },
                Ok(Message::Close(frame)) => {
                    let info = frame.map(|f| CloseInfo {
                        code: f.code.into(),
                        reason: f.reason.to_string(),
                    });
                    return Some(Ok(Inbound::Closed(info)));
                }
                Ok(other) => {
                    trace!(kind = ?other, "Ignoring control frame");
                }
                Err(e) => return Some(Err(GatewayError::Transport(format!("receive failed: {e}")))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "Websocket close handshake failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_non_utf8_binary_frame_is_skipped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Binary(vec![0xff, 0xfe, 0x00].into()))
                .await
                .unwrap();
            ws.send(Message::Binary(br#"{"op":11}"#.to_vec().into()))
                .await
                .unwrap();
            ws.send(Message::Text(r#"{"op":0,"s":2}"#.into()))
                .await
                .unwrap();
            ws
        });

        let mut conn = WsConnector.connect(&format!("ws://{addr}")).await.unwrap();
        let first = conn.recv().await.unwrap().unwrap();
        assert_eq!(first, Inbound::Text(r#"{"op":11}"#.to_string()));
        let second = conn.recv().await.unwrap().unwrap();
        assert_eq!(second, Inbound::Text(r#"{"op":0,"s":2}"#.to_string()));

        let _ws = server.await.unwrap();
        conn.close().await;
    }
}
