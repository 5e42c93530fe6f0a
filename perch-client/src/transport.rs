//! Text-frame transport abstraction and the websocket implementation.

use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::{Error, Result};

/// A bidirectional stream of text frames. Implemented by [`WsTransport`] for
/// real connections and by in-memory mocks in tests.
pub trait Transport: Send + 'static {
    /// Send one text frame.
    fn send(&mut self, text: String) -> impl Future<Output = Result<()>> + Send;
    /// Receive the next text frame; `None` means the peer closed cleanly.
    fn recv(&mut self) -> impl Future<Output = Result<Option<String>>> + Send;
    /// Close the stream.
    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// Websocket transport over TLS.
pub struct WsTransport {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsTransport {
    /// Connect to `url`, sending `agent` as User-Agent and, when present,
    /// `cookies` as the Cookie header (session propagation).
    pub async fn connect(url: &str, agent: &str, cookies: Option<&str>) -> Result<WsTransport> {
        let mut request = url
            .into_client_request()
            .map_err(|e| Error::Transport(e.to_string()))?;
        let headers = request.headers_mut();
        headers.insert(
            "User-Agent",
            agent.parse().map_err(|_| Error::InvalidArg("agent".into()))?,
        );
        if let Some(cookies) = cookies {
            headers.insert(
                "Cookie",
                cookies
                    .parse()
                    .map_err(|_| Error::InvalidArg("cookies".into()))?,
            );
        }
        let (ws, response) = connect_async(request).await?;
        debug!(status = %response.status(), "websocket open");
        Ok(WsTransport { ws })
    }
}

impl Transport for WsTransport {
    async fn send(&mut self, text: String) -> Result<()> {
        self.ws.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                // Control frames are answered by the protocol layer below us.
                Some(Ok(Message::Ping(_)))
                | Some(Ok(Message::Pong(_)))
                | Some(Ok(Message::Binary(_)))
                | Some(Ok(Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.ws.close(None).await?;
        Ok(())
    }
}
