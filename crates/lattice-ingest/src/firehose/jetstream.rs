//! Jetstream WebSocket transport.
//!
//! Jetstream serves the relay firehose as JSON text messages. The
//! subscription URL selects collections with repeated `wantedCollections`
//! parameters and resumes with `cursor`, which is inclusive, so the cursor
//! sent is one past the last processed sequence.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info};
use url::Url;

use super::{FirehoseTransport, RawFrame};
use crate::{Error, Result};

/// Public Jetstream instance.
pub const DEFAULT_ENDPOINT: &str = "wss://jetstream2.us-east.bsky.network/subscribe";

/// Connection settings.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Subscribe endpoint (`wss://host/subscribe`).
    pub endpoint: String,
    /// Collections to request.
    pub collections: Vec<String>,
    /// Give up on a connection attempt after this long.
    pub connect_timeout: Duration,
    /// Treat the connection as lost when no message arrives for this long.
    pub idle_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            collections: Vec::new(),
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

impl TransportConfig {
    /// Subscription URL resuming after `cursor`.
    pub fn subscription_url(&self, cursor: Option<u64>) -> Result<Url> {
        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| Error::Config(format!("invalid endpoint '{}': {}", self.endpoint, e)))?;

        {
            let mut query = url.query_pairs_mut();
            for collection in &self.collections {
                query.append_pair("wantedCollections", collection);
            }
            if let Some(cursor) = cursor {
                query.append_pair("cursor", &cursor.saturating_add(1).to_string());
            }
        }

        Ok(url)
    }
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// [`FirehoseTransport`] over a Jetstream WebSocket.
pub struct JetstreamTransport {
    config: TransportConfig,
    socket: Option<Socket>,
}

impl JetstreamTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            socket: None,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

#[async_trait]
impl FirehoseTransport for JetstreamTransport {
    async fn connect(&mut self, cursor: Option<u64>) -> Result<()> {
        self.close().await;

        let url = self.config.subscription_url(cursor)?;
        info!("Connecting to {} (cursor {:?})", self.config.endpoint, cursor);
        debug!("Subscription URL: {}", url);

        let (socket, response) =
            tokio::time::timeout(self.config.connect_timeout, connect_async(url.as_str()))
                .await
                .map_err(|_| {
                    Error::Transport(format!(
                        "connect timed out after {:?}",
                        self.config.connect_timeout
                    ))
                })?
                .map_err(|e| Error::Transport(format!("connect failed: {e}")))?;

        debug!("Relay handshake status {}", response.status());
        self.socket = Some(socket);
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        let idle_timeout = self.config.idle_timeout;
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| Error::Transport("not connected".to_string()))?;

        loop {
            let message = tokio::time::timeout(idle_timeout, socket.next())
                .await
                .map_err(|_| Error::Transport(format!("no message for {idle_timeout:?}")))?;

            match message {
                None => return Ok(None),
                Some(Err(e)) => return Err(Error::Transport(e.to_string())),
                Some(Ok(Message::Text(text))) => return Ok(Some(RawFrame(text))),
                Some(Ok(Message::Close(frame))) => {
                    info!("Relay closed the stream: {:?}", frame);
                    return Ok(None);
                }
                // Pings are answered by tungstenite on the next read.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Binary(bytes))) => {
                    debug!("Ignoring {} byte binary message", bytes.len());
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut socket) = self.socket.take()
            && let Err(e) = socket.close(None).await
        {
            debug!("Error closing relay socket: {}", e);
        }
    }
}
