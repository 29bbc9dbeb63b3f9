//! Push-channel keep-alive for the receiver's web UI.
//!
//! Holds one WebSocket connection to the web UI's `_push` endpoint and
//! re-establishes it whenever it drops or cannot be opened. Incoming
//! messages are read and discarded.

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use crate::config::ReceiverConfig;

/// Reconnecting WebSocket client
#[derive(Debug, Clone)]
pub struct KeepAlive {
    url: String,
    reconnect_delay: Duration,
}

impl KeepAlive {
    pub fn new(url: impl Into<String>, reconnect_delay: Duration) -> Self {
        Self {
            url: url.into(),
            reconnect_delay,
        }
    }

    pub fn from_config(config: &ReceiverConfig) -> Self {
        Self::new(
            config.ws_url.clone(),
            Duration::from_millis(config.reconnect_delay_ms),
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Connect once and hold the connection until the peer closes it
    ///
    /// # Errors
    ///
    /// Returns the handshake or read error that ended the connection.
    pub async fn hold_connection(&self) -> Result<(), WsError> {
        let (mut stream, _) = connect_async(self.url.as_str()).await?;
        info!("Connected to receiver push channel {}", self.url);

        while let Some(message) = stream.next().await {
            match message? {
                Message::Close(frame) => {
                    debug!("Push channel closed by peer: {:?}", frame);
                    break;
                }
                other => debug!("Discarding {} byte push message", other.len()),
            }
        }
        Ok(())
    }

    /// Reconnect forever
    pub async fn run(self) {
        loop {
            match self.hold_connection().await {
                Ok(()) => info!("Push channel {} closed, reconnecting", self.url),
                Err(e) => warn!("Push channel {} failed: {}", self.url, e),
            }
            sleep(self.reconnect_delay).await;
        }
    }
}

/// Spawn the keep-alive loop as a background task
pub fn spawn_keepalive(keepalive: KeepAlive) -> JoinHandle<()> {
    tokio::spawn(keepalive.run())
}
