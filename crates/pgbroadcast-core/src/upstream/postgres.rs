//! PostgreSQL `LISTEN` source backed by `sqlx`.

use async_trait::async_trait;
use sqlx::postgres::PgListener;
use tracing::{debug, warn};

use super::NotificationSource;
use crate::error::{Error, Result};

/// Notification source reading from a dedicated `PgListener` connection.
///
/// Every channel passed to [`listen`](NotificationSource::listen) is
/// remembered, and [`connect`](NotificationSource::connect) re-issues
/// `LISTEN` for all of them on a fresh connection.
///
/// `PgListener` reconnects on its own when a receive hits a broken
/// connection and then yields `None`, which `recv` passes on as `Ok(None)`.
/// If the adapter cancels `recv` while that reconnect is in flight, the
/// half-built connection is dropped and the next `recv` starts over.
pub struct PgSource {
    url: String,
    channels: Vec<String>,
    listener: Option<PgListener>,
}

impl PgSource {
    /// Create an unconnected source for the given connection string.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            channels: Vec::new(),
            listener: None,
        }
    }

    /// Channels this source listens on.
    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    fn listener(&mut self) -> Result<&mut PgListener> {
        self.listener
            .as_mut()
            .ok_or_else(|| Error::Transport("notification connection is not open".to_string()))
    }
}

#[async_trait]
impl NotificationSource for PgSource {
    async fn connect(&mut self) -> Result<()> {
        // Drop the old connection first so a broken socket is never reused.
        self.listener = None;

        let mut listener = PgListener::connect(&self.url).await?;
        if !self.channels.is_empty() {
            listener
                .listen_all(self.channels.iter().map(String::as_str))
                .await?;
        }
        debug!(channels = ?self.channels, "notification connection established");

        self.listener = Some(listener);
        Ok(())
    }

    async fn listen(&mut self, channel: &str) -> Result<()> {
        self.listener()?.listen(channel).await?;
        if !self.channels.iter().any(|c| c == channel) {
            self.channels.push(channel.to_string());
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        match self.listener()?.try_recv().await? {
            Some(notification) => {
                debug!(
                    channel = notification.channel(),
                    process_id = notification.process_id(),
                    "notification received"
                );
                Ok(Some(notification.payload().to_string()))
            }
            None => {
                warn!("notification connection lost and re-established");
                Ok(None)
            }
        }
    }

    async fn ping(&mut self) -> Result<()> {
        sqlx::query("SELECT 1").execute(self.listener()?).await?;
        Ok(())
    }
}
