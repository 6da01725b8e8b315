//! Client sessions.
//!
//! A [`Connection`] pairs a reader, which consumes the client's frames and
//! turns text frames into subscriptions, with a writer task, which drains the
//! outbound queue and keeps the peer alive with pings. The transport is any
//! `Sink<Frame>` / `Stream<Item = Result<Frame, E>>` pair, so the WebSocket
//! layer only has to map its own message type onto [`Frame`].

use std::fmt;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::hub::{ConnectionId, HubHandle, OutboundReceiver};

/// Default time allowed to write a message to the peer.
pub const DEFAULT_WRITE_WAIT: Duration = Duration::from_secs(10);

/// Default time allowed to read the next pong from the peer.
pub const DEFAULT_PONG_WAIT: Duration = Duration::from_secs(60);

/// Default maximum inbound message size in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 512;

/// Default outbound queue capacity per connection.
pub const DEFAULT_SEND_BUFFER: usize = 1024;

/// A transport frame, independent of the WebSocket implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// Per-connection timing and sizing.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Deadline for each outbound write.
    pub write_wait: Duration,
    /// How long the peer may stay silent before the session is dropped.
    pub pong_wait: Duration,
    /// Interval between outbound pings. Must be shorter than `pong_wait`.
    pub ping_period: Duration,
    /// Largest inbound frame accepted, in bytes.
    pub max_message_size: usize,
    /// Capacity of the outbound queue.
    pub send_buffer: usize,
}

impl ConnectionConfig {
    /// Set the write deadline.
    pub fn with_write_wait(mut self, wait: Duration) -> Self {
        self.write_wait = wait;
        self
    }

    /// Set the pong window. Also resets the ping period to 9/10 of it.
    pub fn with_pong_wait(mut self, wait: Duration) -> Self {
        self.pong_wait = wait;
        self.ping_period = wait * 9 / 10;
        self
    }

    /// Set the ping period.
    pub fn with_ping_period(mut self, period: Duration) -> Self {
        self.ping_period = period;
        self
    }

    /// Set the maximum inbound message size.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the outbound queue capacity.
    pub fn with_send_buffer(mut self, capacity: usize) -> Self {
        self.send_buffer = capacity;
        self
    }

    /// Check that the settings can work together.
    pub fn validate(&self) -> Result<()> {
        if self.ping_period.is_zero() || self.ping_period >= self.pong_wait {
            return Err(Error::Config(format!(
                "ping period ({:?}) must be non-zero and shorter than pong wait ({:?})",
                self.ping_period, self.pong_wait
            )));
        }
        if self.write_wait.is_zero() {
            return Err(Error::Config("write wait must be non-zero".to_string()));
        }
        if self.send_buffer == 0 {
            return Err(Error::Config("send buffer must hold at least one message".to_string()));
        }
        if self.max_message_size == 0 {
            return Err(Error::Config("max message size must be non-zero".to_string()));
        }
        Ok(())
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            write_wait: DEFAULT_WRITE_WAIT,
            pong_wait: DEFAULT_PONG_WAIT,
            ping_period: DEFAULT_PONG_WAIT * 9 / 10,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            send_buffer: DEFAULT_SEND_BUFFER,
        }
    }
}

/// Why the reader stopped.
enum ReadExit {
    /// Peer sent Close or the stream ended.
    Closed,
    /// The writer task finished first.
    WriterDone,
    /// Read error, deadline or protocol violation.
    Failed(Error),
}

/// One client session.
pub struct Connection {
    id: ConnectionId,
    hub: HubHandle,
    config: ConnectionConfig,
}

impl Connection {
    /// Create a session bound to a hub.
    pub fn new(hub: HubHandle, config: ConnectionConfig) -> Self {
        Self {
            id: hub.next_id(),
            hub,
            config,
        }
    }

    /// The connection's id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Run the session until either side gives up.
    ///
    /// Registers with the hub, spawns the writer over `sink`, then reads
    /// `stream` on the current task. On exit the connection is unregistered
    /// and the writer is awaited, which closes the sink. Returns `Ok` for an
    /// orderly close and the cause otherwise.
    pub async fn serve<Si, St, E>(self, sink: Si, mut stream: St) -> Result<()>
    where
        Si: Sink<Frame> + Unpin + Send + 'static,
        Si::Error: fmt::Display,
        St: Stream<Item = std::result::Result<Frame, E>> + Unpin,
        E: fmt::Display,
    {
        let (queue_tx, queue_rx) = mpsc::channel(self.config.send_buffer.max(1));
        self.hub.register(self.id, queue_tx).await?;
        info!(connection = %self.id, "client connected");

        let mut writer = tokio::spawn(write_loop(self.id, queue_rx, sink, self.config.clone()));
        let exit = self.read_loop(&mut stream, &mut writer).await;

        if self.hub.unregister(self.id).await.is_err() {
            debug!(connection = %self.id, "hub already closed at unregister");
        }
        if !matches!(exit, ReadExit::WriterDone) {
            let _ = writer.await;
        }

        match exit {
            ReadExit::Closed | ReadExit::WriterDone => {
                info!(connection = %self.id, "client disconnected");
                Ok(())
            }
            ReadExit::Failed(err) => {
                info!(connection = %self.id, error = %err, "client dropped");
                Err(err)
            }
        }
    }

    async fn read_loop<St, E>(&self, stream: &mut St, writer: &mut JoinHandle<()>) -> ReadExit
    where
        St: Stream<Item = std::result::Result<Frame, E>> + Unpin,
        E: fmt::Display,
    {
        let mut deadline = Instant::now() + self.config.pong_wait;

        loop {
            let next = tokio::select! {
                _ = &mut *writer => return ReadExit::WriterDone,
                next = tokio::time::timeout_at(deadline, stream.next()) => next,
            };

            let frame = match next {
                Err(_) => return ReadExit::Failed(Error::Timeout("pong")),
                Ok(None) => return ReadExit::Closed,
                Ok(Some(Err(e))) => return ReadExit::Failed(Error::Transport(e.to_string())),
                Ok(Some(Ok(frame))) => frame,
            };

            match frame {
                Frame::Text(text) => {
                    if let Err(err) = self.check_size(text.len()) {
                        return ReadExit::Failed(err);
                    }
                    let table = text.trim();
                    if table.is_empty() {
                        continue;
                    }
                    debug!(connection = %self.id, table, "subscribe request");
                    if let Err(err) = self.hub.subscribe(self.id, table).await {
                        return ReadExit::Failed(err);
                    }
                }
                Frame::Binary(data) => {
                    if let Err(err) = self.check_size(data.len()) {
                        return ReadExit::Failed(err);
                    }
                    debug!(connection = %self.id, len = data.len(), "ignoring binary frame");
                }
                Frame::Pong(_) => {
                    deadline = Instant::now() + self.config.pong_wait;
                }
                Frame::Ping(_) => {}
                Frame::Close => return ReadExit::Closed,
            }
        }
    }

    fn check_size(&self, len: usize) -> Result<()> {
        if len > self.config.max_message_size {
            return Err(Error::Transport(format!(
                "frame of {} bytes exceeds limit of {}",
                len, self.config.max_message_size
            )));
        }
        Ok(())
    }
}

/// Drain the outbound queue into the sink and send keepalive pings.
///
/// Stops when the queue is closed (after sending Close) or a write fails.
/// Always closes the sink on the way out.
async fn write_loop<Si>(id: ConnectionId, mut queue: OutboundReceiver, mut sink: Si, config: ConnectionConfig)
where
    Si: Sink<Frame> + Unpin,
    Si::Error: fmt::Display,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + config.ping_period, config.ping_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            next = queue.recv() => {
                let Some(envelope) = next else {
                    let _ = send_frame(&mut sink, Frame::Close, config.write_wait).await;
                    break;
                };
                let text = match envelope.to_json() {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(connection = %id, error = %err, "failed to encode envelope");
                        continue;
                    }
                };
                if let Err(err) = send_frame(&mut sink, Frame::Text(text), config.write_wait).await {
                    debug!(connection = %id, error = %err, "write failed");
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Err(err) = send_frame(&mut sink, Frame::Ping(Vec::new()), config.write_wait).await {
                    debug!(connection = %id, error = %err, "ping failed");
                    break;
                }
            }
        }
    }

    let _ = tokio::time::timeout(config.write_wait, sink.close()).await;
    debug!(connection = %id, "writer stopped");
}

async fn send_frame<Si>(sink: &mut Si, frame: Frame, wait: Duration) -> Result<()>
where
    Si: Sink<Frame> + Unpin,
    Si::Error: fmt::Display,
{
    match tokio::time::timeout(wait, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(Error::Transport(err.to_string())),
        Err(_) => Err(Error::Timeout("write")),
    }
}
