//! Upstream notification feed.
//!
//! The [`UpstreamAdapter`] owns a [`NotificationSource`] and runs for the
//! lifetime of the process: it turns notification payloads into envelopes for
//! the hub, probes the source when it goes quiet, and reconnects with a
//! bounded exponential [`Backoff`] when the source fails. Connectivity
//! transitions are reported through an [`EventCallback`] and published as an
//! [`UpstreamState`].

mod backoff;
mod postgres;

pub use backoff::{Backoff, DEFAULT_MAX_RECONNECT_INTERVAL, DEFAULT_MIN_RECONNECT_INTERVAL};
pub use postgres::PgSource;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::hub::HubHandle;

/// Default window without notifications before the source is probed.
pub const DEFAULT_SILENCE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default deadline for a keepalive probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// A stream of raw notification payloads.
#[async_trait]
pub trait NotificationSource: Send {
    /// Open a fresh connection and re-listen on every known channel.
    async fn connect(&mut self) -> Result<()>;

    /// Start listening on a channel.
    async fn listen(&mut self, channel: &str) -> Result<()>;

    /// Wait for the next notification payload.
    ///
    /// `Ok(None)` means the connection was lost and the source has already
    /// re-established it; there is no payload to deliver. The adapter may
    /// drop this future when another event wins the race, so any work it
    /// loses that way must be redone on the next call.
    async fn recv(&mut self) -> Result<Option<String>>;

    /// Round-trip a keepalive probe on the notification connection.
    async fn ping(&mut self) -> Result<()>;
}

/// Connectivity transitions of the upstream source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    /// Initial connection is up.
    Connected,
    /// The connection was lost.
    Disconnected(String),
    /// A reconnect attempt succeeded.
    Reconnected,
    /// A reconnect attempt failed; another will follow.
    ConnectionAttemptFailed(String),
}

impl fmt::Display for ListenerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerEvent::Connected => write!(f, "connected"),
            ListenerEvent::Disconnected(err) => write!(f, "disconnected: {}", err),
            ListenerEvent::Reconnected => write!(f, "reconnected"),
            ListenerEvent::ConnectionAttemptFailed(err) => {
                write!(f, "connection attempt failed: {}", err)
            }
        }
    }
}

/// Observer for connectivity transitions. Must not block.
pub type EventCallback = Arc<dyn Fn(&ListenerEvent) + Send + Sync>;

/// Default observer: log the transition.
pub fn log_listener_event(event: &ListenerEvent) {
    match event {
        ListenerEvent::Connected => info!("upstream connected"),
        ListenerEvent::Reconnected => info!("upstream reconnected"),
        ListenerEvent::Disconnected(err) => warn!(error = %err, "upstream disconnected"),
        ListenerEvent::ConnectionAttemptFailed(err) => {
            warn!(error = %err, "upstream reconnect attempt failed")
        }
    }
}

/// Whether the upstream source is currently usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamState {
    Connected,
    Disconnected,
}

/// Upstream timing.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Delay before the first reconnect attempt.
    pub min_reconnect_interval: Duration,
    /// Upper bound on the reconnect delay.
    pub max_reconnect_interval: Duration,
    /// Quiet period after which the source is probed.
    pub silence_timeout: Duration,
    /// Deadline for a keepalive probe. The probe runs on the listener
    /// connection itself, so notifications wait for at most this long.
    pub probe_timeout: Duration,
}

impl UpstreamConfig {
    /// Set the reconnect backoff bounds.
    pub fn with_reconnect_interval(mut self, min: Duration, max: Duration) -> Self {
        self.min_reconnect_interval = min;
        self.max_reconnect_interval = max;
        self
    }

    /// Set the silence timeout.
    pub fn with_silence_timeout(mut self, timeout: Duration) -> Self {
        self.silence_timeout = timeout;
        self
    }

    /// Set the keepalive probe deadline.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Check that the settings can work together.
    pub fn validate(&self) -> Result<()> {
        if self.min_reconnect_interval > self.max_reconnect_interval {
            return Err(Error::Config(format!(
                "min reconnect interval ({:?}) exceeds max ({:?})",
                self.min_reconnect_interval, self.max_reconnect_interval
            )));
        }
        if self.silence_timeout.is_zero() || self.probe_timeout.is_zero() {
            return Err(Error::Config(
                "silence and probe timeouts must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            min_reconnect_interval: DEFAULT_MIN_RECONNECT_INTERVAL,
            max_reconnect_interval: DEFAULT_MAX_RECONNECT_INTERVAL,
            silence_timeout: DEFAULT_SILENCE_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

/// Commands accepted by a running adapter.
#[derive(Debug)]
enum UpstreamCommand {
    Listen {
        channel: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Handle to a running [`UpstreamAdapter`].
#[derive(Debug, Clone)]
pub struct UpstreamControl {
    tx: mpsc::Sender<UpstreamCommand>,
    state: watch::Receiver<UpstreamState>,
}

impl UpstreamControl {
    /// Ask the adapter to listen on another channel.
    pub async fn listen(&self, channel: impl Into<String>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(UpstreamCommand::Listen {
                channel: channel.into(),
                reply,
            })
            .await
            .map_err(|_| Error::UpstreamClosed)?;
        rx.await.map_err(|_| Error::UpstreamClosed)?
    }

    /// Watch the connectivity state.
    pub fn state(&self) -> watch::Receiver<UpstreamState> {
        self.state.clone()
    }
}

/// Long-running loop feeding notifications into the hub.
pub struct UpstreamAdapter<S> {
    source: S,
    hub: HubHandle,
    config: UpstreamConfig,
    backoff: Backoff,
    on_event: EventCallback,
    state: watch::Sender<UpstreamState>,
    commands: mpsc::Receiver<UpstreamCommand>,
}

impl<S: NotificationSource> UpstreamAdapter<S> {
    /// Create an adapter over a source that is already connected.
    pub fn new(source: S, hub: HubHandle, config: UpstreamConfig) -> (Self, UpstreamControl) {
        let (tx, commands) = mpsc::channel(16);
        let (state, state_rx) = watch::channel(UpstreamState::Connected);
        let backoff = Backoff::new(config.min_reconnect_interval, config.max_reconnect_interval);

        let adapter = Self {
            source,
            hub,
            config,
            backoff,
            on_event: Arc::new(log_listener_event),
            state,
            commands,
        };
        let control = UpstreamControl {
            tx,
            state: state_rx,
        };
        (adapter, control)
    }

    /// Replace the connectivity observer.
    pub fn with_event_callback(mut self, on_event: EventCallback) -> Self {
        self.on_event = on_event;
        self
    }

    /// Run until the hub goes away.
    pub async fn run(mut self) {
        self.emit(ListenerEvent::Connected);
        let mut connected = true;
        let mut last_activity = Instant::now();

        loop {
            if !connected {
                let delay = self.backoff.next_delay();
                debug!(
                    delay_ms = delay.as_millis() as u64,
                    attempt = self.backoff.attempts(),
                    "waiting before reconnect"
                );
                tokio::time::sleep(delay).await;

                if let Err(err) = self.source.connect().await {
                    self.emit(ListenerEvent::ConnectionAttemptFailed(err.to_string()));
                    continue;
                }
                connected = true;
                self.backoff.reset();
                last_activity = Instant::now();
                self.emit(ListenerEvent::Reconnected);
            }

            let silence_deadline = last_activity + self.config.silence_timeout;

            tokio::select! {
                received = self.source.recv() => match received {
                    Ok(Some(payload)) => {
                        last_activity = Instant::now();
                        if !dispatch(&self.hub, &payload).await {
                            break;
                        }
                    }
                    Ok(None) => {
                        self.emit(ListenerEvent::Disconnected(
                            "notification connection lost".to_string(),
                        ));
                        self.backoff.reset();
                        last_activity = Instant::now();
                        self.emit(ListenerEvent::Reconnected);
                    }
                    Err(err) => {
                        connected = false;
                        self.emit(ListenerEvent::Disconnected(err.to_string()));
                    }
                },
                Some(command) = self.commands.recv() => {
                    self.handle_command(command).await;
                }
                _ = tokio::time::sleep_until(silence_deadline) => {
                    last_activity = Instant::now();
                    if let Err(err) = self.probe().await {
                        connected = false;
                        self.emit(ListenerEvent::Disconnected(err.to_string()));
                    }
                }
            }
        }

        info!("upstream adapter stopped");
    }

    async fn probe(&mut self) -> Result<()> {
        debug!("no notifications within silence window, probing connection");
        match tokio::time::timeout(self.config.probe_timeout, self.source.ping()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout("keepalive probe")),
        }
    }

    async fn handle_command(&mut self, command: UpstreamCommand) {
        match command {
            UpstreamCommand::Listen { channel, reply } => {
                let result = self.source.listen(&channel).await;
                match &result {
                    Ok(()) => info!(channel = %channel, "listening on additional channel"),
                    Err(err) => warn!(channel = %channel, error = %err, "listen failed"),
                }
                let _ = reply.send(result);
            }
        }
    }

    fn emit(&self, event: ListenerEvent) {
        let state = match event {
            ListenerEvent::Connected | ListenerEvent::Reconnected => UpstreamState::Connected,
            ListenerEvent::Disconnected(_) | ListenerEvent::ConnectionAttemptFailed(_) => {
                UpstreamState::Disconnected
            }
        };
        self.state.send_replace(state);
        (self.on_event)(&event);
    }
}

/// Parse a payload and hand it to the hub.
///
/// Returns `false` once the hub has shut down.
async fn dispatch(hub: &HubHandle, payload: &str) -> bool {
    if payload.trim().is_empty() {
        debug!("ignoring empty notification");
        return true;
    }

    let envelope = match Envelope::from_payload(payload) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(error = %err, payload_len = payload.len(), "dropping malformed notification");
            return true;
        }
    };

    debug!(table = %envelope.table, action = %envelope.action, "broadcasting notification");
    if hub.broadcast(envelope).await.is_err() {
        error!("hub closed, stopping upstream adapter");
        return false;
    }
    true
}
