//! Process entry point wiring a hub to an upstream source.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::error::Result;
use crate::hub::{Hub, HubHandle, DEFAULT_HUB_CAPACITY};
use crate::upstream::{
    log_listener_event, EventCallback, ListenerEvent, NotificationSource, PgSource,
    UpstreamAdapter, UpstreamConfig, UpstreamControl, UpstreamState,
};

/// Settings for [`Broadcaster::start`].
#[derive(Clone)]
pub struct BroadcasterConfig {
    /// Capacity of the hub's command channel.
    pub hub_capacity: usize,
    /// Upstream reconnect and keepalive timing.
    pub upstream: UpstreamConfig,
    /// Observer for upstream connectivity transitions.
    pub on_event: EventCallback,
}

impl BroadcasterConfig {
    /// Set the hub command channel capacity.
    pub fn with_hub_capacity(mut self, capacity: usize) -> Self {
        self.hub_capacity = capacity;
        self
    }

    /// Set the upstream timing.
    pub fn with_upstream(mut self, upstream: UpstreamConfig) -> Self {
        self.upstream = upstream;
        self
    }

    /// Set the connectivity observer.
    pub fn with_event_callback<F>(mut self, on_event: F) -> Self
    where
        F: Fn(&ListenerEvent) + Send + Sync + 'static,
    {
        self.on_event = Arc::new(on_event);
        self
    }
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            hub_capacity: DEFAULT_HUB_CAPACITY,
            upstream: UpstreamConfig::default(),
            on_event: Arc::new(log_listener_event),
        }
    }
}

impl fmt::Debug for BroadcasterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcasterConfig")
            .field("hub_capacity", &self.hub_capacity)
            .field("upstream", &self.upstream)
            .finish_non_exhaustive()
    }
}

/// A running hub plus the upstream adapter feeding it.
///
/// Dropping the broadcaster stops the adapter; the hub stops once the last
/// [`HubHandle`] is gone.
pub struct Broadcaster {
    hub: HubHandle,
    control: UpstreamControl,
    adapter: JoinHandle<()>,
}

impl Broadcaster {
    /// Connect to PostgreSQL, `LISTEN` on `channel` and start fanning out.
    ///
    /// Fails only if the initial connection or `LISTEN` fails; everything
    /// after that is retried and logged.
    pub async fn start(conninfo: &str, channel: &str, config: BroadcasterConfig) -> Result<Self> {
        Self::start_with_source(PgSource::new(conninfo), channel, config).await
    }

    /// Like [`start`](Self::start), over any notification source.
    pub async fn start_with_source<S>(
        mut source: S,
        channel: &str,
        config: BroadcasterConfig,
    ) -> Result<Self>
    where
        S: NotificationSource + 'static,
    {
        config.upstream.validate()?;

        source.connect().await?;
        source.listen(channel).await?;

        let hub = Hub::spawn(config.hub_capacity);
        let (adapter, control) = UpstreamAdapter::new(source, hub.clone(), config.upstream);
        let adapter = tokio::spawn(adapter.with_event_callback(config.on_event).run());

        info!(channel, "listening for notifications");

        Ok(Self {
            hub,
            control,
            adapter,
        })
    }

    /// Listen on an additional notification channel.
    pub async fn listen(&self, channel: &str) -> Result<()> {
        self.control.listen(channel).await
    }

    /// Handle for registering client connections.
    pub fn hub(&self) -> HubHandle {
        self.hub.clone()
    }

    /// Watch the upstream connectivity state.
    pub fn upstream_state(&self) -> watch::Receiver<UpstreamState> {
        self.control.state()
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        self.adapter.abort();
    }
}
