//! Connection registry and fan-out coordinator.
//!
//! All registry mutation happens inside one [`Hub`] task. Connections and the
//! upstream adapter talk to it through a cloneable [`HubHandle`], so register,
//! unregister, subscribe and broadcast are processed strictly one at a time
//! in arrival order.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::envelope::Envelope;
use crate::error::{Error, Result};

/// Default capacity of the hub's command channel.
pub const DEFAULT_HUB_CAPACITY: usize = 256;

/// Sending half of a connection's outbound queue.
pub type OutboundSender = mpsc::Sender<Arc<Envelope>>;

/// Receiving half of a connection's outbound queue.
pub type OutboundReceiver = mpsc::Receiver<Arc<Envelope>>;

/// Identifier of a connection, unique within one hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Registry entry for one connection.
#[derive(Debug)]
struct Subscriber {
    /// Outbound queue. Dropping it closes the queue.
    queue: OutboundSender,
    /// Tables this connection wants updates for.
    tables: HashSet<String>,
    /// Number of envelopes enqueued for this connection.
    delivered: u64,
    /// When the connection was registered.
    registered_at: Instant,
}

/// Outcome of a single broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections that accepted the envelope.
    pub delivered: usize,
    /// Connections evicted because their queue was full or closed.
    pub evicted: Vec<ConnectionId>,
}

/// Point-in-time hub counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct HubStats {
    /// Registered connections.
    pub connections: usize,
    /// Total (connection, table) subscription pairs.
    pub subscriptions: usize,
    /// Envelopes received for broadcast.
    pub events_received: u64,
    /// Envelopes enqueued across all connections.
    pub events_delivered: u64,
    /// Connections evicted for backpressure.
    pub evictions: u64,
}

/// The connection registry and the fan-out rules.
///
/// This is plain synchronous state; [`Hub`] owns one and serializes access to
/// it. It is public so the routing rules can be exercised without the actor.
#[derive(Debug, Default)]
pub struct Registry {
    /// Registered connections.
    subscribers: HashMap<ConnectionId, Subscriber>,
    /// Index of subscribed connections by table.
    table_index: HashMap<String, HashSet<ConnectionId>>,
    events_received: u64,
    events_delivered: u64,
    evictions: u64,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. Registering an id twice replaces the earlier entry.
    pub fn register(&mut self, id: ConnectionId, queue: OutboundSender) {
        if self.remove(id) {
            warn!(connection = %id, "connection registered twice, replacing");
        }
        self.subscribers.insert(
            id,
            Subscriber {
                queue,
                tables: HashSet::new(),
                delivered: 0,
                registered_at: Instant::now(),
            },
        );
        debug!(connection = %id, "connection registered");
    }

    /// Remove a connection and close its queue.
    ///
    /// Returns `false` if the connection was not registered.
    pub fn unregister(&mut self, id: ConnectionId) -> bool {
        let removed = self.remove(id);
        if removed {
            debug!(connection = %id, "connection unregistered");
        }
        removed
    }

    /// Subscribe a connection to a table.
    ///
    /// Returns `true` if this added a new subscription.
    pub fn subscribe(&mut self, id: ConnectionId, table: &str) -> bool {
        if table.is_empty() {
            return false;
        }
        let Some(subscriber) = self.subscribers.get_mut(&id) else {
            return false;
        };
        if !subscriber.tables.insert(table.to_string()) {
            return false;
        }

        self.table_index
            .entry(table.to_string())
            .or_default()
            .insert(id);

        debug!(connection = %id, table, "subscription added");
        true
    }

    /// Offer an envelope to every connection subscribed to its table.
    ///
    /// Each subscriber gets exactly one non-blocking enqueue attempt. A
    /// subscriber whose queue is full or closed is evicted on the spot.
    pub fn broadcast(&mut self, envelope: Arc<Envelope>) -> BroadcastReport {
        self.events_received += 1;

        let mut report = BroadcastReport::default();
        let targets: Vec<ConnectionId> = match self.table_index.get(&envelope.table) {
            Some(ids) => ids.iter().copied().collect(),
            None => return report,
        };

        for id in targets {
            let Some(subscriber) = self.subscribers.get_mut(&id) else {
                continue;
            };

            match subscriber.queue.try_send(Arc::clone(&envelope)) {
                Ok(()) => {
                    subscriber.delivered += 1;
                    report.delivered += 1;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        connection = %id,
                        table = %envelope.table,
                        "outbound queue full, evicting slow connection"
                    );
                    report.evicted.push(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(connection = %id, "outbound queue closed, evicting connection");
                    report.evicted.push(id);
                }
            }
        }

        for &id in &report.evicted {
            self.remove(id);
            self.evictions += 1;
        }
        self.events_delivered += report.delivered as u64;

        report
    }

    /// Check whether a connection is registered.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.subscribers.contains_key(&id)
    }

    /// Check whether a connection is subscribed to a table.
    pub fn is_subscribed(&self, id: ConnectionId, table: &str) -> bool {
        self.subscribers
            .get(&id)
            .map(|s| s.tables.contains(table))
            .unwrap_or(false)
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    /// Whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Current counters.
    pub fn stats(&self) -> HubStats {
        HubStats {
            connections: self.subscribers.len(),
            subscriptions: self.subscribers.values().map(|s| s.tables.len()).sum(),
            events_received: self.events_received,
            events_delivered: self.events_delivered,
            evictions: self.evictions,
        }
    }

    fn remove(&mut self, id: ConnectionId) -> bool {
        let Some(subscriber) = self.subscribers.remove(&id) else {
            return false;
        };

        for table in &subscriber.tables {
            if let Some(ids) = self.table_index.get_mut(table) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.table_index.remove(table);
                }
            }
        }

        debug!(
            connection = %id,
            events_delivered = subscriber.delivered,
            age_ms = subscriber.registered_at.elapsed().as_millis() as u64,
            "connection removed"
        );

        // Dropping `subscriber.queue` here closes the outbound queue.
        true
    }
}

/// Commands processed by the hub coordinator.
#[derive(Debug)]
enum HubCommand {
    Register {
        id: ConnectionId,
        queue: OutboundSender,
        ack: oneshot::Sender<()>,
    },
    Unregister {
        id: ConnectionId,
    },
    Subscribe {
        id: ConnectionId,
        table: String,
    },
    Broadcast {
        envelope: Arc<Envelope>,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
}

/// The fan-out coordinator.
///
/// Owns the [`Registry`] and applies commands from its channel until every
/// [`HubHandle`] has been dropped. Dropping the registry on exit closes every
/// remaining outbound queue.
pub struct Hub {
    rx: mpsc::Receiver<HubCommand>,
    registry: Registry,
}

impl Hub {
    /// Create a hub and the handle used to reach it.
    pub fn new(capacity: usize) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let hub = Self {
            rx,
            registry: Registry::new(),
        };
        let handle = HubHandle {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        (hub, handle)
    }

    /// Create a hub and spawn its coordinator task.
    pub fn spawn(capacity: usize) -> HubHandle {
        let (hub, handle) = Self::new(capacity);
        tokio::spawn(hub.run());
        handle
    }

    /// Run the coordinator loop.
    pub async fn run(mut self) {
        info!("hub started");

        while let Some(command) = self.rx.recv().await {
            self.apply(command);
        }

        info!(
            remaining_connections = self.registry.len(),
            "hub stopped (all handles dropped)"
        );
    }

    fn apply(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register { id, queue, ack } => {
                self.registry.register(id, queue);
                let _ = ack.send(());
            }
            HubCommand::Unregister { id } => {
                self.registry.unregister(id);
            }
            HubCommand::Subscribe { id, table } => {
                self.registry.subscribe(id, &table);
            }
            HubCommand::Broadcast { envelope } => {
                let report = self.registry.broadcast(envelope);
                if !report.evicted.is_empty() {
                    info!(
                        evicted = report.evicted.len(),
                        remaining = self.registry.len(),
                        "evicted connections during broadcast"
                    );
                }
            }
            HubCommand::Stats { reply } => {
                let _ = reply.send(self.registry.stats());
            }
        }
    }
}

/// Cloneable client side of a [`Hub`].
#[derive(Debug, Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
    next_id: Arc<AtomicU64>,
}

impl HubHandle {
    /// Allocate a fresh connection id.
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a connection's outbound queue.
    ///
    /// Resolves once the coordinator has added the connection.
    pub async fn register(&self, id: ConnectionId, queue: OutboundSender) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.send(HubCommand::Register { id, queue, ack }).await?;
        done.await.map_err(|_| Error::HubClosed)
    }

    /// Unregister a connection. A no-op if it is already gone.
    pub async fn unregister(&self, id: ConnectionId) -> Result<()> {
        self.send(HubCommand::Unregister { id }).await
    }

    /// Subscribe a connection to a table.
    pub async fn subscribe(&self, id: ConnectionId, table: impl Into<String>) -> Result<()> {
        self.send(HubCommand::Subscribe {
            id,
            table: table.into(),
        })
        .await
    }

    /// Hand an envelope to the coordinator for fan-out.
    ///
    /// Waits only if the coordinator's command channel is full.
    pub async fn broadcast(&self, envelope: Envelope) -> Result<()> {
        self.send(HubCommand::Broadcast {
            envelope: Arc::new(envelope),
        })
        .await
    }

    /// Fetch the current hub counters.
    pub async fn stats(&self) -> Result<HubStats> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Stats { reply }).await?;
        rx.await.map_err(|_| Error::HubClosed)
    }

    /// Whether the coordinator has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn send(&self, command: HubCommand) -> Result<()> {
        self.tx.send(command).await.map_err(|_| Error::HubClosed)
    }
}
