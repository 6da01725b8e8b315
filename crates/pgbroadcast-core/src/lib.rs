//! pgbroadcast core - fan-out of PostgreSQL notifications to streaming clients.
//!
//! This crate provides the in-process engine that sits between a database
//! notification channel and many live client connections:
//! - [`Hub`]: single coordinator owning the connection registry
//! - [`Connection`]: one client session (reader, writer, keepalive)
//! - [`UpstreamAdapter`]: the long-lived `LISTEN` loop with reconnect
//! - [`Broadcaster`]: wires the pieces together behind one `start` call
//!
//! # Quick Start
//!
//! ```ignore
//! use pgbroadcast_core::{Broadcaster, BroadcasterConfig};
//!
//! #[tokio::main]
//! async fn main() -> pgbroadcast_core::Result<()> {
//!     let broadcaster = Broadcaster::start(
//!         "postgres://localhost/app",
//!         "table_changes",
//!         BroadcasterConfig::default(),
//!     )
//!     .await?;
//!
//!     // Hand `broadcaster.hub()` to the transport layer.
//!     let _hub = broadcaster.hub();
//!     Ok(())
//! }
//! ```

pub mod broadcaster;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod hub;
pub mod upstream;

pub use broadcaster::{Broadcaster, BroadcasterConfig};
pub use connection::{Connection, ConnectionConfig, Frame};
pub use envelope::Envelope;
pub use error::{Error, Result};
pub use hub::{BroadcastReport, ConnectionId, Hub, HubHandle, HubStats, Registry};
pub use upstream::{
    log_listener_event, Backoff, EventCallback, ListenerEvent, NotificationSource, PgSource,
    UpstreamAdapter, UpstreamConfig, UpstreamControl, UpstreamState,
};
