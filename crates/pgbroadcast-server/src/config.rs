//! Server configuration.

use std::time::Duration;

use clap::Parser;
use pgbroadcast_core::connection::{
    DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_PONG_WAIT, DEFAULT_SEND_BUFFER, DEFAULT_WRITE_WAIT,
};
use pgbroadcast_core::hub::DEFAULT_HUB_CAPACITY;
use pgbroadcast_core::upstream::{
    DEFAULT_MAX_RECONNECT_INTERVAL, DEFAULT_MIN_RECONNECT_INTERVAL, DEFAULT_SILENCE_TIMEOUT,
};
use pgbroadcast_core::{ConnectionConfig, Error, UpstreamConfig};

/// Default HTTP listen address.
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:8080";

/// Default notification channel.
pub const DEFAULT_CHANNEL: &str = "table_changes";

/// pgbroadcast server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to accept WebSocket clients on.
    pub listen_addr: String,

    /// PostgreSQL connection string for the notification listener.
    pub database_url: String,

    /// Notification channels to `LISTEN` on. The first one must succeed at startup.
    pub channels: Vec<String>,

    /// Per-client session settings.
    pub connection: ConnectionConfig,

    /// Upstream reconnect and keepalive settings.
    pub upstream: UpstreamConfig,

    /// Capacity of the hub's command channel.
    pub hub_capacity: usize,
}

impl ServerConfig {
    /// Create a configuration for the given database with defaults elsewhere.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDRESS.to_string(),
            database_url: database_url.into(),
            channels: vec![DEFAULT_CHANNEL.to_string()],
            connection: ConnectionConfig::default(),
            upstream: UpstreamConfig::default(),
            hub_capacity: DEFAULT_HUB_CAPACITY,
        }
    }

    /// Set the listen address.
    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }

    /// Replace the notification channels.
    pub fn with_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels = channels.into_iter().map(Into::into).collect();
        self
    }

    /// Set the per-client session settings.
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// Set the upstream settings.
    pub fn with_upstream(mut self, upstream: UpstreamConfig) -> Self {
        self.upstream = upstream;
        self
    }

    /// Set the hub command channel capacity.
    pub fn with_hub_capacity(mut self, capacity: usize) -> Self {
        self.hub_capacity = capacity;
        self
    }

    /// Check the configuration before starting.
    pub fn validate(&self) -> Result<(), Error> {
        if self.channels.is_empty() || self.channels.iter().any(|c| c.trim().is_empty()) {
            return Err(Error::Config(
                "at least one non-empty notification channel is required".to_string(),
            ));
        }
        if self.hub_capacity == 0 {
            return Err(Error::Config("hub capacity must be non-zero".to_string()));
        }
        self.connection.validate()?;
        self.upstream.validate()
    }
}

/// Command-line arguments for the server.
#[derive(Parser, Debug)]
#[command(name = "pgbroadcast-server")]
#[command(version, about = "Stream PostgreSQL table changes to WebSocket clients", long_about = None)]
pub struct Args {
    /// PostgreSQL connection string.
    #[arg(short, long)]
    pub database_url: String,

    /// Notification channel to LISTEN on (repeatable).
    #[arg(short, long = "channel", default_value = DEFAULT_CHANNEL)]
    pub channels: Vec<String>,

    /// Address to listen on for WebSocket clients.
    #[arg(short, long, default_value = DEFAULT_LISTEN_ADDRESS)]
    pub listen: String,

    /// Outbound messages buffered per client before it is dropped.
    #[arg(long, default_value_t = DEFAULT_SEND_BUFFER)]
    pub send_buffer: usize,

    /// Maximum inbound message size in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_SIZE)]
    pub max_message_size: usize,

    /// Write deadline in seconds.
    #[arg(long, default_value_t = DEFAULT_WRITE_WAIT.as_secs())]
    pub write_wait: u64,

    /// Seconds a client may go without answering pings.
    #[arg(long, default_value_t = DEFAULT_PONG_WAIT.as_secs())]
    pub pong_wait: u64,

    /// Minimum upstream reconnect delay in seconds.
    #[arg(long, default_value_t = DEFAULT_MIN_RECONNECT_INTERVAL.as_secs())]
    pub min_reconnect: u64,

    /// Maximum upstream reconnect delay in seconds.
    #[arg(long, default_value_t = DEFAULT_MAX_RECONNECT_INTERVAL.as_secs())]
    pub max_reconnect: u64,

    /// Seconds without notifications before the upstream is probed.
    #[arg(long, default_value_t = DEFAULT_SILENCE_TIMEOUT.as_secs())]
    pub silence_timeout: u64,

    /// Hub command channel capacity.
    #[arg(long, default_value_t = DEFAULT_HUB_CAPACITY)]
    pub hub_capacity: usize,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Convert command-line arguments to server configuration.
    pub fn into_config(self) -> ServerConfig {
        let connection = ConnectionConfig::default()
            .with_pong_wait(Duration::from_secs(self.pong_wait))
            .with_write_wait(Duration::from_secs(self.write_wait))
            .with_max_message_size(self.max_message_size)
            .with_send_buffer(self.send_buffer);

        let upstream = UpstreamConfig::default()
            .with_reconnect_interval(
                Duration::from_secs(self.min_reconnect),
                Duration::from_secs(self.max_reconnect),
            )
            .with_silence_timeout(Duration::from_secs(self.silence_timeout));

        ServerConfig {
            listen_addr: self.listen,
            database_url: self.database_url,
            channels: self.channels,
            connection,
            upstream,
            hub_capacity: self.hub_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::new("postgres://localhost/app");
        assert_eq!(config.listen_addr, DEFAULT_LISTEN_ADDRESS);
        assert_eq!(config.channels, vec![DEFAULT_CHANNEL.to_string()]);
        assert_eq!(config.connection.send_buffer, 1024);
        assert_eq!(config.upstream.min_reconnect_interval, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ServerConfig::new("postgres://db/app")
            .with_listen_addr("127.0.0.1:9090")
            .with_channels(["orders_changes", "users_changes"])
            .with_hub_capacity(32);

        assert_eq!(config.listen_addr, "127.0.0.1:9090");
        assert_eq!(config.channels, vec!["orders_changes", "users_changes"]);
        assert_eq!(config.hub_capacity, 32);
    }

    #[test]
    fn test_validation_rejects_empty_channels() {
        let config = ServerConfig::new("postgres://db/app").with_channels(Vec::<String>::new());
        assert!(config.validate().is_err());

        let config = ServerConfig::new("postgres://db/app").with_channels([" "]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_args_into_config() {
        let args = Args::parse_from([
            "pgbroadcast-server",
            "--database-url",
            "postgres://db/app",
            "--channel",
            "a",
            "--channel",
            "b",
            "--pong-wait",
            "30",
            "--max-reconnect",
            "120",
        ]);
        let config = args.into_config();

        assert_eq!(config.channels, vec!["a", "b"]);
        assert_eq!(config.connection.pong_wait, Duration::from_secs(30));
        assert_eq!(config.connection.ping_period, Duration::from_secs(27));
        assert_eq!(config.upstream.max_reconnect_interval, Duration::from_secs(120));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_args_reject_inverted_backoff() {
        let args = Args::parse_from([
            "pgbroadcast-server",
            "-d",
            "postgres://db/app",
            "--min-reconnect",
            "90",
            "--max-reconnect",
            "30",
        ]);
        assert!(args.into_config().validate().is_err());
    }
}
