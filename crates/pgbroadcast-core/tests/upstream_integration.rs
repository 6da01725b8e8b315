//! Upstream adapter and broadcaster tests against a scripted source.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use pgbroadcast_core::hub::{OutboundReceiver, DEFAULT_HUB_CAPACITY};
use pgbroadcast_core::{
    Broadcaster, BroadcasterConfig, Envelope, Error, Hub, HubHandle, ListenerEvent,
    NotificationSource, Result, UpstreamAdapter, UpstreamConfig, UpstreamState,
};

/// One scripted outcome of `recv`.
enum Step {
    Payload(String),
    /// The driver lost the connection and re-established it by itself.
    SilentReconnect,
    Fail(&'static str),
}

/// Calls observed by the scripted source.
#[derive(Debug, Default)]
struct Calls {
    connects: usize,
    pings: usize,
    channels: Vec<String>,
}

/// Source whose `recv` results are pushed by the test.
struct ScriptedSource {
    steps: mpsc::UnboundedReceiver<Step>,
    calls: Arc<Mutex<Calls>>,
    failing_connects: usize,
    fail_ping: bool,
    reject_channel: Option<&'static str>,
}

impl ScriptedSource {
    fn new() -> (Self, mpsc::UnboundedSender<Step>, Arc<Mutex<Calls>>) {
        let (tx, steps) = mpsc::unbounded_channel();
        let calls = Arc::new(Mutex::new(Calls::default()));
        let source = Self {
            steps,
            calls: calls.clone(),
            failing_connects: 0,
            fail_ping: false,
            reject_channel: None,
        };
        (source, tx, calls)
    }
}

#[async_trait]
impl NotificationSource for ScriptedSource {
    async fn connect(&mut self) -> Result<()> {
        self.calls.lock().unwrap().connects += 1;
        if self.failing_connects > 0 {
            self.failing_connects -= 1;
            return Err(Error::Transport("connection refused".to_string()));
        }
        Ok(())
    }

    async fn listen(&mut self, channel: &str) -> Result<()> {
        if self.reject_channel == Some(channel) {
            return Err(Error::Transport(format!("cannot listen on {}", channel)));
        }
        self.calls.lock().unwrap().channels.push(channel.to_string());
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        match self.steps.recv().await {
            Some(Step::Payload(payload)) => Ok(Some(payload)),
            Some(Step::SilentReconnect) => Ok(None),
            Some(Step::Fail(reason)) => Err(Error::Transport(reason.to_string())),
            None => std::future::pending().await,
        }
    }

    async fn ping(&mut self) -> Result<()> {
        self.calls.lock().unwrap().pings += 1;
        if self.fail_ping {
            return Err(Error::Transport("ping failed".to_string()));
        }
        Ok(())
    }
}

fn fast_upstream() -> UpstreamConfig {
    UpstreamConfig::default()
        .with_reconnect_interval(Duration::from_millis(5), Duration::from_millis(20))
        .with_silence_timeout(Duration::from_secs(30))
        .with_probe_timeout(Duration::from_millis(50))
}

fn recorder() -> (Arc<Mutex<Vec<ListenerEvent>>>, pgbroadcast_core::EventCallback) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let callback: pgbroadcast_core::EventCallback =
        Arc::new(move |event: &ListenerEvent| sink.lock().unwrap().push(event.clone()));
    (events, callback)
}

async fn subscriber(hub: &HubHandle, table: &str) -> OutboundReceiver {
    let (tx, rx) = mpsc::channel(16);
    let id = hub.next_id();
    hub.register(id, tx).await.unwrap();
    hub.subscribe(id, table).await.unwrap();
    rx
}

async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_payload_round_trip_to_subscriber() {
    let hub = Hub::spawn(DEFAULT_HUB_CAPACITY);
    let mut users = subscriber(&hub, "users").await;
    let mut orders = subscriber(&hub, "orders").await;

    let (source, steps, _calls) = ScriptedSource::new();
    let (adapter, _control) = UpstreamAdapter::new(source, hub.clone(), fast_upstream());
    tokio::spawn(adapter.run());

    let payload = json!({"table": "users", "action": "insert", "data": {"id": 1}});
    steps.send(Step::Payload(payload.to_string())).unwrap();

    let envelope = users.recv().await.unwrap();
    assert_eq!(serde_json::to_value(&*envelope).unwrap(), payload);

    let stats = hub.stats().await.unwrap();
    assert_eq!(stats.events_delivered, 1);
    assert!(orders.try_recv().is_err());
}

#[tokio::test]
async fn test_sentinel_and_malformed_payloads_are_skipped() {
    let hub = Hub::spawn(DEFAULT_HUB_CAPACITY);
    let mut users = subscriber(&hub, "users").await;

    let (source, steps, _calls) = ScriptedSource::new();
    let (adapter, _control) = UpstreamAdapter::new(source, hub.clone(), fast_upstream());
    let task = tokio::spawn(adapter.run());

    steps.send(Step::SilentReconnect).unwrap();
    steps.send(Step::Payload(String::new())).unwrap();
    steps.send(Step::Payload("{\"table\": ".to_string())).unwrap();
    steps.send(Step::Payload("{\"action\":\"insert\"}".to_string())).unwrap();
    steps
        .send(Step::Payload(
            Envelope::new("users", "delete").with_field("id", 2).to_json().unwrap(),
        ))
        .unwrap();

    let envelope = users.recv().await.unwrap();
    assert_eq!(envelope.action, "delete");
    assert!(!task.is_finished());

    // Only the valid payload ever reached the hub.
    assert_eq!(hub.stats().await.unwrap().events_received, 1);
}

#[tokio::test]
async fn test_driver_reconnect_is_reported() {
    let hub = Hub::spawn(DEFAULT_HUB_CAPACITY);
    let mut users = subscriber(&hub, "users").await;

    let (source, steps, calls) = ScriptedSource::new();
    let (events, callback) = recorder();
    let (adapter, control) = UpstreamAdapter::new(source, hub.clone(), fast_upstream());
    tokio::spawn(adapter.with_event_callback(callback).run());
    let mut state = control.state();

    steps.send(Step::SilentReconnect).unwrap();
    steps
        .send(Step::Payload(Envelope::new("users", "insert").to_json().unwrap()))
        .unwrap();

    let envelope = users.recv().await.unwrap();
    assert_eq!(envelope.action, "insert");

    let events = events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            ListenerEvent::Connected,
            ListenerEvent::Disconnected("notification connection lost".to_string()),
            ListenerEvent::Reconnected,
        ]
    );
    assert!(state.has_changed().unwrap());
    assert_eq!(*state.borrow_and_update(), UpstreamState::Connected);

    // The driver reconnected itself, so no explicit connect was needed.
    assert_eq!(calls.lock().unwrap().connects, 0);
    assert_eq!(hub.stats().await.unwrap().events_received, 1);
}

#[tokio::test]
async fn test_receive_error_reconnects_with_backoff() {
    let hub = Hub::spawn(DEFAULT_HUB_CAPACITY);
    let mut users = subscriber(&hub, "users").await;

    let (mut source, steps, calls) = ScriptedSource::new();
    source.failing_connects = 2;
    let (events, callback) = recorder();
    let (adapter, control) = UpstreamAdapter::new(source, hub.clone(), fast_upstream());
    tokio::spawn(adapter.with_event_callback(callback).run());
    let mut state = control.state();

    steps.send(Step::Fail("connection reset")).unwrap();
    steps
        .send(Step::Payload(Envelope::new("users", "update").to_json().unwrap()))
        .unwrap();

    // Delivery resumes after the reconnect.
    let envelope = users.recv().await.unwrap();
    assert_eq!(envelope.action, "update");
    assert_eq!(calls.lock().unwrap().connects, 3);

    let events = events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            ListenerEvent::Connected,
            ListenerEvent::Disconnected("transport error: connection reset".to_string()),
            ListenerEvent::ConnectionAttemptFailed(
                "transport error: connection refused".to_string()
            ),
            ListenerEvent::ConnectionAttemptFailed(
                "transport error: connection refused".to_string()
            ),
            ListenerEvent::Reconnected,
        ]
    );
    assert_eq!(*state.borrow_and_update(), UpstreamState::Connected);
}

#[tokio::test]
async fn test_silence_triggers_keepalive_probe() {
    let hub = Hub::spawn(DEFAULT_HUB_CAPACITY);
    let (source, _steps, calls) = ScriptedSource::new();
    let config = fast_upstream().with_silence_timeout(Duration::from_millis(20));
    let (adapter, control) = UpstreamAdapter::new(source, hub.clone(), config);
    tokio::spawn(adapter.run());

    eventually(|| calls.lock().unwrap().pings >= 2).await;
    assert_eq!(calls.lock().unwrap().connects, 0);
    assert_eq!(*control.state().borrow(), UpstreamState::Connected);
}

#[tokio::test]
async fn test_failed_probe_marks_disconnected_and_reconnects() {
    let hub = Hub::spawn(DEFAULT_HUB_CAPACITY);
    let (mut source, _steps, calls) = ScriptedSource::new();
    source.fail_ping = true;
    let (events, callback) = recorder();
    let config = fast_upstream().with_silence_timeout(Duration::from_millis(20));
    let (adapter, _control) = UpstreamAdapter::new(source, hub.clone(), config);
    tokio::spawn(adapter.with_event_callback(callback).run());

    eventually(|| calls.lock().unwrap().connects >= 1).await;
    eventually(|| events.lock().unwrap().contains(&ListenerEvent::Reconnected)).await;

    let events = events.lock().unwrap().clone();
    assert_eq!(events[0], ListenerEvent::Connected);
    assert!(matches!(events[1], ListenerEvent::Disconnected(_)));
}

#[tokio::test]
async fn test_adapter_stops_when_hub_is_gone() {
    let (hub, handle) = Hub::new(4);
    drop(hub);

    let (source, steps, _calls) = ScriptedSource::new();
    let (adapter, _control) = UpstreamAdapter::new(source, handle, fast_upstream());
    let task = tokio::spawn(adapter.run());

    steps
        .send(Step::Payload(Envelope::new("users", "insert").to_json().unwrap()))
        .unwrap();

    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("adapter should stop")
        .unwrap();
}

#[tokio::test]
async fn test_broadcaster_start_and_listen() {
    let (source, steps, calls) = ScriptedSource::new();
    let config = BroadcasterConfig::default().with_upstream(fast_upstream());
    let broadcaster = Broadcaster::start_with_source(source, "table_changes", config)
        .await
        .unwrap();

    assert_eq!(calls.lock().unwrap().connects, 1);
    assert_eq!(calls.lock().unwrap().channels, vec!["table_changes"]);

    broadcaster.listen("audit_changes").await.unwrap();
    assert_eq!(
        calls.lock().unwrap().channels,
        vec!["table_changes", "audit_changes"]
    );

    let mut orders = subscriber(&broadcaster.hub(), "orders").await;
    steps
        .send(Step::Payload(
            json!({"table": "orders", "action": "insert", "data": {"total": 12.5}}).to_string(),
        ))
        .unwrap();

    let envelope = orders.recv().await.unwrap();
    assert_eq!(envelope.data.get("total"), Some(&json!(12.5)));
    assert_eq!(*broadcaster.upstream_state().borrow(), UpstreamState::Connected);
}

#[tokio::test]
async fn test_broadcaster_surfaces_initial_listen_failure() {
    let (mut source, _steps, _calls) = ScriptedSource::new();
    source.reject_channel = Some("forbidden");

    let result =
        Broadcaster::start_with_source(source, "forbidden", BroadcasterConfig::default()).await;
    assert!(matches!(result, Err(Error::Transport(_))));
}

#[tokio::test]
async fn test_broadcaster_surfaces_initial_connect_failure() {
    let (mut source, _steps, _calls) = ScriptedSource::new();
    source.failing_connects = 1;

    let result =
        Broadcaster::start_with_source(source, "table_changes", BroadcasterConfig::default())
            .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_broadcaster_rejects_invalid_config() {
    let (source, _steps, _calls) = ScriptedSource::new();
    let upstream = UpstreamConfig::default()
        .with_reconnect_interval(Duration::from_secs(60), Duration::from_secs(1));
    let config = BroadcasterConfig::default().with_upstream(upstream);

    let result = Broadcaster::start_with_source(source, "table_changes", config).await;
    assert!(matches!(result, Err(Error::Config(_))));
}

#[tokio::test]
async fn test_runtime_listen_failure_is_reported() {
    let hub = Hub::spawn(DEFAULT_HUB_CAPACITY);
    let (mut source, _steps, _calls) = ScriptedSource::new();
    source.reject_channel = Some("forbidden");
    let (adapter, control) = UpstreamAdapter::new(source, hub, fast_upstream());
    let task = tokio::spawn(adapter.run());

    assert!(control.listen("forbidden").await.is_err());
    assert!(!task.is_finished());
}
