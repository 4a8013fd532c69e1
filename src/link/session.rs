//! Broker session over `rumqttc`
//!
//! # Lifecycle
//!
//! ```text
//! new ──► register_device* ──► connect ──► [receive loop + liveness sweep] ──► disconnect
//!                                 │                                               ▲
//!                                 └──────────── failure: nothing spawned ─────────┘
//! ```
//!
//! `connected` only turns true after a positive CONNACK. `disconnect` may be called any number
//! of times; only the first call after a successful connect does any work.

use super::device::DeviceRegistry;
use super::liveness::{LivenessSettings, LivenessTracker};
use super::message::LinkMessage;
use crate::config::AgentConfig;
use crate::error::{ConnectFailure, LinkError};
use crate::events::{EventSink, OutboundEvent};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Broker connection as seen by the takt run
///
/// The run only needs this seam; [`LinkSession`] is the production implementation.
#[async_trait]
pub trait Link: Send + Sync {
    /// Establishes the session and subscribes to every registered device
    async fn connect(&mut self, timeout: Duration) -> Result<(), LinkError>;

    fn is_connected(&self) -> bool;

    /// Queues a publish without waiting for the broker
    fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), LinkError>;

    /// Stops background work and clears `connected`; idempotent
    fn disconnect(&mut self);

    fn registry(&self) -> &DeviceRegistry;

    /// Human readable broker address for logs and events
    fn broker(&self) -> String;
}

/// Request queue slots beyond the initial subscriptions
const REQUEST_CAPACITY: usize = 64;

/// Builds a fresh link for each run
pub type LinkFactory = Arc<dyn Fn(&AgentConfig, EventSink) -> Box<dyn Link> + Send + Sync>;

#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub credentials: Option<(String, String)>,
    pub keep_alive: Duration,
    pub reconnect_delay: Duration,
    pub liveness: LivenessSettings,
}

impl From<&AgentConfig> for SessionSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            host: config.broker.host.clone(),
            port: config.broker.port,
            client_id: config.broker.client_id.clone(),
            credentials: config.broker.credentials(),
            keep_alive: Duration::from_secs(config.broker.keep_alive_secs.max(5)),
            reconnect_delay: Duration::from_millis(config.broker.reconnect_delay_ms),
            liveness: LivenessSettings {
                timeout: Duration::from_secs(config.timing.liveness_timeout_secs),
                sweep_interval: Duration::from_secs(config.timing.sweep_interval_secs.max(1)),
            },
        }
    }
}

impl ConnectFailure {
    /// Maps a refusing CONNACK code onto the failure taxonomy
    pub fn from_return_code(code: ConnectReturnCode) -> Option<Self> {
        match code {
            ConnectReturnCode::Success => None,
            ConnectReturnCode::RefusedProtocolVersion => Some(ConnectFailure::ProtocolMismatch),
            ConnectReturnCode::BadClientId => Some(ConnectFailure::ClientIdRejected),
            ConnectReturnCode::ServiceUnavailable => Some(ConnectFailure::ServerUnavailable),
            ConnectReturnCode::BadUserNamePassword => Some(ConnectFailure::BadCredentials),
            ConnectReturnCode::NotAuthorized => Some(ConnectFailure::Unauthorized),
        }
    }
}

fn classify_connection_error(error: &ConnectionError) -> ConnectFailure {
    match error {
        ConnectionError::ConnectionRefused(code) => {
            ConnectFailure::from_return_code(*code).unwrap_or(ConnectFailure::Unreachable)
        }
        _ => ConnectFailure::Unreachable,
    }
}

pub struct LinkSession {
    settings: SessionSettings,
    registry: DeviceRegistry,
    events: EventSink,
    client: Option<AsyncClient>,
    connected: Arc<AtomicBool>,
    subscriptions: Vec<String>,
    cancel: CancellationToken,
    receive_task: Option<JoinHandle<()>>,
    tracker: Option<LivenessTracker>,
}

impl LinkSession {
    pub fn new(settings: SessionSettings, registry: DeviceRegistry, events: EventSink) -> Self {
        Self {
            settings,
            registry,
            events,
            client: None,
            connected: Arc::new(AtomicBool::new(false)),
            subscriptions: Vec::new(),
            cancel: CancellationToken::new(),
            receive_task: None,
            tracker: None,
        }
    }

    /// Factory registering the configured device on every new session
    pub fn factory() -> LinkFactory {
        Arc::new(|config: &AgentConfig, events: EventSink| {
            let registry = DeviceRegistry::new(config.device.namespace.clone());
            registry.register(&config.device.id);
            Box::new(LinkSession::new(
                SessionSettings::from(config),
                registry,
                events,
            )) as Box<dyn Link>
        })
    }

    pub fn register_device(&self, device_id: &str) -> bool {
        if self.client.is_some() {
            warn!(
                "Device {} registered after connect, it will be subscribed on the next connect",
                device_id
            );
        }
        self.registry.register(device_id)
    }

    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.settings.client_id.clone(),
            self.settings.host.clone(),
            self.settings.port,
        );
        options.set_keep_alive(self.settings.keep_alive);
        if let Some((user, password)) = &self.settings.credentials {
            options.set_credentials(user.clone(), password.clone());
        }
        options
    }
}

async fn wait_for_ack(eventloop: &mut EventLoop) -> Result<(), LinkError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                debug!("Broker acknowledged session: {:?}", ack);
                return match ConnectFailure::from_return_code(ack.code) {
                    None => Ok(()),
                    Some(failure) => Err(LinkError::connect(failure, format!("{:?}", ack.code))),
                };
            }
            Ok(other) => debug!("Event before acknowledgement: {:?}", other),
            Err(e) => {
                return Err(LinkError::connect(
                    classify_connection_error(&e),
                    e.to_string(),
                ))
            }
        }
    }
}

#[async_trait]
impl Link for LinkSession {
    async fn connect(&mut self, timeout: Duration) -> Result<(), LinkError> {
        if self.is_connected() {
            warn!("Session to {} already connected", self.broker());
            return Ok(());
        }

        info!("Connecting to broker {}", self.broker());
        self.connected.store(false, Ordering::SeqCst);
        let topics = self.registry.subscription_topics();
        // Every subscribe is queued before the event loop is polled, so the request
        // channel must hold all of them.
        let (client, mut eventloop) =
            AsyncClient::new(self.mqtt_options(), REQUEST_CAPACITY + topics.len());

        let handshake = async {
            wait_for_ack(&mut eventloop).await?;
            for topic in &topics {
                client
                    .subscribe(topic.as_str(), QoS::AtMostOnce)
                    .await
                    .map_err(|e| LinkError::Client(format!("subscribe {}: {}", topic, e)))?;
                debug!("Subscribed to {}", topic);
            }
            Ok::<(), LinkError>(())
        };

        match tokio::time::timeout(timeout, handshake).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Broker connection failed: {}", e);
                return Err(e);
            }
            Err(_) => {
                error!("Timed out connecting to broker after {:?}", timeout);
                return Err(LinkError::connect(
                    ConnectFailure::Timeout,
                    format!("session not established within {:?}", timeout),
                ));
            }
        }

        self.subscriptions = topics.clone();

        self.cancel = CancellationToken::new();
        self.connected.store(true, Ordering::SeqCst);
        self.receive_task = Some(tokio::spawn(receive_loop(
            eventloop,
            ReceiveContext {
                client: client.clone(),
                registry: self.registry.clone(),
                events: self.events.clone(),
                connected: self.connected.clone(),
                topics,
                reconnect_delay: self.settings.reconnect_delay,
                cancel: self.cancel.clone(),
            },
        )));
        self.tracker = Some(LivenessTracker::spawn(
            self.registry.clone(),
            self.settings.liveness.clone(),
            self.events.clone(),
            &self.cancel,
        ));
        self.client = Some(client);

        info!("Connected to broker {}", self.broker());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), LinkError> {
        let client = match &self.client {
            Some(client) if self.is_connected() => client,
            _ => return Err(LinkError::NotConnected),
        };
        client
            .try_publish(topic, qos, false, payload)
            .map_err(|e| LinkError::Client(e.to_string()))
    }

    fn disconnect(&mut self) {
        let Some(client) = self.client.take() else {
            debug!("Session to {} already disconnected", self.broker());
            self.connected.store(false, Ordering::SeqCst);
            return;
        };

        if let Err(e) = client.try_disconnect() {
            debug!("Disconnect request not queued: {}", e);
        }
        self.cancel.cancel();
        if let Some(tracker) = self.tracker.take() {
            tracker.stop();
        }
        if let Some(task) = self.receive_task.take() {
            task.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
        self.subscriptions.clear();
        info!("Disconnected from broker {}", self.broker());
    }

    fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    fn broker(&self) -> String {
        format!("{}:{}", self.settings.host, self.settings.port)
    }
}

impl Drop for LinkSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

struct ReceiveContext {
    client: AsyncClient,
    registry: DeviceRegistry,
    events: EventSink,
    connected: Arc<AtomicBool>,
    topics: Vec<String>,
    reconnect_delay: Duration,
    cancel: CancellationToken,
}

async fn receive_loop(mut eventloop: EventLoop, ctx: ReceiveContext) {
    debug!("Receive loop started");
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            polled = eventloop.poll() => match polled {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = LinkMessage::received_now(publish.topic, publish.payload.to_vec());
                    debug!("Received {}", message);
                    if let Some(change) = ctx.registry.dispatch(&message) {
                        ctx.events.emit(OutboundEvent::DeviceStatusChanged {
                            device_id: change.device_id,
                            connected: change.connected,
                        });
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Session re-established, restoring subscriptions");
                    for topic in &ctx.topics {
                        if let Err(e) = ctx.client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                            warn!("Failed to restore subscription {}: {}", topic, e);
                        }
                    }
                    ctx.connected.store(true, Ordering::SeqCst);
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("Broker closed the session");
                    ctx.connected.store(false, Ordering::SeqCst);
                }
                Ok(_) => {}
                Err(e) => {
                    if ctx.connected.swap(false, Ordering::SeqCst) {
                        warn!("Disconnected unexpectedly: {}", e);
                    } else {
                        debug!("Reconnect attempt failed: {}", e);
                    }
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => break,
                        _ = tokio::time::sleep(ctx.reconnect_delay) => {}
                    }
                }
            }
        }
    }
    ctx.connected.store(false, Ordering::SeqCst);
    debug!("Receive loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> LinkSession {
        let mut config = AgentConfig::default();
        config.broker.host = "127.0.0.1".into();
        config.broker.port = 1;
        let registry = DeviceRegistry::new("takt");
        registry.register("a");
        let (events, _rx) = EventSink::channel(8);
        LinkSession::new(SessionSettings::from(&config), registry, events)
    }

    #[test]
    fn return_codes_map_to_taxonomy() {
        assert_eq!(ConnectFailure::from_return_code(ConnectReturnCode::Success), None);
        assert_eq!(
            ConnectFailure::from_return_code(ConnectReturnCode::RefusedProtocolVersion),
            Some(ConnectFailure::ProtocolMismatch)
        );
        assert_eq!(
            ConnectFailure::from_return_code(ConnectReturnCode::BadClientId),
            Some(ConnectFailure::ClientIdRejected)
        );
        assert_eq!(
            ConnectFailure::from_return_code(ConnectReturnCode::ServiceUnavailable),
            Some(ConnectFailure::ServerUnavailable)
        );
        assert_eq!(
            ConnectFailure::from_return_code(ConnectReturnCode::BadUserNamePassword),
            Some(ConnectFailure::BadCredentials)
        );
        assert_eq!(
            ConnectFailure::from_return_code(ConnectReturnCode::NotAuthorized),
            Some(ConnectFailure::Unauthorized)
        );
    }

    #[test]
    fn refused_connection_error_is_classified() {
        let error = ConnectionError::ConnectionRefused(ConnectReturnCode::NotAuthorized);
        assert_eq!(classify_connection_error(&error), ConnectFailure::Unauthorized);
    }

    #[test]
    fn publish_before_connect_fails() {
        let session = session();
        assert!(!session.is_connected());
        assert!(matches!(
            session.publish("takt/device/a", b"{}".to_vec(), QoS::AtLeastOnce),
            Err(LinkError::NotConnected)
        ));
    }

    #[test]
    fn disconnect_is_idempotent() {
        let mut session = session();
        session.disconnect();
        session.disconnect();
        assert!(!session.is_connected());
        assert!(session.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn failed_connect_leaves_nothing_running() {
        let mut session = session();
        let result = session.connect(Duration::from_secs(2)).await;

        let failure = match result {
            Err(LinkError::Connect { failure, .. }) => failure,
            other => panic!("expected connect failure, got {:?}", other),
        };
        assert!(matches!(
            failure,
            ConnectFailure::Unreachable | ConnectFailure::Timeout
        ));
        assert!(!session.is_connected());
        assert!(session.receive_task.is_none());
        assert!(session.tracker.is_none());
    }

    /// Accepts one client, acknowledges its CONNECT and then swallows everything it sends
    async fn accepting_broker() -> u16 {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            if socket.read(&mut buf).await.unwrap_or(0) == 0 {
                return;
            }
            socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
            while let Ok(n) = socket.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        });
        port
    }

    #[tokio::test]
    async fn connect_with_many_devices_completes_within_timeout() {
        let mut config = AgentConfig::default();
        config.broker.host = "127.0.0.1".into();
        config.broker.port = accepting_broker().await;
        let registry = DeviceRegistry::new("takt");
        for i in 0..40 {
            registry.register(&format!("cell-{}", i));
        }
        let (events, _rx) = EventSink::channel(8);
        let mut session = LinkSession::new(SessionSettings::from(&config), registry, events);

        let result =
            tokio::time::timeout(Duration::from_secs(5), session.connect(Duration::from_secs(2)))
                .await;

        assert!(matches!(result, Ok(Ok(()))), "connect result: {:?}", result);
        assert!(session.is_connected());
        assert_eq!(session.subscriptions().len(), 80);
        session.disconnect();
        assert!(!session.is_connected());
    }
}
