//! rumqttc-backed session
//!
//! Wraps a rumqttc `AsyncClient`/`EventLoop` pair behind the [`Session`]
//! trait. Connecting polls the event loop until the broker acknowledges the
//! connection; after that a driver task keeps polling and translates events
//! into calls on the installed sink. When the event loop errors out the
//! driver reports the loss, parks the event loop and exits, so reconnection
//! stays under the lifecycle manager's control.

use super::{ConnectionEvents, DeliveryToken, Session, SessionError, TopicSubscription};
use crate::config::ConnectionDefinition;
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS, SubscribeFilter,
    Transport as RumqttcTransport,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use url::Url;

fn qos_level(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// Build rumqttc options from a connection definition.
fn configure_options(definition: &ConnectionDefinition) -> Result<MqttOptions, SessionError> {
    let url =
        Url::parse(&definition.uri).map_err(|_| SessionError::InvalidUri(definition.uri.clone()))?;
    let host = url
        .host_str()
        .ok_or_else(|| SessionError::InvalidUri(definition.uri.clone()))?;

    let (default_port, tls) = match url.scheme() {
        "tcp" | "mqtt" => (1883, false),
        "ssl" | "mqtts" | "tls" => (8883, true),
        _ => return Err(SessionError::InvalidUri(definition.uri.clone())),
    };
    let port = url.port().unwrap_or(default_port);

    let mut options = MqttOptions::new(definition.client_id(), host, port);
    options.set_keep_alive(Duration::from_secs(definition.keep_alive_secs));
    options.set_clean_session(definition.clean_session);
    if tls {
        options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    // Credentials come from the environment, never from the config file
    if let Some(username) = definition.username() {
        let password = definition.password().unwrap_or_default();
        options.set_credentials(username, password);
    }

    Ok(options)
}

struct Inner {
    client_id: String,
    connect_timeout: Duration,
    client: AsyncClient,
    /// Parked between connections; taken by the driver while connected
    event_loop: Mutex<Option<EventLoop>>,
    sink: std::sync::Mutex<Option<Arc<dyn ConnectionEvents>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    /// Set by the terminal disconnect; the session never reconnects after it
    closed: AtomicBool,
}

fn current_sink(inner: &Inner) -> Option<Arc<dyn ConnectionEvents>> {
    inner.sink.lock().ok().and_then(|guard| guard.clone())
}

/// Physical MQTT connection backed by rumqttc.
pub struct RumqttSession {
    inner: Arc<Inner>,
}

impl RumqttSession {
    pub fn new(definition: &ConnectionDefinition) -> Result<Self, SessionError> {
        // The v4 API speaks 3.1.1 only; refuse rather than silently upgrade
        if definition.mqtt_version != 4 {
            return Err(SessionError::UnsupportedProtocolVersion(
                definition.mqtt_version,
            ));
        }
        let options = configure_options(definition)?;
        let (client, event_loop) = AsyncClient::new(options, 10);
        Ok(Self {
            inner: Arc::new(Inner {
                client_id: definition.client_id(),
                connect_timeout: definition.connect_timeout(),
                client,
                event_loop: Mutex::new(Some(event_loop)),
                sink: std::sync::Mutex::new(None),
                driver: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }
}

/// Driver task: polls the event loop while connected and translates events
/// into sink calls. Exits on the first poll error after reporting the loss.
async fn drive(inner: Arc<Inner>, mut event_loop: EventLoop) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => match current_sink(&inner) {
                Some(sink) => {
                    if let Err(dispatch_error) =
                        sink.message_arrived(&publish.topic, publish.payload).await
                    {
                        error!(
                            "Dispatch failed for client {} on topic {}: {}",
                            inner.client_id, publish.topic, dispatch_error
                        );
                    }
                }
                None => warn!(
                    "Client {} received a message on {} before a sink was installed",
                    inner.client_id, publish.topic
                ),
            },
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                if let Some(sink) = current_sink(&inner) {
                    sink.delivery_complete(DeliveryToken(ack.pkid)).await;
                }
            }
            Ok(Event::Incoming(Packet::PubComp(comp))) => {
                if let Some(sink) = current_sink(&inner) {
                    sink.delivery_complete(DeliveryToken(comp.pkid)).await;
                }
            }
            Ok(event) => {
                debug!("Client {} event: {:?}", inner.client_id, event);
            }
            Err(connection_error) => {
                warn!(
                    "Event loop error for client {}: {}",
                    inner.client_id, connection_error
                );
                // Park the event loop first so a reconnect attempt triggered
                // by the loss notification finds it available
                *inner.event_loop.lock().await = Some(event_loop);
                if let Some(sink) = current_sink(&inner) {
                    sink.connection_lost(connection_error.to_string()).await;
                }
                return;
            }
        }
    }
}

#[async_trait]
impl Session for RumqttSession {
    async fn connect(&self) -> Result<(), SessionError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SessionError::NotConnected);
        }
        let mut slot = self.inner.event_loop.lock().await;
        let mut event_loop = slot.take().ok_or_else(|| {
            SessionError::ConnectionFailed("session is already connected".into())
        })?;

        let timeout = self.inner.connect_timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, event_loop.poll()).await {
                Err(_) => {
                    *slot = Some(event_loop);
                    return Err(SessionError::ConnectTimeout(timeout));
                }
                Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    if ack.code == ConnectReturnCode::Success {
                        let inner = self.inner.clone();
                        let handle = tokio::spawn(drive(inner, event_loop));
                        *self.inner.driver.lock().await = Some(handle);
                        return Ok(());
                    }
                    *slot = Some(event_loop);
                    return Err(SessionError::ConnectionFailed(
                        format!("broker refused connection: {:?}", ack.code).into(),
                    ));
                }
                Ok(Ok(_)) => continue,
                Ok(Err(connection_error)) => {
                    *slot = Some(event_loop);
                    return Err(SessionError::ConnectionFailed(Box::new(connection_error)));
                }
            }
        }
    }

    /// Terminal: stops the driver and closes the session. The session cannot
    /// be reconnected afterwards.
    async fn disconnect(&self) -> Result<(), SessionError> {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.inner.driver.lock().await.take() {
            handle.abort();
        }
        self.inner
            .client
            .disconnect()
            .await
            .map_err(|client_error| SessionError::ConnectionFailed(Box::new(client_error)))
    }

    async fn subscribe(&self, subscriptions: &[TopicSubscription]) -> Result<(), SessionError> {
        let filters: Vec<SubscribeFilter> = subscriptions
            .iter()
            .map(|subscription| {
                SubscribeFilter::new(subscription.filter.clone(), qos_level(subscription.qos))
            })
            .collect();
        self.inner
            .client
            .subscribe_many(filters)
            .await
            .map_err(|client_error| SessionError::SubscriptionFailed(Box::new(client_error)))
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: u8,
        retain: bool,
    ) -> Result<(), SessionError> {
        self.inner
            .client
            .publish(topic, qos_level(qos), retain, payload.to_vec())
            .await
            .map_err(|client_error| SessionError::PublishFailed(Box::new(client_error)))
    }

    fn client_id(&self) -> String {
        self.inner.client_id.clone()
    }

    fn install_sink(&self, sink: Arc<dyn ConnectionEvents>) -> Result<(), SessionError> {
        let mut slot = self
            .inner
            .sink
            .lock()
            .map_err(|_| SessionError::SinkAlreadyInstalled)?;
        if slot.is_some() {
            return Err(SessionError::SinkAlreadyInstalled);
        }
        *slot = Some(sink);
        Ok(())
    }
}

/// Creates [`RumqttSession`]s; the production [`super::SessionFactory`].
#[derive(Debug, Default)]
pub struct RumqttSessionFactory;

impl super::SessionFactory for RumqttSessionFactory {
    fn create(
        &self,
        definition: &ConnectionDefinition,
    ) -> Result<Arc<dyn Session>, SessionError> {
        Ok(Arc::new(RumqttSession::new(definition)?))
    }
}
