//! Protocol-client boundary
//!
//! This module defines the contract between the lifecycle engine and the
//! underlying MQTT client implementation. The engine only ever talks to a
//! [`Session`]; events flow back through the single [`ConnectionEvents`] sink
//! installed on it. The rumqttc-backed implementation lives in [`rumqtt`];
//! tests use the mock session from `crate::testing`.

use crate::config::{ConnectionDefinition, ListenerSpec};
use crate::dispatch::DispatchError;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

pub mod rumqtt;

/// One topic filter paired with its QoS level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSubscription {
    pub filter: String,
    pub qos: u8,
}

impl TopicSubscription {
    /// Pair up the parallel filter/QoS sequences of a listener spec.
    /// Lengths are validated at configuration time.
    pub fn plan(spec: &ListenerSpec) -> Vec<TopicSubscription> {
        spec.topics
            .iter()
            .zip(spec.qos.iter())
            .map(|(filter, &qos)| TopicSubscription {
                filter: filter.clone(),
                qos,
            })
            .collect()
    }
}

/// Identity of a confirmed outbound delivery (the packet id of the
/// acknowledged publish).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryToken(pub u16);

/// Errors at the protocol-client boundary
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Publishing failed: {0}")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Invalid broker URI: {0}")]
    InvalidUri(String),
    #[error("Protocol version {0} is not supported by this client")]
    UnsupportedProtocolVersion(u8),
    #[error("Connect attempt timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),
    #[error("Not connected")]
    NotConnected,
    #[error("A callback sink is already installed for this session")]
    SinkAlreadyInstalled,
}

/// Callback sink installed on a [`Session`]; exactly one per session.
///
/// Implemented by the connection lifecycle manager. The session's driver
/// invokes these on its own task, so implementations must not block it for
/// unbounded time.
#[async_trait]
pub trait ConnectionEvents: Send + Sync {
    /// Unsolicited disconnect detected by the protocol client.
    async fn connection_lost(&self, cause: String);

    /// Inbound message on a subscribed topic. The error of a synchronous
    /// (unpooled) listener propagates back to the driver unmodified.
    async fn message_arrived(&self, topic: &str, payload: Bytes) -> Result<(), DispatchError>;

    /// Broker acknowledged an outbound publish.
    async fn delivery_complete(&self, token: DeliveryToken);
}

/// A single physical connection to a message broker.
#[async_trait]
pub trait Session: Send + Sync {
    /// Establish the session. Returns once the broker has acknowledged the
    /// connection, or with the failure of this one attempt.
    async fn connect(&self) -> Result<(), SessionError>;

    async fn disconnect(&self) -> Result<(), SessionError>;

    async fn subscribe(&self, subscriptions: &[TopicSubscription]) -> Result<(), SessionError>;

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: u8,
        retain: bool,
    ) -> Result<(), SessionError>;

    fn client_id(&self) -> String;

    /// Install the callback sink. A second install is an error.
    fn install_sink(&self, sink: Arc<dyn ConnectionEvents>) -> Result<(), SessionError>;
}

/// Creates sessions from connection definitions; the seam that lets the
/// registrar stay independent of the concrete client crate.
pub trait SessionFactory: Send + Sync {
    fn create(&self, definition: &ConnectionDefinition) -> Result<Arc<dyn Session>, SessionError>;
}
