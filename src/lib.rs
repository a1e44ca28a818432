//! brokerlink - MQTT connection lifecycle management
//!
//! This crate manages the lifecycle of one or more independent MQTT broker
//! connections. It sits between a low-level protocol client and application
//! code, providing:
//!
//! - Automatic reconnection under a per-connection policy (none, delegate to
//!   application handlers, or periodic retry until success)
//! - Asynchronous inbound message dispatch, either synchronous on the
//!   protocol-client task or through a bounded worker pool with an explicit
//!   rejection path for saturation
//! - Decoupled event routing: handlers are resolved by symbolic key through a
//!   [`registry::HandlerRegistry`], so the engine never holds concrete handler
//!   types
//!
//! # Quick Start
//!
//! ```no_run
//! use brokerlink::config::ConnectionsConfig;
//! use brokerlink::registrar::ConnectionRegistrar;
//! use brokerlink::registry::{MessageListener, StaticRegistry};
//! use brokerlink::transport::rumqtt::RumqttSessionFactory;
//! use bytes::Bytes;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! struct EchoListener;
//!
//! #[async_trait::async_trait]
//! impl MessageListener for EchoListener {
//!     async fn on_message(
//!         &self,
//!         topic: &str,
//!         payload: Bytes,
//!     ) -> Result<(), brokerlink::registry::HandlerError> {
//!         println!("{topic}: {} bytes", payload.len());
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConnectionsConfig::load_from_file(Path::new("connections.toml"))?;
//! let registry = Arc::new(StaticRegistry::new().with_listener("echo", Arc::new(EchoListener)));
//!
//! let mut registrar = ConnectionRegistrar::new(registry);
//! registrar
//!     .register_all(config.connections, &RumqttSessionFactory)
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod manager;
pub mod registrar;
pub mod registry;
pub mod testing;
pub mod transport;

pub use config::{
    ConnectionDefinition, ConnectionKey, ConnectionsConfig, ListenerSpec, PoolSpec, PublisherSpec,
    ReconnectionMode, ReconnectionPolicy,
};
pub use dispatch::{DispatchError, MessageDispatcher};
pub use error::{LinkResult, RegistrationError};
pub use manager::{ConnectionManager, LinkState};
pub use registrar::{ClientInfo, ConnectionRegistrar};
pub use registry::{
    HandlerRegistry, MessageListener, PublishMonitor, RejectHandler, StaticRegistry,
};
pub use transport::{ConnectionEvents, DeliveryToken, Session, SessionFactory, TopicSubscription};
