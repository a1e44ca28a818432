//! Handler resolution by symbolic key
//!
//! The dispatch engine never holds application handler objects directly; it
//! stores string keys and resolves them through a [`HandlerRegistry`] at the
//! moment an event must be delivered. Each capability has its own namespace,
//! so a listener and a reject handler may share a key without colliding.

use crate::transport::DeliveryToken;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Error an application handler may surface to the engine.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Application handler for inbound messages on subscribed topic filters.
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(&self, topic: &str, payload: Bytes) -> Result<(), HandlerError>;

    /// Invoked in delegate reconnection mode when the connection drops.
    async fn connection_lost(&self, _cause: &str) {}
}

/// Application handler for delivery confirmations.
#[async_trait]
pub trait PublishMonitor: Send + Sync {
    async fn delivery_complete(&self, token: DeliveryToken);

    /// Invoked in delegate reconnection mode when the connection drops.
    async fn connection_lost(&self, _cause: &str) {}
}

/// Application handler for messages the worker pool could not accept.
#[async_trait]
pub trait RejectHandler: Send + Sync {
    async fn reject(&self, topic: &str, payload: Bytes);
}

/// Resolution failures; always a configuration error, never retried
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("No listener registered under key '{0}'")]
    UnknownListener(String),
    #[error("No publisher handler registered under key '{0}'")]
    UnknownPublisher(String),
    #[error("No reject handler registered under key '{0}'")]
    UnknownRejectHandler(String),
}

/// Key-to-handler lookup, one namespace per capability.
///
/// The engine is constructed against this trait so handler instances can be
/// bound after the engine exists, or rebound in tests.
pub trait HandlerRegistry: Send + Sync {
    fn listener(&self, key: &str) -> Result<Arc<dyn MessageListener>, RegistryError>;
    fn publisher(&self, key: &str) -> Result<Arc<dyn PublishMonitor>, RegistryError>;
    fn reject_handler(&self, key: &str) -> Result<Arc<dyn RejectHandler>, RegistryError>;
}

/// In-memory [`HandlerRegistry`] populated at startup.
#[derive(Default)]
pub struct StaticRegistry {
    listeners: HashMap<String, Arc<dyn MessageListener>>,
    publishers: HashMap<String, Arc<dyn PublishMonitor>>,
    reject_handlers: HashMap<String, Arc<dyn RejectHandler>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listener(mut self, key: &str, listener: Arc<dyn MessageListener>) -> Self {
        self.listeners.insert(key.to_string(), listener);
        self
    }

    pub fn with_publisher(mut self, key: &str, publisher: Arc<dyn PublishMonitor>) -> Self {
        self.publishers.insert(key.to_string(), publisher);
        self
    }

    pub fn with_reject_handler(mut self, key: &str, handler: Arc<dyn RejectHandler>) -> Self {
        self.reject_handlers.insert(key.to_string(), handler);
        self
    }
}

impl HandlerRegistry for StaticRegistry {
    fn listener(&self, key: &str) -> Result<Arc<dyn MessageListener>, RegistryError> {
        self.listeners
            .get(key)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownListener(key.to_string()))
    }

    fn publisher(&self, key: &str) -> Result<Arc<dyn PublishMonitor>, RegistryError> {
        self.publishers
            .get(key)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownPublisher(key.to_string()))
    }

    fn reject_handler(&self, key: &str) -> Result<Arc<dyn RejectHandler>, RegistryError> {
        self.reject_handlers
            .get(key)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownRejectHandler(key.to_string()))
    }
}
