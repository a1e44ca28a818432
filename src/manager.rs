//! Connection lifecycle management
//!
//! One [`ConnectionManager`] owns one physical connection. It implements the
//! protocol-client callback contract, applies the reconnection policy on
//! connection loss, and routes inbound messages through the dispatcher. The
//! manager is responsible for its own recovery from the very first connect
//! attempt: `start()` never surfaces a connect failure to the caller.

use crate::config::{ConnectionDefinition, ReconnectionMode};
use crate::dispatch::{DispatchError, MessageDispatcher};
use crate::registry::HandlerRegistry;
use crate::transport::{
    ConnectionEvents, DeliveryToken, Session, SessionError, TopicSubscription,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Connection state as seen by the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// A reconnect attempt is in flight under the automatic policy
    Recovering,
}

/// Lifecycle manager for a single broker connection.
///
/// Wired by the registrar (publisher key first, then listener key and
/// dispatcher) and installed as the session's only callback sink before
/// `start()` runs.
pub struct ConnectionManager {
    session: Arc<dyn Session>,
    definition: ConnectionDefinition,
    registry: Arc<dyn HandlerRegistry>,
    dispatcher: Option<MessageDispatcher>,
    listener_key: Option<String>,
    publisher_key: Option<String>,
    subscriptions: Vec<TopicSubscription>,
    state_tx: watch::Sender<LinkState>,
    retrying: Arc<AtomicBool>,
    retry_task: Mutex<Option<JoinHandle<()>>>,
}

/// Connect, then subscribe the configured filters. Used for the initial
/// attempt and for every reconnect tick.
async fn establish(
    session: &dyn Session,
    subscriptions: &[TopicSubscription],
) -> Result<(), SessionError> {
    session.connect().await?;
    if !subscriptions.is_empty() {
        session.subscribe(subscriptions).await?;
    }
    Ok(())
}

impl ConnectionManager {
    pub fn new(
        session: Arc<dyn Session>,
        definition: ConnectionDefinition,
        registry: Arc<dyn HandlerRegistry>,
    ) -> Self {
        let subscriptions = definition
            .listener
            .as_ref()
            .map(TopicSubscription::plan)
            .unwrap_or_default();
        let (state_tx, _) = watch::channel(LinkState::Disconnected);
        Self {
            session,
            definition,
            registry,
            dispatcher: None,
            listener_key: None,
            publisher_key: None,
            subscriptions,
            state_tx,
            retrying: Arc::new(AtomicBool::new(false)),
            retry_task: Mutex::new(None),
        }
    }

    /// Record the delivery-confirmation handler key.
    pub fn wire_publisher(&mut self, key: &str) {
        self.publisher_key = Some(key.to_string());
    }

    /// Record the listener handler key and the dispatcher that will carry its
    /// messages.
    pub fn wire_listener(&mut self, key: &str, dispatcher: MessageDispatcher) {
        self.listener_key = Some(key.to_string());
        self.dispatcher = Some(dispatcher);
    }

    pub fn definition(&self) -> &ConnectionDefinition {
        &self.definition
    }

    pub fn client_id(&self) -> String {
        self.session.client_id()
    }

    pub fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    /// Watch state transitions; mainly for monitoring and tests.
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    /// Whether a reconnect timer is currently active.
    pub fn is_recovering(&self) -> bool {
        self.retrying.load(Ordering::SeqCst)
    }

    /// Initial connect and subscribe. A failure here is handled exactly like
    /// a runtime connection loss and is not returned to the caller.
    pub async fn start(&self) {
        let _ = self.state_tx.send(LinkState::Connecting);
        match establish(self.session.as_ref(), &self.subscriptions).await {
            Ok(()) => {
                let _ = self.state_tx.send(LinkState::Connected);
                info!("Client {} is now connected", self.client_id());
            }
            Err(error) => {
                warn!(
                    "Initial connect failed for client {}: {}",
                    self.client_id(),
                    error
                );
                self.connection_lost(error.to_string()).await;
            }
        }
    }

    /// Stop a pending reconnect timer. Safe to call when none is active or
    /// after the timer already cancelled itself on success. The flag is
    /// cleared under the task lock so it never disagrees with the handle.
    pub async fn cancel_reconnect(&self) {
        let mut slot = self.retry_task.lock().await;
        if let Some(handle) = slot.take() {
            handle.abort();
        }
        self.retrying.store(false, Ordering::SeqCst);
    }

    /// Start the periodic reconnect task unless one is already running.
    /// Repeated loss events while a timer is active are coalesced here. The
    /// guard check, the spawn and the handle store all happen under the task
    /// lock; only the retry task's self-cancel on success bypasses it.
    async fn spawn_retry(&self) {
        let mut slot = self.retry_task.lock().await;
        if self.retrying.swap(true, Ordering::SeqCst) {
            debug!(
                "Reconnect timer already active for client {}, coalescing loss event",
                self.client_id()
            );
            return;
        }

        let session = self.session.clone();
        let subscriptions = self.subscriptions.clone();
        let state_tx = self.state_tx.clone();
        let retrying = self.retrying.clone();
        let period = self.definition.reconnection.interval();
        let client_id = self.client_id();

        let handle = tokio::spawn(async move {
            // First attempt one full period after the loss, then fixed-rate
            let start = tokio::time::Instant::now() + period;
            let mut ticks = tokio::time::interval_at(start, period);
            loop {
                ticks.tick().await;
                let _ = state_tx.send(LinkState::Recovering);
                debug!("Trying to reconnect client {}", client_id);
                match establish(session.as_ref(), &subscriptions).await {
                    Ok(()) => {
                        let _ = state_tx.send(LinkState::Connected);
                        info!("Client {} is now connected", client_id);
                        retrying.store(false, Ordering::SeqCst);
                        break;
                    }
                    Err(error) => {
                        debug!("Reconnect attempt failed for client {}: {}", client_id, error);
                    }
                }
            }
        });
        *slot = Some(handle);
    }
}

#[async_trait]
impl ConnectionEvents for ConnectionManager {
    async fn connection_lost(&self, cause: String) {
        warn!("Connection lost for client {}: {}", self.client_id(), cause);
        let _ = self.state_tx.send(LinkState::Disconnected);

        match self.definition.reconnection.mode {
            ReconnectionMode::None => {
                debug!("Reconnection disabled for client {}", self.client_id());
            }
            ReconnectionMode::Delegate => {
                // Publisher hook strictly before the listener hook
                if let Some(key) = &self.publisher_key {
                    match self.registry.publisher(key) {
                        Ok(handler) => handler.connection_lost(&cause).await,
                        Err(resolve_error) => error!(
                            "Cannot delegate connection loss for client {}: {}",
                            self.client_id(),
                            resolve_error
                        ),
                    }
                }
                if let Some(key) = &self.listener_key {
                    match self.registry.listener(key) {
                        Ok(handler) => handler.connection_lost(&cause).await,
                        Err(resolve_error) => error!(
                            "Cannot delegate connection loss for client {}: {}",
                            self.client_id(),
                            resolve_error
                        ),
                    }
                }
            }
            ReconnectionMode::Automatic => {
                self.spawn_retry().await;
            }
        }
    }

    async fn message_arrived(&self, topic: &str, payload: Bytes) -> Result<(), DispatchError> {
        match &self.dispatcher {
            Some(dispatcher) => dispatcher.dispatch(topic, payload).await,
            None => {
                warn!(
                    "Message arrived on topic {} for client {} with no listener configured",
                    topic,
                    self.client_id()
                );
                Ok(())
            }
        }
    }

    async fn delivery_complete(&self, token: DeliveryToken) {
        if let Some(key) = &self.publisher_key {
            match self.registry.publisher(key) {
                Ok(handler) => handler.delivery_complete(token).await,
                Err(resolve_error) => error!(
                    "Cannot confirm delivery for client {}: {}",
                    self.client_id(),
                    resolve_error
                ),
            }
        }
    }
}
