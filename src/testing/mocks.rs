//! Mock implementations for testing
//!
//! Provides a scriptable mock session, recording handler implementations and
//! a resolution-recording registry so lifecycle, dispatch and registration
//! behavior can be tested without external dependencies.

use crate::config::ConnectionDefinition;
use crate::registry::{
    HandlerError, HandlerRegistry, MessageListener, PublishMonitor, RegistryError, RejectHandler,
};
use crate::transport::{
    ConnectionEvents, DeliveryToken, Session, SessionError, SessionFactory, TopicSubscription,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};

/// Mock session with scriptable connect failures and event injection.
///
/// `inject_*` methods drive the installed sink the way a real protocol
/// client driver would.
#[derive(Default)]
pub struct MockSession {
    client_id: String,
    connect_attempts: AtomicUsize,
    /// Number of upcoming connect calls that fail before connects succeed
    connect_failures: AtomicUsize,
    subscribe_calls: Mutex<Vec<Vec<TopicSubscription>>>,
    published: Mutex<Vec<(String, Bytes, u8, bool)>>,
    disconnect_calls: AtomicUsize,
    sink: std::sync::Mutex<Option<Arc<dyn ConnectionEvents>>>,
}

impl MockSession {
    pub fn new(client_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            ..Default::default()
        }
    }

    /// Fail the next `count` connect attempts, then succeed.
    pub fn fail_next_connects(&self, count: usize) {
        self.connect_failures.store(count, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub async fn subscribe_calls(&self) -> Vec<Vec<TopicSubscription>> {
        self.subscribe_calls.lock().await.clone()
    }

    pub async fn published(&self) -> Vec<(String, Bytes, u8, bool)> {
        self.published.lock().await.clone()
    }

    pub fn sink(&self) -> Option<Arc<dyn ConnectionEvents>> {
        self.sink.lock().ok().and_then(|guard| guard.clone())
    }

    /// Deliver an inbound message through the installed sink.
    pub async fn inject_message(
        &self,
        topic: &str,
        payload: Bytes,
    ) -> Result<(), crate::dispatch::DispatchError> {
        let sink = self.sink().expect("no sink installed on mock session");
        sink.message_arrived(topic, payload).await
    }

    /// Signal an unsolicited connection loss through the installed sink.
    pub async fn inject_connection_lost(&self, cause: &str) {
        let sink = self.sink().expect("no sink installed on mock session");
        sink.connection_lost(cause.to_string()).await;
    }

    /// Signal a delivery confirmation through the installed sink.
    pub async fn inject_delivery_complete(&self, token: DeliveryToken) {
        let sink = self.sink().expect("no sink installed on mock session");
        sink.delivery_complete(token).await;
    }
}

#[async_trait]
impl Session for MockSession {
    async fn connect(&self) -> Result<(), SessionError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                (remaining > 0).then(|| remaining - 1)
            })
            .is_ok();
        if failed {
            Err(SessionError::ConnectionFailed(
                "mock connect failure".into(),
            ))
        } else {
            Ok(())
        }
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, subscriptions: &[TopicSubscription]) -> Result<(), SessionError> {
        self.subscribe_calls.lock().await.push(subscriptions.to_vec());
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: u8,
        retain: bool,
    ) -> Result<(), SessionError> {
        self.published
            .lock()
            .await
            .push((topic.to_string(), payload, qos, retain));
        Ok(())
    }

    fn client_id(&self) -> String {
        self.client_id.clone()
    }

    fn install_sink(&self, sink: Arc<dyn ConnectionEvents>) -> Result<(), SessionError> {
        let mut slot = self
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

/// Factory handing out [`MockSession`]s and keeping them reachable for event
/// injection.
#[derive(Default)]
pub struct MockSessionFactory {
    created: std::sync::Mutex<Vec<Arc<MockSession>>>,
    fail_first_connects: AtomicUsize,
}

impl MockSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every created session fails its first `count` connect attempts.
    pub fn failing_connects(count: usize) -> Self {
        let factory = Self::default();
        factory.fail_first_connects.store(count, Ordering::SeqCst);
        factory
    }

    pub fn created(&self) -> Vec<Arc<MockSession>> {
        self.created
            .lock()
            .map(|sessions| sessions.clone())
            .unwrap_or_default()
    }

    /// The most recently created session.
    pub fn last_session(&self) -> Option<Arc<MockSession>> {
        self.created().last().cloned()
    }
}

impl SessionFactory for MockSessionFactory {
    fn create(&self, definition: &ConnectionDefinition) -> Result<Arc<dyn Session>, SessionError> {
        let session = Arc::new(MockSession::new(&definition.client_id()));
        session.fail_next_connects(self.fail_first_connects.load(Ordering::SeqCst));
        if let Ok(mut created) = self.created.lock() {
            created.push(session.clone());
        }
        Ok(session)
    }
}

/// Listener that records every message and loss notification.
#[derive(Default)]
pub struct RecordingListener {
    pub messages: Arc<Mutex<Vec<(String, Bytes)>>>,
    pub losses: Arc<Mutex<Vec<String>>>,
    order_log: Option<Arc<Mutex<Vec<String>>>>,
    fail_messages: bool,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `on_message` call fails after recording.
    pub fn with_failure() -> Self {
        Self {
            fail_messages: true,
            ..Default::default()
        }
    }

    /// Share an ordering log with other recording handlers.
    pub fn with_order_log(log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            order_log: Some(log),
            ..Default::default()
        }
    }
}

#[async_trait]
impl MessageListener for RecordingListener {
    async fn on_message(&self, topic: &str, payload: Bytes) -> Result<(), HandlerError> {
        self.messages
            .lock()
            .await
            .push((topic.to_string(), payload));
        if self.fail_messages {
            Err("mock listener failure".into())
        } else {
            Ok(())
        }
    }

    async fn connection_lost(&self, cause: &str) {
        self.losses.lock().await.push(cause.to_string());
        if let Some(log) = &self.order_log {
            log.lock().await.push("listener".to_string());
        }
    }
}

/// Listener that parks inside `on_message` until released; used to hold a
/// pool worker busy.
pub struct BlockingListener {
    gate: Arc<Semaphore>,
    pub messages: Arc<Mutex<Vec<(String, Bytes)>>>,
}

impl BlockingListener {
    pub fn new() -> Self {
        Self {
            gate: Arc::new(Semaphore::new(0)),
            messages: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn release(&self, count: usize) {
        self.gate.add_permits(count);
    }
}

impl Default for BlockingListener {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageListener for BlockingListener {
    async fn on_message(&self, topic: &str, payload: Bytes) -> Result<(), HandlerError> {
        // Consume one release per message so the worker stays busy until
        // explicitly released
        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }
        self.messages
            .lock()
            .await
            .push((topic.to_string(), payload));
        Ok(())
    }
}

/// Publisher handler that records confirmations and loss notifications.
#[derive(Default)]
pub struct RecordingPublisher {
    pub tokens: Arc<Mutex<Vec<DeliveryToken>>>,
    pub losses: Arc<Mutex<Vec<String>>>,
    order_log: Option<Arc<Mutex<Vec<String>>>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share an ordering log with other recording handlers.
    pub fn with_order_log(log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            order_log: Some(log),
            ..Default::default()
        }
    }
}

#[async_trait]
impl PublishMonitor for RecordingPublisher {
    async fn delivery_complete(&self, token: DeliveryToken) {
        self.tokens.lock().await.push(token);
    }

    async fn connection_lost(&self, cause: &str) {
        self.losses.lock().await.push(cause.to_string());
        if let Some(log) = &self.order_log {
            log.lock().await.push("publisher".to_string());
        }
    }
}

/// Reject handler that records every overflow message.
#[derive(Default)]
pub struct RecordingRejectHandler {
    pub rejections: Arc<Mutex<Vec<(String, Bytes)>>>,
}

impl RecordingRejectHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RejectHandler for RecordingRejectHandler {
    async fn reject(&self, topic: &str, payload: Bytes) {
        self.rejections
            .lock()
            .await
            .push((topic.to_string(), payload));
    }
}

/// Registry wrapper recording the order of resolutions, namespaced as
/// `listener:<key>`, `publisher:<key>` and `reject:<key>`.
pub struct RecordingRegistry {
    inner: Arc<dyn HandlerRegistry>,
    pub resolutions: std::sync::Mutex<Vec<String>>,
}

impl RecordingRegistry {
    pub fn wrap(inner: Arc<dyn HandlerRegistry>) -> Self {
        Self {
            inner,
            resolutions: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn resolved(&self) -> Vec<String> {
        self.resolutions
            .lock()
            .map(|resolutions| resolutions.clone())
            .unwrap_or_default()
    }

    fn record(&self, entry: String) {
        if let Ok(mut resolutions) = self.resolutions.lock() {
            resolutions.push(entry);
        }
    }
}

impl HandlerRegistry for RecordingRegistry {
    fn listener(&self, key: &str) -> Result<Arc<dyn MessageListener>, RegistryError> {
        self.record(format!("listener:{key}"));
        self.inner.listener(key)
    }

    fn publisher(&self, key: &str) -> Result<Arc<dyn PublishMonitor>, RegistryError> {
        self.record(format!("publisher:{key}"));
        self.inner.publisher(key)
    }

    fn reject_handler(&self, key: &str) -> Result<Arc<dyn RejectHandler>, RegistryError> {
        self.record(format!("reject:{key}"));
        self.inner.reject_handler(key)
    }
}
