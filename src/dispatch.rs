//! Inbound message dispatch
//!
//! Decouples message arrival from listener execution. Without a pool the
//! listener runs synchronously on the calling task and its errors propagate
//! to the caller; with a pool the message becomes a unit of work admitted
//! against bounded capacity, and saturation is routed to the reject handler
//! or escalated.

use crate::config::PoolSpec;
use crate::registry::{HandlerError, HandlerRegistry, RegistryError};
use bytes::Bytes;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::warn;

/// Dispatch failures surfaced to the protocol-client driver
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Handler resolution failed: {0}")]
    Resolve(#[from] RegistryError),
    #[error("Listener failed: {0}")]
    Handler(#[source] HandlerError),
    #[error("Worker pool saturated, message on topic '{topic}' dropped")]
    Saturated { topic: String },
}

/// Bounded admission: up to `max_workers` units running, up to
/// `queue_capacity` units waiting for a worker. Submission fails only when
/// both are exhausted.
struct WorkerPool {
    permits: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    queue_capacity: usize,
}

impl WorkerPool {
    fn new(spec: &PoolSpec) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(spec.max_workers)),
            queued: Arc::new(AtomicUsize::new(0)),
            queue_capacity: spec.queue_capacity,
        }
    }

    /// Run `work` on a pool worker, or hand it back if the pool is saturated.
    fn try_submit<F>(&self, work: F) -> Result<(), F>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => {
                tokio::spawn(async move {
                    let _permit = permit;
                    work.await;
                });
                Ok(())
            }
            Err(_) => {
                let reserved = self
                    .queued
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |queued| {
                        (queued < self.queue_capacity).then_some(queued + 1)
                    })
                    .is_ok();
                if !reserved {
                    return Err(work);
                }
                let permits = self.permits.clone();
                let queued = self.queued.clone();
                tokio::spawn(async move {
                    let permit = permits.acquire_owned().await;
                    // Leaves the queue the moment a worker slot is available
                    queued.fetch_sub(1, Ordering::SeqCst);
                    if permit.is_ok() {
                        work.await;
                    }
                });
                Ok(())
            }
        }
    }
}

/// Routes one connection's inbound messages to its listener.
pub struct MessageDispatcher {
    registry: Arc<dyn HandlerRegistry>,
    listener_key: String,
    reject_key: Option<String>,
    pool: Option<WorkerPool>,
}

impl MessageDispatcher {
    /// Dispatcher that invokes the listener synchronously on the calling task.
    pub fn direct(registry: Arc<dyn HandlerRegistry>, listener_key: &str) -> Self {
        Self {
            registry,
            listener_key: listener_key.to_string(),
            reject_key: None,
            pool: None,
        }
    }

    /// Dispatcher backed by a bounded worker pool.
    pub fn pooled(registry: Arc<dyn HandlerRegistry>, listener_key: &str, spec: &PoolSpec) -> Self {
        Self {
            registry,
            listener_key: listener_key.to_string(),
            reject_key: spec.reject_handler.clone(),
            pool: Some(WorkerPool::new(spec)),
        }
    }

    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }

    /// Deliver one inbound message to the listener.
    ///
    /// Unpooled: runs the listener here; its error is the caller's. Pooled:
    /// admits the message to the pool; on saturation invokes the reject
    /// handler with the original topic and payload, or fails with
    /// [`DispatchError::Saturated`] when none is configured. Pooled execution
    /// gives no ordering guarantee; callers needing per-topic order must use
    /// a single-worker pool or none at all.
    pub async fn dispatch(&self, topic: &str, payload: Bytes) -> Result<(), DispatchError> {
        let listener = self.registry.listener(&self.listener_key)?;

        let pool = match &self.pool {
            None => {
                return listener
                    .on_message(topic, payload)
                    .await
                    .map_err(DispatchError::Handler);
            }
            Some(pool) => pool,
        };

        let work_topic = topic.to_string();
        let work_payload = payload.clone();
        let work = async move {
            // A failing worker only loses its own message
            if let Err(error) = listener.on_message(&work_topic, work_payload).await {
                warn!("Pooled listener failed for topic {}: {}", work_topic, error);
            }
        };

        match pool.try_submit(work) {
            Ok(()) => Ok(()),
            Err(_rejected) => match &self.reject_key {
                Some(key) => {
                    warn!(
                        "Worker pool saturated, routing message on topic {} to reject handler",
                        topic
                    );
                    let handler = self.registry.reject_handler(key)?;
                    handler.reject(topic, payload).await;
                    Ok(())
                }
                None => Err(DispatchError::Saturated {
                    topic: topic.to_string(),
                }),
            },
        }
    }
}
