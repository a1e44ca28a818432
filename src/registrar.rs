//! Connection registration
//!
//! At startup the registrar turns each validated [`ConnectionDefinition`]
//! into a live connection: it creates the session, builds and wires the
//! lifecycle manager, installs it as the session's single callback sink and
//! only then starts the connection. The resulting map from [`ConnectionKey`]
//! to session and manager is written once here and read-only afterwards.

use crate::config::{ConnectionDefinition, ConnectionKey, PoolSpec, ReconnectionMode};
use crate::dispatch::MessageDispatcher;
use crate::error::{LinkResult, RegistrationError};
use crate::manager::ConnectionManager;
use crate::registry::HandlerRegistry;
use crate::transport::{Session, SessionFactory};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Monitoring projection of one registered connection: the definition plus
/// the runtime client identity. Not part of the dispatch path.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ClientInfo {
    pub client_id: String,
    pub uri: String,
    pub topic_filters: Vec<String>,
    pub qos: Vec<u8>,
    pub reconnection_mode: ReconnectionMode,
    pub reconnection_interval_secs: u64,
    pub pool: Option<PoolSpec>,
    pub keep_alive_secs: u64,
    pub clean_session: bool,
    pub mqtt_version: u8,
    pub connect_timeout_secs: u64,
}

struct RegisteredConnection {
    session: Arc<dyn Session>,
    manager: Arc<ConnectionManager>,
    definition: ConnectionDefinition,
}

/// Builds and owns the set of managed connections.
pub struct ConnectionRegistrar {
    registry: Arc<dyn HandlerRegistry>,
    connections: HashMap<ConnectionKey, RegisteredConnection>,
}

impl ConnectionRegistrar {
    pub fn new(registry: Arc<dyn HandlerRegistry>) -> Self {
        Self {
            registry,
            connections: HashMap::new(),
        }
    }

    /// Register one connection and start it.
    ///
    /// Wiring order within the connection is fixed: publisher before
    /// listener, `start()` only after all wiring is complete. Unknown handler
    /// keys and duplicate connection keys abort the registration; a failing
    /// initial connect does not, since the manager recovers on its own.
    pub async fn register(
        &mut self,
        definition: ConnectionDefinition,
        factory: &dyn SessionFactory,
    ) -> LinkResult<ConnectionKey> {
        definition.validate()?;
        let key = definition.key();
        if self.connections.contains_key(&key) {
            return Err(RegistrationError::DuplicateKey(key.to_string()));
        }

        let session = factory.create(&definition)?;
        let mut manager =
            ConnectionManager::new(session.clone(), definition.clone(), self.registry.clone());

        if let Some(publisher) = &definition.publisher {
            // Resolve eagerly so a bad key fails the registration, not the
            // first delivery confirmation
            self.registry.publisher(&publisher.handler)?;
            manager.wire_publisher(&publisher.handler);
        }

        if let Some(listener) = &definition.listener {
            self.registry.listener(&listener.handler)?;
            let dispatcher = match &listener.pool {
                Some(pool) => {
                    if let Some(reject_key) = &pool.reject_handler {
                        self.registry.reject_handler(reject_key)?;
                    }
                    MessageDispatcher::pooled(self.registry.clone(), &listener.handler, pool)
                }
                None => MessageDispatcher::direct(self.registry.clone(), &listener.handler),
            };
            manager.wire_listener(&listener.handler, dispatcher);
        }

        let manager = Arc::new(manager);
        session.install_sink(manager.clone())?;
        manager.start().await;

        info!("Registered connection {}", key);
        self.connections.insert(
            key.clone(),
            RegisteredConnection {
                session,
                manager,
                definition,
            },
        );
        Ok(key)
    }

    /// Register every definition. Order across distinct keys carries no
    /// meaning; the first failure aborts.
    pub async fn register_all(
        &mut self,
        definitions: Vec<ConnectionDefinition>,
        factory: &dyn SessionFactory,
    ) -> LinkResult<Vec<ConnectionKey>> {
        let mut keys = Vec::with_capacity(definitions.len());
        for definition in definitions {
            keys.push(self.register(definition, factory).await?);
        }
        Ok(keys)
    }

    /// Physical connection handle for outbound publish operations.
    pub fn session(&self, key: &ConnectionKey) -> Option<Arc<dyn Session>> {
        self.connections
            .get(key)
            .map(|connection| connection.session.clone())
    }

    pub fn manager(&self, key: &ConnectionKey) -> Option<Arc<ConnectionManager>> {
        self.connections
            .get(key)
            .map(|connection| connection.manager.clone())
    }

    pub fn keys(&self) -> impl Iterator<Item = &ConnectionKey> {
        self.connections.keys()
    }

    pub fn client_info(&self, key: &ConnectionKey) -> Option<ClientInfo> {
        self.connections.get(key).map(project_client_info)
    }

    pub fn client_infos(&self) -> Vec<ClientInfo> {
        self.connections.values().map(project_client_info).collect()
    }

    /// Cancel reconnect timers and disconnect every session. Disconnect
    /// failures are logged, not propagated.
    pub async fn shutdown(&mut self) {
        for (key, connection) in self.connections.drain() {
            connection.manager.cancel_reconnect().await;
            if let Err(error) = connection.session.disconnect().await {
                warn!("Error disconnecting {}: {}", key, error);
            } else {
                info!("Disconnected {}", key);
            }
        }
    }
}

fn project_client_info(connection: &RegisteredConnection) -> ClientInfo {
    let definition = &connection.definition;
    let (topic_filters, qos) = definition
        .listener
        .as_ref()
        .map(|listener| (listener.topics.clone(), listener.qos.clone()))
        .unwrap_or_default();
    ClientInfo {
        client_id: connection.session.client_id(),
        uri: definition.uri.clone(),
        topic_filters,
        qos,
        reconnection_mode: definition.reconnection.mode,
        reconnection_interval_secs: definition.reconnection.interval_secs,
        pool: definition
            .listener
            .as_ref()
            .and_then(|listener| listener.pool.clone()),
        keep_alive_secs: definition.keep_alive_secs,
        clean_session: definition.clean_session,
        mqtt_version: definition.mqtt_version,
        connect_timeout_secs: definition.connect_timeout_secs,
    }
}
