//! Registration tests: wiring order, fail-fast key resolution, duplicate
//! detection, monitoring projection and shutdown.

use brokerlink::config::{
    ConnectionDefinition, ConnectionKey, ConnectionsConfig, ListenerSpec, PoolSpec, PublisherSpec,
    ReconnectionMode, ReconnectionPolicy,
};
use brokerlink::error::RegistrationError;
use brokerlink::manager::LinkState;
use brokerlink::registrar::ConnectionRegistrar;
use brokerlink::registry::StaticRegistry;
use brokerlink::testing::{
    MockSessionFactory, RecordingListener, RecordingPublisher, RecordingRegistry,
    RecordingRejectHandler,
};
use brokerlink::transport::TopicSubscription;
use std::sync::Arc;

fn full_definition() -> ConnectionDefinition {
    ConnectionDefinition {
        name: "telemetry".to_string(),
        qualifier: Some("prod".to_string()),
        client_id: None,
        uri: "tcp://broker.example.com:1883".to_string(),
        keep_alive_secs: 30,
        clean_session: false,
        mqtt_version: 4,
        connect_timeout_secs: 10,
        username_env: None,
        password_env: None,
        reconnection: ReconnectionPolicy {
            mode: ReconnectionMode::Automatic,
            interval_secs: 5,
        },
        listener: Some(ListenerSpec {
            topics: vec![
                "sensors/+/temperature".to_string(),
                "sensors/+/humidity".to_string(),
            ],
            qos: vec![1, 0],
            handler: "telemetry-listener".to_string(),
            pool: Some(PoolSpec {
                core_workers: 1,
                max_workers: 4,
                queue_capacity: 16,
                reject_handler: Some("telemetry-overflow".to_string()),
            }),
        }),
        publisher: Some(PublisherSpec {
            handler: "delivery-monitor".to_string(),
        }),
    }
}

fn full_registry() -> StaticRegistry {
    StaticRegistry::new()
        .with_listener("telemetry-listener", Arc::new(RecordingListener::new()))
        .with_publisher("delivery-monitor", Arc::new(RecordingPublisher::new()))
        .with_reject_handler("telemetry-overflow", Arc::new(RecordingRejectHandler::new()))
}

#[tokio::test]
async fn test_register_connects_subscribes_and_installs_sink() {
    let factory = MockSessionFactory::new();
    let mut registrar = ConnectionRegistrar::new(Arc::new(full_registry()));

    let key = registrar.register(full_definition(), &factory).await.unwrap();
    assert_eq!(key.to_string(), "telemetry.prod");

    let session = factory.last_session().unwrap();
    assert_eq!(session.connect_attempts(), 1);
    assert!(session.sink().is_some());
    assert_eq!(
        session.subscribe_calls().await,
        vec![vec![
            TopicSubscription {
                filter: "sensors/+/temperature".to_string(),
                qos: 1,
            },
            TopicSubscription {
                filter: "sensors/+/humidity".to_string(),
                qos: 0,
            },
        ]]
    );

    let manager = registrar.manager(&key).unwrap();
    assert_eq!(manager.state(), LinkState::Connected);
    assert_eq!(manager.client_id(), "telemetry.prod");
}

#[tokio::test]
async fn test_publisher_wired_before_listener() {
    let recording = Arc::new(RecordingRegistry::wrap(Arc::new(full_registry())));
    let factory = MockSessionFactory::new();
    let mut registrar = ConnectionRegistrar::new(recording.clone());

    registrar.register(full_definition(), &factory).await.unwrap();

    // Eager resolution order mirrors the wiring order
    let resolved = recording.resolved();
    assert_eq!(
        resolved.first().map(String::as_str),
        Some("publisher:delivery-monitor")
    );
    assert!(resolved.contains(&"listener:telemetry-listener".to_string()));
    assert!(resolved.contains(&"reject:telemetry-overflow".to_string()));
    let publisher_pos = resolved
        .iter()
        .position(|entry| entry == "publisher:delivery-monitor")
        .unwrap();
    let listener_pos = resolved
        .iter()
        .position(|entry| entry == "listener:telemetry-listener")
        .unwrap();
    assert!(publisher_pos < listener_pos);
}

#[tokio::test]
async fn test_duplicate_connection_key_rejected() {
    let factory = MockSessionFactory::new();
    let mut registrar = ConnectionRegistrar::new(Arc::new(full_registry()));

    registrar.register(full_definition(), &factory).await.unwrap();
    let result = registrar.register(full_definition(), &factory).await;

    assert!(matches!(
        result,
        Err(RegistrationError::DuplicateKey(key)) if key == "telemetry.prod"
    ));
    // Only the first registration created a session
    assert_eq!(factory.created().len(), 1);
}

#[tokio::test]
async fn test_unknown_listener_key_aborts_registration() {
    let registry = StaticRegistry::new()
        .with_publisher("delivery-monitor", Arc::new(RecordingPublisher::new()));
    let factory = MockSessionFactory::new();
    let mut registrar = ConnectionRegistrar::new(Arc::new(registry));

    let result = registrar.register(full_definition(), &factory).await;
    assert!(matches!(result, Err(RegistrationError::Registry(_))));

    // The failed registration left nothing behind and never connected
    let key = ConnectionKey {
        name: "telemetry".to_string(),
        qualifier: Some("prod".to_string()),
    };
    assert!(registrar.session(&key).is_none());
    assert_eq!(factory.last_session().unwrap().connect_attempts(), 0);
}

#[tokio::test]
async fn test_unknown_reject_handler_key_aborts_registration() {
    let registry = StaticRegistry::new()
        .with_listener("telemetry-listener", Arc::new(RecordingListener::new()))
        .with_publisher("delivery-monitor", Arc::new(RecordingPublisher::new()));
    let factory = MockSessionFactory::new();
    let mut registrar = ConnectionRegistrar::new(Arc::new(registry));

    let result = registrar.register(full_definition(), &factory).await;
    assert!(matches!(result, Err(RegistrationError::Registry(_))));
}

#[tokio::test]
async fn test_invalid_definition_aborts_registration() {
    let mut definition = full_definition();
    definition.listener.as_mut().unwrap().qos = vec![1];

    let factory = MockSessionFactory::new();
    let mut registrar = ConnectionRegistrar::new(Arc::new(full_registry()));

    let result = registrar.register(definition, &factory).await;
    assert!(matches!(result, Err(RegistrationError::Config(_))));
    // Validation runs before any session exists
    assert!(factory.created().is_empty());
}

#[tokio::test]
async fn test_client_info_projection() {
    let factory = MockSessionFactory::new();
    let mut registrar = ConnectionRegistrar::new(Arc::new(full_registry()));
    let key = registrar.register(full_definition(), &factory).await.unwrap();

    let info = registrar.client_info(&key).unwrap();
    assert_eq!(info.client_id, "telemetry.prod");
    assert_eq!(info.uri, "tcp://broker.example.com:1883");
    assert_eq!(
        info.topic_filters,
        vec!["sensors/+/temperature", "sensors/+/humidity"]
    );
    assert_eq!(info.qos, vec![1, 0]);
    assert_eq!(info.reconnection_mode, ReconnectionMode::Automatic);
    assert_eq!(info.reconnection_interval_secs, 5);
    assert_eq!(info.pool.as_ref().unwrap().max_workers, 4);
    assert_eq!(info.keep_alive_secs, 30);
    assert!(!info.clean_session);

    // The projection serializes for monitoring endpoints
    let json = serde_json::to_value(&info).unwrap();
    assert_eq!(json["client_id"], "telemetry.prod");
    assert_eq!(json["qos"][0], 1);
}

#[tokio::test]
async fn test_register_all_handles_multiple_connections() {
    let config: ConnectionsConfig = toml::from_str(
        r#"
[[connection]]
name = "events"
uri = "tcp://localhost:1883"

[connection.reconnection]
mode = "none"

[[connection]]
name = "events"
qualifier = "backup"
uri = "tcp://other:1883"

[connection.reconnection]
mode = "none"
"#,
    )
    .unwrap();

    let factory = MockSessionFactory::new();
    let mut registrar = ConnectionRegistrar::new(Arc::new(full_registry()));
    let keys = registrar
        .register_all(config.connections, &factory)
        .await
        .unwrap();

    assert_eq!(keys.len(), 2);
    assert_eq!(registrar.keys().count(), 2);
    assert_eq!(factory.created().len(), 2);
    assert_eq!(registrar.client_infos().len(), 2);
}

#[tokio::test]
async fn test_shutdown_disconnects_every_session() {
    let config: ConnectionsConfig = toml::from_str(
        r#"
[[connection]]
name = "a"
uri = "tcp://localhost:1883"

[[connection]]
name = "b"
uri = "tcp://localhost:1883"
"#,
    )
    .unwrap();

    let factory = MockSessionFactory::new();
    let mut registrar = ConnectionRegistrar::new(Arc::new(full_registry()));
    registrar
        .register_all(config.connections, &factory)
        .await
        .unwrap();

    registrar.shutdown().await;

    assert_eq!(registrar.keys().count(), 0);
    for session in factory.created() {
        assert_eq!(session.disconnect_calls(), 1);
    }
}

#[tokio::test]
async fn test_second_sink_install_rejected() {
    let factory = MockSessionFactory::new();
    let mut registrar = ConnectionRegistrar::new(Arc::new(full_registry()));
    let key = registrar.register(full_definition(), &factory).await.unwrap();

    // The registrar already installed the manager as the session's sink
    let session = registrar.session(&key).unwrap();
    let manager = registrar.manager(&key).unwrap();
    assert!(session.install_sink(manager).is_err());
}
