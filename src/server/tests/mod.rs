use std::{
    path::Path,
    time::{Duration, Instant},
};

use futures::StreamExt;
use redis::IntoConnectionInfo;

use crate::{
    messages::{
        ClientInit,
        ClientNotifyEvaluation,
        ClientNotifyModelUpdate,
        DataDescription,
        Message,
        MessageType,
        Payload,
        Ping,
        Role,
        SystemInfo,
    },
    messenger::{Inbox, MemoryTransport, MessageHandler, Transport},
    model::Weights,
    server::{AggregationStrategy, ServerCoordinator},
    settings::{
        AggregationSettings,
        BusSettings,
        ExchangeSettings,
        LivenessSettings,
        LoggingSettings,
        ModelSettings,
        RetentionSettings,
        RetrySettings,
        ServerSettings,
        StopSettings,
        StorageSettings,
        StrategyKind,
    },
    storage::{tests::retry, LocalStore, ObjectStore},
};

type TestServer = ServerCoordinator<LocalStore, MemoryTransport>;

fn settings(dir: &Path) -> ServerSettings {
    ServerSettings {
        log: LoggingSettings::default(),
        bus: BusSettings {
            url: "redis://127.0.0.1/".into_connection_info().unwrap(),
            exchange: String::from("test"),
            retry: retry(3),
        },
        storage: StorageSettings {
            root: dir.join("store"),
            ..StorageSettings::default()
        },
        model: ModelSettings {
            name: String::from("demo"),
            file_extension: String::from("bin"),
            initial_weights: None,
            cache_dir: dir.join("cache"),
        },
        aggregation: AggregationSettings {
            strategy: StrategyKind::Synchronous,
            interval_ms: 20,
            ..AggregationSettings::default()
        },
        liveness: LivenessSettings::default(),
        exchange: ExchangeSettings {
            min_performance: 0.5,
            min_epoch: 2,
        },
        retention: RetentionSettings::default(),
        transfer: retry(3),
        stop: StopSettings::default(),
    }
}

fn server(settings: ServerSettings, transport: &MemoryTransport) -> TestServer {
    let store = LocalStore::new(&settings.storage.root);
    ServerCoordinator::new(settings, store, transport.clone())
}

async fn inbox(transport: &MemoryTransport, topic: &str) -> Inbox {
    transport.subscribe(&[topic.to_string()]).await.unwrap()
}

async fn next_message(inbox: &mut Inbox) -> Message {
    let raw = tokio::time::timeout(Duration::from_secs(1), inbox.next())
        .await
        .expect("no message received")
        .expect("inbox closed");
    Message::decode(&raw).unwrap()
}

async fn next_of_type(inbox: &mut Inbox, message_type: MessageType) -> Message {
    loop {
        let message = next_message(inbox).await;
        if message.headers.message_type == message_type {
            return message;
        }
    }
}

async fn assert_silent(inbox: &mut Inbox) {
    assert!(
        tokio::time::timeout(Duration::from_millis(50), inbox.next())
            .await
            .is_err()
    );
}

fn client_init(role: Role, size: u64) -> Payload {
    ClientInit {
        role,
        system_info: SystemInfo::default(),
        data_description: DataDescription { size, qod: 0.8 },
    }
    .into()
}

async fn handshake(server: &TestServer, inbox: &mut Inbox, client_id: &str, session: &str) -> Message {
    server
        .handle(Message::new(session, client_id, client_init(Role::Trainer, 100)))
        .await;
    next_of_type(inbox, MessageType::ServerInitResponse).await
}

async fn publish_local_update(server: &TestServer, client_id: &str, value: f64, version_used: u64) {
    let remote_path = format!("clients/{}/1.bin", client_id);
    server
        .model()
        .storage()
        .upload(&remote_path, Weights(vec![vec![value]]).encode().unwrap())
        .await
        .unwrap();
    let update = ClientNotifyModelUpdate {
        remote_path,
        file_name: String::from("1.bin"),
        global_version_used: version_used,
        loss: 0.4,
        performance: 0.7,
    };
    server
        .handle(Message::new("session", client_id, update.into()))
        .await;
}

#[tokio::test]
async fn test_handshake_of_new_client() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    let server = server(settings(dir.path()), &transport);
    let mut client = inbox(&transport, "test.client.a").await;

    let response = match handshake(&server, &mut client, "a", "").await.payload {
        Payload::ServerInitResponse(response) => response,
        other => panic!("unexpected payload: {:?}", other),
    };
    assert!(!response.reconnect);
    assert!(!response.session_id.is_empty());
    assert_eq!(response.model_info.name, "demo");
    assert_eq!(response.model_info.version, 0);
    assert!(!response.model_info.downloadable);
    assert_eq!(response.model_info.global_folder, "global-models/demo");
    assert_eq!(response.model_info.file_extension, "bin");
    assert_eq!(response.exchange_at.epoch, 2);
    assert_eq!(response.exchange_at.performance, 0.5);
    assert_eq!(response.storage_info.client_folder, "clients/a");
    assert_eq!(response.learning_rate, None);

    let worker = server.registry().get("a").await.unwrap();
    assert_eq!(worker.session_id, response.session_id);
    assert_eq!(worker.data_description.size, 100);
}

#[tokio::test]
async fn test_handshake_without_client_id_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    let server = server(settings(dir.path()), &transport);
    server
        .handle(Message::new("", "", client_init(Role::Trainer, 1)))
        .await;
    assert_eq!(server.registry().len().await, 0);
}

#[tokio::test]
async fn test_reconnect_resumes_matching_session_only() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    let server = server(settings(dir.path()), &transport);
    let mut client = inbox(&transport, "test.client.a").await;

    let first = match handshake(&server, &mut client, "a", "").await.payload {
        Payload::ServerInitResponse(response) => response,
        other => panic!("unexpected payload: {:?}", other),
    };
    let second = match handshake(&server, &mut client, "a", &first.session_id)
        .await
        .payload
    {
        Payload::ServerInitResponse(response) => response,
        other => panic!("unexpected payload: {:?}", other),
    };
    assert!(second.reconnect);
    assert_eq!(second.session_id, first.session_id);

    let third = match handshake(&server, &mut client, "a", "forged").await.payload {
        Payload::ServerInitResponse(response) => response,
        other => panic!("unexpected payload: {:?}", other),
    };
    assert!(!third.reconnect);
    assert_ne!(third.session_id, first.session_id);
    assert_eq!(server.registry().len().await, 1);
}

#[tokio::test]
async fn test_handshake_announces_the_current_version() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    let mut settings = settings(dir.path());
    settings.aggregation.learning_rate.total_steps = Some(10);
    let server = server(settings, &transport);
    let store = LocalStore::new(dir.path().join("store"));
    store
        .upload("global-models/demo/3.bin", Weights(vec![vec![1.]]).encode().unwrap())
        .await
        .unwrap();
    assert_eq!(server.model().resume().await.unwrap(), 3);

    let mut client = inbox(&transport, "test.client.a").await;
    let response = match handshake(&server, &mut client, "a", "").await.payload {
        Payload::ServerInitResponse(response) => response,
        other => panic!("unexpected payload: {:?}", other),
    };
    assert_eq!(response.model_info.version, 3);
    assert!(response.model_info.downloadable);
    // clients joining at version 3 train with the rate of version 2
    assert!(response.learning_rate.is_some());
    assert_eq!(
        response.learning_rate,
        server.model().strategy().learning_rate(2)
    );
}

#[tokio::test]
async fn test_aggregation_pass() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    let server = server(settings(dir.path()), &transport);
    let mut a = inbox(&transport, "test.client.a").await;
    let mut b = inbox(&transport, "test.client.b").await;
    let mut clients = inbox(&transport, "test.clients").await;
    handshake(&server, &mut a, "a", "").await;
    handshake(&server, &mut b, "b", "").await;

    // nothing to aggregate yet
    assert!(server.aggregation_pass().await.is_none());
    assert_silent(&mut clients).await;

    publish_local_update(&server, "a", 2., 0).await;
    publish_local_update(&server, "b", 4., 0).await;
    let outcome = server.aggregation_pass().await.unwrap();
    assert_eq!(outcome.state.current_version, 1);
    assert!(server.registry().completed_workers().await.is_empty());

    let update = match next_message(&mut clients).await.payload {
        Payload::ServerNotifyModelUpdate(update) => update,
        other => panic!("unexpected payload: {:?}", other),
    };
    assert_eq!(update.version, 1);
    assert_eq!(update.chosen_ids, vec!["a", "b"]);
    assert_eq!(update.total_data_size, 200);
    assert!((update.avg_loss - 0.4).abs() < 1e-12);
    let published = server
        .model()
        .storage()
        .download("global-models/demo/1.bin")
        .await
        .unwrap();
    assert_eq!(Weights::decode(&published).unwrap(), Weights(vec![vec![3.]]));

    // every update is aggregated once
    assert!(server.aggregation_pass().await.is_none());
    assert_eq!(server.model().current_version().await, 1);
}

#[tokio::test]
async fn test_unknown_worker_update_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    let server = server(settings(dir.path()), &transport);
    publish_local_update(&server, "ghost", 1., 0).await;
    assert!(server.registry().completed_workers().await.is_empty());
    assert!(server.aggregation_pass().await.is_none());
}

#[tokio::test]
async fn test_missing_local_update_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    let mut settings = settings(dir.path());
    settings.transfer = retry(1);
    let server = server(settings, &transport);
    let mut a = inbox(&transport, "test.client.a").await;
    handshake(&server, &mut a, "a", "").await;

    let update = ClientNotifyModelUpdate {
        remote_path: String::from("clients/a/9.bin"),
        file_name: String::from("9.bin"),
        global_version_used: 0,
        loss: 0.4,
        performance: 0.7,
    };
    server.handle(Message::new("", "a", update.into())).await;

    assert!(server.aggregation_pass().await.is_none());
    assert!(server.registry().completed_workers().await.is_empty());
    assert_eq!(server.model().current_version().await, 0);
}

#[tokio::test]
async fn test_handshakes_are_answered_during_an_aggregation() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    let mut settings = settings(dir.path());
    settings.transfer = RetrySettings {
        attempts: 5,
        backoff_ms: 300,
    };
    let server = server(settings, &transport);
    let mut a = inbox(&transport, "test.client.a").await;
    let mut b = inbox(&transport, "test.client.b").await;
    handshake(&server, &mut a, "a", "").await;

    // the aggregation retries this download for more than a second
    let update = ClientNotifyModelUpdate {
        remote_path: String::from("clients/a/9.bin"),
        file_name: String::from("9.bin"),
        global_version_used: 0,
        loss: 0.4,
        performance: 0.7,
    };
    server.handle(Message::new("", "a", update.into())).await;

    let late_handshake = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let started = Instant::now();
        handshake(&server, &mut b, "b", "").await;
        started.elapsed()
    };
    let (aggregated, elapsed) = tokio::join!(server.aggregation_pass(), late_handshake);
    assert!(aggregated.is_none());
    assert!(
        elapsed < Duration::from_millis(300),
        "handshake answered after {:?}",
        elapsed
    );
}

#[tokio::test]
async fn test_pings_are_answered_once() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    let server = server(settings(dir.path()), &transport);
    let mut a = inbox(&transport, "test.client.a").await;
    handshake(&server, &mut a, "a", "").await;

    let probe = Ping {
        worker_id: String::from("a"),
        reply: false,
    };
    server
        .handle(Message::new("", "a", Payload::ClientPing(probe)))
        .await;
    match next_message(&mut a).await.payload {
        Payload::ServerPing(pong) => {
            assert_eq!(pong.worker_id, "a");
            assert!(pong.reply);
        }
        other => panic!("unexpected payload: {:?}", other),
    }

    let reply = Ping {
        worker_id: String::from("a"),
        reply: true,
    };
    server
        .handle(Message::new("", "a", Payload::ClientPing(reply)))
        .await;
    assert_silent(&mut a).await;
}

#[tokio::test]
async fn test_max_version_stops_the_federation() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    let mut settings = settings(dir.path());
    settings.stop.max_version = Some(1);
    let server = server(settings, &transport);
    let mut a = inbox(&transport, "test.client.a").await;
    let mut clients = inbox(&transport, "test.clients").await;
    handshake(&server, &mut a, "a", "").await;

    publish_local_update(&server, "a", 1., 0).await;
    server.aggregation_pass().await.unwrap();

    assert_eq!(
        next_message(&mut clients).await.headers.message_type,
        MessageType::ServerNotifyModelUpdate
    );
    assert_eq!(
        next_message(&mut clients).await.headers.message_type,
        MessageType::ServerStop
    );
    assert!(server.is_stopped());
}

#[tokio::test]
async fn test_evaluation_stops_the_federation() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    let mut settings = settings(dir.path());
    settings.stop.expected_performance = Some(0.9);
    let server = server(settings, &transport);
    let mut clients = inbox(&transport, "test.clients").await;

    let evaluation = |performance| ClientNotifyEvaluation {
        remote_path: String::from("global-models/demo/4.bin"),
        performance,
        loss: 0.1,
    };
    server
        .handle(Message::new("", "tester", evaluation(0.8).into()))
        .await;
    assert_silent(&mut clients).await;
    assert!(!server.is_stopped());

    server
        .handle(Message::new("", "tester", evaluation(0.95).into()))
        .await;
    match next_message(&mut clients).await.payload {
        Payload::ServerStop(stop) => assert!(stop.reason.contains("4.bin")),
        other => panic!("unexpected payload: {:?}", other),
    }
    assert!(server.is_stopped());
}

#[tokio::test]
async fn test_run_serves_clients_until_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    let server = server(settings(dir.path()), &transport);
    let mut a = inbox(&transport, "test.client.a").await;

    let client = async {
        // let the server subscribe
        tokio::time::sleep(Duration::from_millis(50)).await;
        let init = Message::new("", "a", client_init(Role::Tester, 0))
            .encode()
            .unwrap();
        transport.publish("test.server", init).await.unwrap();
        let response = next_of_type(&mut a, MessageType::ServerInitResponse).await;
        server.shutdown();
        response
    };
    let (served, response) = tokio::join!(server.run(), client);

    served.unwrap();
    assert_eq!(response.headers.client_id, "server");
    assert_eq!(
        server.registry().get("a").await.unwrap().role,
        Role::Tester
    );
}
