use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    time::Duration,
};

use anyhow::anyhow;
use futures::StreamExt;
use redis::IntoConnectionInfo;

use super::{
    Adoption,
    ClientCoordinator,
    ClientPhase,
    ClientProfile,
    JsonProfileStore,
    ProfileStore,
};
use crate::{
    messages::{
        ExchangeThresholds,
        Message,
        MessageType,
        ModelInfo,
        Payload,
        Ping,
        Role,
        ServerInitResponse,
        ServerNotifyModelUpdate,
        ServerStop,
        StorageInfo,
    },
    messenger::{Identity, Inbox, MemoryTransport, MessageHandler, Messenger, Route, Transport},
    model::{Metrics, ModelAdapter, ModelError, Weights},
    settings::{
        BusSettings,
        ClientIdentitySettings,
        ClientRetentionSettings,
        ClientSettings,
        DatasetSettings,
        LearningRateSettings,
        LoggingSettings,
        TrainingSettings,
    },
    storage::{
        tests::retry,
        BackendConnector,
        LocalStore,
        MockObjectStore,
        ObjectStore,
        StorageConnector,
        StorageKind,
        StorageResult,
    },
};

/// A model whose weights grow by one per epoch.
#[derive(Debug, Clone, Default)]
struct Counter {
    weights: Weights,
    loaded: Arc<Mutex<Vec<Weights>>>,
    learning_rates: Arc<Mutex<Vec<f64>>>,
    performance: f64,
    /// If set, every epoch waits for a permit. Dropping the sender opens the gate for good.
    gate: Option<Arc<Mutex<mpsc::Receiver<()>>>>,
    /// Epochs which panic. Counted from 1.
    panics_at: Vec<usize>,
}

impl Counter {
    fn new(performance: f64) -> Self {
        Self {
            performance,
            ..Self::default()
        }
    }
}

impl ModelAdapter for Counter {
    fn weights(&self) -> Weights {
        self.weights.clone()
    }

    fn set_weights(&mut self, weights: Weights) -> Result<(), ModelError> {
        self.loaded.lock().unwrap().push(weights.clone());
        self.weights = weights;
        Ok(())
    }

    fn train_epoch(&mut self, learning_rate: f64) -> Result<Metrics, ModelError> {
        if let Some(gate) = &self.gate {
            let _ = gate.lock().unwrap().recv();
        }
        let epoch = {
            let mut learning_rates = self.learning_rates.lock().unwrap();
            learning_rates.push(learning_rate);
            learning_rates.len()
        };
        if self.panics_at.contains(&epoch) {
            panic!("diverged in epoch {}", epoch);
        }
        for layer in self.weights.0.iter_mut() {
            for weight in layer.iter_mut() {
                *weight += 1.;
            }
        }
        Ok(Metrics {
            performance: self.performance,
            loss: 1. - self.performance,
        })
    }

    fn evaluate(&mut self) -> Result<Metrics, ModelError> {
        Ok(Metrics {
            performance: 0.9,
            loss: 0.1,
        })
    }
}

/// Hands out a prepared store on the first connection.
struct MockConnector(Mutex<Option<MockObjectStore>>);

impl StorageConnector for MockConnector {
    type Store = MockObjectStore;

    fn connect(&self, _info: &StorageInfo) -> StorageResult<MockObjectStore> {
        self.0
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow!("connected twice"))
    }
}

type TestClient = ClientCoordinator<BackendConnector, MemoryTransport, Counter>;

fn settings(dir: &Path, client_id: &str, role: Role) -> ClientSettings {
    ClientSettings {
        log: LoggingSettings::default(),
        bus: BusSettings {
            url: "redis://127.0.0.1/".into_connection_info().unwrap(),
            exchange: String::from("test"),
            retry: retry(3),
        },
        client: ClientIdentitySettings {
            client_id: Some(client_id.to_string()),
            role,
            working_dir: working_dir(dir, client_id),
        },
        dataset: DatasetSettings { size: 100, qod: 0.9 },
        transfer: retry(3),
        retention: ClientRetentionSettings::default(),
        training: TrainingSettings {
            max_local_epochs: Some(2),
            publish_interval_ms: 20,
            init_retry_secs: 1,
        },
        learning_rate: LearningRateSettings::default(),
    }
}

fn working_dir(dir: &Path, client_id: &str) -> PathBuf {
    dir.join("work").join(client_id)
}

async fn client(
    settings: ClientSettings,
    transport: &MemoryTransport,
    model: Counter,
) -> Arc<TestClient> {
    let profiles = JsonProfileStore::in_dir(&settings.client.working_dir);
    Arc::new(
        ClientCoordinator::new(settings, BackendConnector, transport.clone(), model, profiles)
            .await,
    )
}

fn store(dir: &Path) -> LocalStore {
    LocalStore::new(dir.join("store"))
}

async fn publish_global(dir: &Path, version: u64, value: f64) {
    store(dir)
        .upload(
            &format!("global-models/demo/{}.bin", version),
            Weights(vec![vec![value]]).encode().unwrap(),
        )
        .await
        .unwrap();
}

fn init_response(
    dir: &Path,
    client_id: &str,
    version: u64,
    learning_rate: Option<f64>,
) -> Message {
    let response = ServerInitResponse {
        session_id: String::from("session-1"),
        reconnect: false,
        model_info: ModelInfo {
            name: String::from("demo"),
            version,
            global_folder: String::from("global-models/demo"),
            file_extension: String::from("bin"),
            downloadable: version > 0,
        },
        exchange_at: ExchangeThresholds {
            performance: 0.5,
            epoch: 1,
        },
        storage_info: StorageInfo {
            kind: StorageKind::Local,
            location: dir.join("store").display().to_string(),
            region: None,
            endpoint: None,
            access_key: None,
            secret_access_key: None,
            client_folder: format!("clients/{}", client_id),
        },
        learning_rate,
    };
    Message::new("server-session", "server", response.into())
}

fn model_update(version: u64, chosen_ids: &[&str], learning_rate: Option<f64>) -> Message {
    let update = ServerNotifyModelUpdate {
        version,
        chosen_ids: chosen_ids.iter().map(|id| id.to_string()).collect(),
        learning_rate,
        avg_loss: 0.3,
        avg_qod: 0.8,
        total_data_size: 300,
    };
    Message::new("server-session", "server", update.into())
}

async fn server_inbox(transport: &MemoryTransport) -> Inbox {
    transport
        .subscribe(&[String::from("test.server")])
        .await
        .unwrap()
}

async fn next_of_type(inbox: &mut Inbox, message_type: MessageType) -> Message {
    loop {
        let raw = tokio::time::timeout(Duration::from_secs(5), inbox.next())
            .await
            .expect("no message received")
            .expect("inbox closed");
        let message = Message::decode(&raw).unwrap();
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

async fn wait_for_training(client: &TestClient) {
    for _ in 0..200 {
        if !client.is_training() && client.phase() != ClientPhase::Training {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("training did not finish");
}

#[tokio::test]
async fn test_adopts_the_announced_version() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    publish_global(dir.path(), 3, 3.).await;
    let model = Counter::new(0.8);
    let loaded = model.loaded.clone();
    let client = client(settings(dir.path(), "a", Role::Trainer), &transport, model).await;

    client.handle(init_response(dir.path(), "a", 3, None)).await;
    assert!(client.is_connected());
    assert_eq!(client.adopted_version().await, 3);
    assert_eq!(client.messenger().identity().await.session_id, "session-1");
    assert!(working_dir(dir.path(), "a").join("global/3.bin").is_file());

    let profile = JsonProfileStore::in_dir(&working_dir(dir.path(), "a"))
        .load()
        .await
        .unwrap();
    assert_eq!(profile.last_global_version, 3);
    assert_eq!(profile.client_id, "a");
    assert_eq!(profile.session_id, "session-1");
    assert_eq!(profile.global_model_name, "demo");

    wait_for_training(&client).await;
    assert_eq!(*loaded.lock().unwrap(), vec![Weights(vec![vec![3.]])]);
    assert_eq!(client.local_epoch().await, 2);
    assert_eq!(client.phase(), ClientPhase::Idle);

    let pending = client.pending().latest().unwrap();
    assert!(pending.has_unpublished);
    assert_eq!(pending.global_version_used, 3);
    assert_eq!(pending.local_epoch, 2);
    assert_eq!(pending.weights, Weights(vec![vec![5.]]));
    assert_eq!(pending.remote_path, "clients/a/2.bin");
}

#[tokio::test]
async fn test_missing_global_model_keeps_the_client_idle() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    let client = client(
        settings(dir.path(), "a", Role::Trainer),
        &transport,
        Counter::new(0.8),
    )
    .await;

    client.handle(init_response(dir.path(), "a", 3, None)).await;
    assert!(client.is_connected());
    assert_eq!(client.adopted_version().await, 0);
    assert!(!client.is_training());
    assert_eq!(client.phase(), ClientPhase::Idle);
    assert!(JsonProfileStore::in_dir(&working_dir(dir.path(), "a"))
        .load()
        .await
        .is_none());
}

#[tokio::test]
async fn test_repeated_init_response_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    publish_global(dir.path(), 1, 1.).await;
    publish_global(dir.path(), 2, 2.).await;
    let client = client(
        settings(dir.path(), "a", Role::Trainer),
        &transport,
        Counter::new(0.8),
    )
    .await;

    client.handle(init_response(dir.path(), "a", 1, None)).await;
    client.handle(init_response(dir.path(), "a", 2, None)).await;
    assert_eq!(client.adopted_version().await, 1);
}

#[tokio::test]
async fn test_chosen_lists() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    for version in 1..=3 {
        publish_global(dir.path(), version, version as f64).await;
    }
    let client = client(
        settings(dir.path(), "a", Role::Trainer),
        &transport,
        Counter::new(0.8),
    )
    .await;
    client.handle(init_response(dir.path(), "a", 1, None)).await;

    client.handle(model_update(2, &["b"], None)).await;
    assert_eq!(client.adopted_version().await, 1);

    client.handle(model_update(2, &[], None)).await;
    assert_eq!(client.adopted_version().await, 2);

    client.handle(model_update(3, &["b", "a"], None)).await;
    assert_eq!(client.adopted_version().await, 3);

    let summary = client.global_summary().await;
    assert_eq!(summary.total_data_size, 300);
    assert_eq!(summary.avg_qod, 0.8);
    wait_for_training(&client).await;
}

#[tokio::test]
async fn test_testers_ignore_chosen_lists() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    publish_global(dir.path(), 1, 1.).await;
    let client = client(
        settings(dir.path(), "t", Role::Tester),
        &transport,
        Counter::new(0.8),
    )
    .await;
    client.handle(init_response(dir.path(), "t", 0, None)).await;

    client.handle(model_update(1, &["a"], None)).await;
    assert_eq!(client.adopted_version().await, 1);
}

#[tokio::test]
async fn test_adopted_version_never_decreases() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    for version in 1..=3 {
        publish_global(dir.path(), version, version as f64).await;
    }
    let client = client(
        settings(dir.path(), "a", Role::Trainer),
        &transport,
        Counter::new(0.8),
    )
    .await;
    client.handle(init_response(dir.path(), "a", 0, None)).await;

    assert_eq!(client.adopt(3, None).await, Adoption::Adopted);
    assert_eq!(client.adopt(2, None).await, Adoption::Stale);
    assert_eq!(client.adopt(3, None).await, Adoption::AlreadyCurrent);
    client.handle(model_update(1, &[], None)).await;
    assert_eq!(client.adopted_version().await, 3);
    assert_eq!(client.adopt(4, None).await, Adoption::Missing);
    assert_eq!(client.adopted_version().await, 3);
    wait_for_training(&client).await;
}

async fn wait_for_pending_epoch(client: &TestClient, local_epoch: u64) {
    for _ in 0..200 {
        if matches!(client.pending().latest(), Some(update) if update.local_epoch >= local_epoch) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no local update of epoch {}", local_epoch);
}

#[tokio::test]
async fn test_training_restarts_from_a_newer_version() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    publish_global(dir.path(), 1, 1.).await;
    publish_global(dir.path(), 2, 10.).await;
    let (permits, gate) = mpsc::channel();
    let model = Counter {
        gate: Some(Arc::new(Mutex::new(gate))),
        ..Counter::new(0.8)
    };
    let loaded = model.loaded.clone();
    let mut settings = settings(dir.path(), "a", Role::Trainer);
    settings.training.max_local_epochs = Some(3);
    let client = client(settings, &transport, model).await;

    client.handle(init_response(dir.path(), "a", 1, None)).await;
    permits.send(()).unwrap();
    wait_for_pending_epoch(&client, 1).await;
    assert!(client.is_training());
    assert_eq!(client.pending().latest().unwrap().global_version_used, 1);

    // adopted while the second epoch waits for its permit
    client.handle(model_update(2, &[], None)).await;
    assert_eq!(client.adopted_version().await, 2);
    drop(permits);
    wait_for_training(&client).await;

    assert_eq!(
        *loaded.lock().unwrap(),
        vec![Weights(vec![vec![1.]]), Weights(vec![vec![10.]])]
    );
    let pending = client.pending().latest().unwrap();
    assert_eq!(pending.global_version_used, 2);
    assert_eq!(pending.weights, Weights(vec![vec![13.]]));
    assert_eq!(pending.local_epoch, client.local_epoch().await);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_adoptions_keep_the_newest_version() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    let mut store = MockObjectStore::new();
    store.expect_exists().returning(|_| Ok(true));
    let attempts = Arc::new(Mutex::new(0));
    let counted = attempts.clone();
    // version 2 is never downloaded
    store
        .expect_download()
        .withf(|key| key == "global-models/demo/3.bin")
        .times(2)
        .returning(move |_| {
            let mut attempts = counted.lock().unwrap();
            *attempts += 1;
            if *attempts < 2 {
                Err(anyhow!("connection reset"))
            } else {
                Ok(Weights(vec![vec![3.]]).encode().unwrap())
            }
        });
    let client = mock_client(settings(dir.path(), "a", Role::Trainer), store, &transport).await;
    client.handle(init_response(dir.path(), "a", 0, None)).await;
    assert!(client.is_connected());

    // the download of version 3 is still retrying when version 2 arrives
    let (newer, older) = tokio::join!(client.adopt(3, None), client.adopt(2, None));
    assert_eq!(newer, Adoption::Adopted);
    assert_eq!(older, Adoption::Stale);
    assert_eq!(client.adopted_version().await, 3);

    let cached = tokio::fs::read(working_dir(dir.path(), "a").join("global/3.bin"))
        .await
        .unwrap();
    assert_eq!(Weights::decode(&cached).unwrap(), Weights(vec![vec![3.]]));
    assert!(!working_dir(dir.path(), "a").join("global/2.bin").exists());
}

#[tokio::test]
async fn test_training_recovers_from_a_panicking_model() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    publish_global(dir.path(), 1, 1.).await;
    publish_global(dir.path(), 2, 2.).await;
    let model = Counter {
        panics_at: vec![1],
        ..Counter::new(0.8)
    };
    let client = client(settings(dir.path(), "a", Role::Trainer), &transport, model).await;

    client.handle(init_response(dir.path(), "a", 1, None)).await;
    wait_for_training(&client).await;
    assert_eq!(client.phase(), ClientPhase::Idle);
    assert!(client.pending().latest().is_none());

    client.handle(model_update(2, &[], None)).await;
    wait_for_training(&client).await;
    let pending = client.pending().latest().unwrap();
    assert_eq!(pending.global_version_used, 2);
    assert_eq!(pending.weights, Weights(vec![vec![4.]]));
}

#[tokio::test]
async fn test_adoption_before_handshake_fails() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    publish_global(dir.path(), 1, 1.).await;
    let client = client(
        settings(dir.path(), "a", Role::Trainer),
        &transport,
        Counter::new(0.8),
    )
    .await;

    client.handle(model_update(1, &[], None)).await;
    assert_eq!(client.adopted_version().await, 0);
    assert_eq!(client.adopt(1, None).await, Adoption::Failed);
}

async fn mock_client(
    settings: ClientSettings,
    store: MockObjectStore,
    transport: &MemoryTransport,
) -> Arc<ClientCoordinator<MockConnector, MemoryTransport, Counter>> {
    let connector = MockConnector(Mutex::new(Some(store)));
    let profiles = JsonProfileStore::in_dir(&settings.client.working_dir);
    Arc::new(
        ClientCoordinator::new(
            settings,
            connector,
            transport.clone(),
            Counter::new(0.8),
            profiles,
        )
        .await,
    )
}

#[tokio::test(start_paused = true)]
async fn test_download_recovers_from_transient_failures() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    let mut store = MockObjectStore::new();
    store.expect_exists().returning(|_| Ok(true));
    let attempts = Arc::new(Mutex::new(0));
    let counted = attempts.clone();
    store
        .expect_download()
        .withf(|key| key == "global-models/demo/3.bin")
        .returning(move |_| {
            let mut attempts = counted.lock().unwrap();
            *attempts += 1;
            if *attempts < 3 {
                Err(anyhow!("connection reset"))
            } else {
                Ok(Weights(vec![vec![3.]]).encode().unwrap())
            }
        });
    let mut settings = settings(dir.path(), "a", Role::Tester);
    settings.transfer = retry(4);
    let client = mock_client(settings, store, &transport).await;

    client.handle(init_response(dir.path(), "a", 3, None)).await;
    assert_eq!(*attempts.lock().unwrap(), 3);
    assert_eq!(client.adopted_version().await, 3);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_download_keeps_the_version() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    let mut store = MockObjectStore::new();
    store.expect_exists().returning(|_| Ok(true));
    store
        .expect_download()
        .times(4)
        .returning(|_| Err(anyhow!("connection reset")));
    let mut settings = settings(dir.path(), "a", Role::Trainer);
    settings.transfer = retry(4);
    let client = mock_client(settings, store, &transport).await;

    client.handle(init_response(dir.path(), "a", 3, None)).await;
    assert_eq!(client.adopted_version().await, 0);
    assert!(!client.is_training());
}

#[tokio::test]
async fn test_exchange_thresholds() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    publish_global(dir.path(), 1, 1.).await;

    // the training performance stays below the threshold of 0.5
    let client = client(
        settings(dir.path(), "a", Role::Trainer),
        &transport,
        Counter::new(0.2),
    )
    .await;
    client.handle(init_response(dir.path(), "a", 1, None)).await;
    wait_for_training(&client).await;
    assert_eq!(client.local_epoch().await, 2);
    assert!(client.pending().latest().is_none());
}

#[tokio::test]
async fn test_learning_rates() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    publish_global(dir.path(), 1, 1.).await;
    publish_global(dir.path(), 2, 2.).await;
    let model = Counter::new(0.8);
    let learning_rates = model.learning_rates.clone();
    let client = client(settings(dir.path(), "a", Role::Trainer), &transport, model).await;

    // no managed rate: the configured one
    client.handle(init_response(dir.path(), "a", 1, None)).await;
    wait_for_training(&client).await;
    client.handle(model_update(2, &[], Some(0.05))).await;
    wait_for_training(&client).await;

    assert_eq!(*learning_rates.lock().unwrap(), vec![0.01, 0.01, 0.05, 0.05]);
}

#[tokio::test]
async fn test_publishes_the_pending_update() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    let mut server = server_inbox(&transport).await;
    publish_global(dir.path(), 1, 1.).await;
    let client = client(
        settings(dir.path(), "a", Role::Trainer),
        &transport,
        Counter::new(0.8),
    )
    .await;
    client.handle(init_response(dir.path(), "a", 1, None)).await;
    wait_for_training(&client).await;

    client.publish_pending().await;
    let message = next_of_type(&mut server, MessageType::ClientNotifyModelUpdate).await;
    assert_eq!(message.headers.client_id, "a");
    assert_eq!(message.headers.session_id, "session-1");
    let update = match message.payload {
        Payload::ClientNotifyModelUpdate(update) => update,
        other => panic!("unexpected payload: {:?}", other),
    };
    assert_eq!(update.remote_path, "clients/a/2.bin");
    assert_eq!(update.file_name, "2.bin");
    assert_eq!(update.global_version_used, 1);
    assert_eq!(update.performance, 0.8);

    let uploaded = store(dir.path()).download("clients/a/2.bin").await.unwrap();
    assert_eq!(Weights::decode(&uploaded).unwrap(), Weights(vec![vec![3.]]));
    assert!(working_dir(dir.path(), "a").join("local/2.bin").is_file());
    assert!(!client.pending().has_unpublished());

    let profile = JsonProfileStore::in_dir(&working_dir(dir.path(), "a"))
        .load()
        .await
        .unwrap();
    assert_eq!(profile.local_epoch, 2);

    // nothing left to publish
    client.publish_pending().await;
    assert_silent(&mut server).await;
}

#[tokio::test]
async fn test_testers_report_evaluations() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    let mut server = server_inbox(&transport).await;
    publish_global(dir.path(), 2, 2.).await;
    let model = Counter::new(0.8);
    let loaded = model.loaded.clone();
    let client = client(settings(dir.path(), "t", Role::Tester), &transport, model).await;

    client.handle(init_response(dir.path(), "t", 2, None)).await;
    let evaluation = match next_of_type(&mut server, MessageType::ClientNotifyEvaluation)
        .await
        .payload
    {
        Payload::ClientNotifyEvaluation(evaluation) => evaluation,
        other => panic!("unexpected payload: {:?}", other),
    };
    assert_eq!(evaluation.remote_path, "global-models/demo/2.bin");
    assert_eq!(evaluation.performance, 0.9);
    assert_eq!(evaluation.loss, 0.1);
    assert_eq!(*loaded.lock().unwrap(), vec![Weights(vec![vec![2.]])]);
    assert!(!client.is_training());
    assert_eq!(client.phase(), ClientPhase::Idle);
}

#[tokio::test]
async fn test_pings() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    let mut server = server_inbox(&transport).await;
    let client = client(
        settings(dir.path(), "a", Role::Trainer),
        &transport,
        Counter::new(0.8),
    )
    .await;
    let ping = |worker_id: &str, reply: bool| {
        Message::new(
            "server-session",
            "server",
            Payload::ServerPing(Ping {
                worker_id: worker_id.to_string(),
                reply,
            }),
        )
    };

    client.handle(ping("b", false)).await;
    client.handle(ping("a", true)).await;
    assert_silent(&mut server).await;

    client.handle(ping("a", false)).await;
    let pong = next_of_type(&mut server, MessageType::ClientPing).await;
    assert_eq!(
        pong.payload,
        Payload::ClientPing(Ping {
            worker_id: String::from("a"),
            reply: true,
        })
    );
}

#[tokio::test]
async fn test_stop() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    let client = client(
        settings(dir.path(), "a", Role::Trainer),
        &transport,
        Counter::new(0.8),
    )
    .await;
    let mut phases = client.phases();

    let stop = ServerStop {
        reason: String::from("done"),
    };
    client
        .handle(Message::new("server-session", "server", stop.into()))
        .await;
    assert!(client.is_stopped());
    assert_eq!(*phases.borrow_and_update(), ClientPhase::Stopped);

    // the phase is terminal
    client.handle(init_response(dir.path(), "a", 0, None)).await;
    assert_eq!(client.phase(), ClientPhase::Stopped);
}

#[tokio::test]
async fn test_recovers_the_cached_global_model() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    let working_dir = working_dir(dir.path(), "a");
    JsonProfileStore::in_dir(&working_dir)
        .save(&ClientProfile {
            session_id: String::from("session-0"),
            client_id: String::from("a"),
            global_model_name: String::from("demo"),
            local_epoch: 7,
            last_global_version: 2,
            last_global_update_data_size: 200,
            ..ClientProfile::default()
        })
        .await
        .unwrap();
    // cached locally, gone from the store
    tokio::fs::create_dir_all(working_dir.join("global"))
        .await
        .unwrap();
    tokio::fs::write(
        working_dir.join("global/2.bin"),
        Weights(vec![vec![2.]]).encode().unwrap(),
    )
    .await
    .unwrap();

    let model = Counter::new(0.8);
    let loaded = model.loaded.clone();
    let client = client(settings(dir.path(), "a", Role::Trainer), &transport, model).await;
    assert_eq!(client.messenger().identity().await.session_id, "session-0");
    assert_eq!(client.local_epoch().await, 7);

    client.handle(init_response(dir.path(), "a", 2, None)).await;
    assert_eq!(client.adopted_version().await, 2);
    assert_eq!(client.global_summary().await.total_data_size, 200);
    wait_for_training(&client).await;
    assert_eq!(*loaded.lock().unwrap(), vec![Weights(vec![vec![2.]])]);
    assert_eq!(client.local_epoch().await, 9);
}

#[tokio::test]
async fn test_uncached_global_model_is_not_recovered() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    JsonProfileStore::in_dir(&working_dir(dir.path(), "a"))
        .save(&ClientProfile {
            client_id: String::from("a"),
            global_model_name: String::from("demo"),
            last_global_version: 2,
            ..ClientProfile::default()
        })
        .await
        .unwrap();

    let client = client(
        settings(dir.path(), "a", Role::Trainer),
        &transport,
        Counter::new(0.8),
    )
    .await;
    client.handle(init_response(dir.path(), "a", 2, None)).await;
    assert_eq!(client.adopted_version().await, 0);
    assert!(!client.is_training());
}

#[tokio::test]
async fn test_profile_of_another_client_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    JsonProfileStore::in_dir(&working_dir(dir.path(), "a"))
        .save(&ClientProfile {
            session_id: String::from("session-of-b"),
            client_id: String::from("b"),
            local_epoch: 7,
            ..ClientProfile::default()
        })
        .await
        .unwrap();

    let client = client(
        settings(dir.path(), "a", Role::Trainer),
        &transport,
        Counter::new(0.8),
    )
    .await;
    assert_eq!(client.client_id(), "a");
    assert_eq!(client.local_epoch().await, 0);
    assert_eq!(client.messenger().identity().await.session_id, "");
}

#[tokio::test]
async fn test_client_id_of_the_profile_is_reused() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    let anonymous = || {
        let mut settings = settings(dir.path(), "a", Role::Trainer);
        settings.client.client_id = None;
        settings
    };

    let first = client(anonymous(), &transport, Counter::new(0.8)).await;
    assert!(!first.client_id().is_empty());
    publish_global(dir.path(), 1, 1.).await;
    first
        .handle(init_response(dir.path(), first.client_id(), 1, None))
        .await;
    wait_for_training(&first).await;

    let second = client(anonymous(), &transport, Counter::new(0.8)).await;
    assert_eq!(second.client_id(), first.client_id());
}

#[tokio::test(start_paused = true)]
async fn test_handshake_is_repeated_until_answered() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    let mut server = server_inbox(&transport).await;
    let client = client(
        settings(dir.path(), "a", Role::Trainer),
        &transport,
        Counter::new(0.8),
    )
    .await;
    let running = {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    };

    let first = next_of_type(&mut server, MessageType::ClientInit).await;
    assert_eq!(first.headers.client_id, "a");
    next_of_type(&mut server, MessageType::ClientInit).await;
    assert_eq!(client.phase(), ClientPhase::AwaitingInitResponse);

    let responder = Messenger::new(
        transport.clone(),
        "test",
        Identity::new("server-session", "server"),
        retry(3),
    );
    responder
        .send(
            Route::Client(String::from("a")),
            match init_response(dir.path(), "a", 0, None).payload {
                Payload::ServerInitResponse(response) => response,
                other => panic!("unexpected payload: {:?}", other),
            },
        )
        .await
        .unwrap();
    for _ in 0..100 {
        if client.is_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(client.is_connected());
    assert_eq!(client.phase(), ClientPhase::Idle);

    // no more handshakes once connected
    tokio::time::sleep(Duration::from_secs(3)).await;
    while let Ok(Some(raw)) = tokio::time::timeout(Duration::from_millis(10), server.next()).await {
        let message = Message::decode(&raw).unwrap();
        assert_ne!(message.headers.message_type, MessageType::ClientInit);
    }

    client.shutdown();
    assert!(running.await.unwrap().is_ok());
}
