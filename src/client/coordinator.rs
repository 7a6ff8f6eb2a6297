use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use once_cell::sync::OnceCell;
use tokio::sync::{watch, Mutex};
use tracing::Instrument;
use uuid::Uuid;

use super::{
    profile::{ClientProfile, ProfileStore},
    update::{LocalModelUpdateInfo, PendingUpdate},
    ClientError,
    ClientPhase,
};
use crate::{
    messages::{
        ClientInit,
        ClientNotifyEvaluation,
        ClientNotifyModelUpdate,
        DataDescription,
        ExchangeThresholds,
        Message,
        ModelInfo,
        Payload,
        Ping,
        Role,
        ServerInitResponse,
        ServerNotifyModelUpdate,
        ServerStop,
        SystemInfo,
    },
    messenger::{Identity, MessageHandler, Messenger, Route, Transport},
    model::{Metrics, ModelAdapter, Weights},
    schedule::LearningRateSchedule,
    settings::ClientSettings,
    storage::{
        gateway::write_file,
        join_key,
        retention::clean_dir,
        ArtifactName,
        StorageConnector,
        StorageGateway,
    },
    utils::periodic::periodically,
};

const GLOBAL_DIR: &str = "global";
const LOCAL_DIR: &str = "local";

/// The outcome of an attempt to adopt a global version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adoption {
    /// The version was downloaded and is now the baseline of the client.
    Adopted,
    /// The version is the baseline already.
    AlreadyCurrent,
    /// A newer version was adopted before.
    Stale,
    /// The artifact of the version does not exist.
    Missing,
    /// The artifact could not be downloaded.
    Failed,
}

/// The aggregate statistics announced along with a global version.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GlobalSummary {
    pub avg_loss: f64,
    pub avg_qod: f64,
    pub total_data_size: u64,
}

impl From<&ServerNotifyModelUpdate> for GlobalSummary {
    fn from(update: &ServerNotifyModelUpdate) -> Self {
        Self {
            avg_loss: update.avg_loss,
            avg_qod: update.avg_qod,
            total_data_size: update.total_data_size,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    session_id: String,
    /// The model announced in the handshake. `None` until connected.
    model: Option<ModelInfo>,
    client_folder: String,
    exchange_at: Option<ExchangeThresholds>,
    server_learning_rate: Option<f64>,
    adopted_version: u64,
    global: GlobalSummary,
    local_epoch: u64,
    /// The profile of a previous run, until the handshake tells whether it still applies.
    recovered: Option<ClientProfile>,
}

impl State {
    fn global_artifact(&self, version: u64) -> Option<(ArtifactName, String)> {
        self.model.as_ref().map(|model| {
            let name = ArtifactName::new(version, &model.file_extension);
            let key = name.key_in(&model.global_folder);
            (name, key)
        })
    }
}

/// The coordinator of a client.
///
/// It joins the federation, adopts the global versions announced by the server, trains the model on
/// top of them and publishes the local updates. Trainers keep training on the latest adopted
/// version until a newer one arrives, testers evaluate every adopted version once.
pub struct ClientCoordinator<C, T, M>
where
    C: StorageConnector,
{
    settings: ClientSettings,
    client_id: String,
    connector: C,
    storage: OnceCell<StorageGateway<C::Store>>,
    messenger: Messenger<T>,
    model: Mutex<M>,
    profiles: Box<dyn ProfileStore>,
    schedule: LearningRateSchedule,
    state: Mutex<State>,
    /// Serializes the adoptions.
    adoption: Mutex<()>,
    pending: PendingUpdate,
    connected: AtomicBool,
    training: AtomicBool,
    /// Raised when a new version is adopted, consulted by the training task after each epoch.
    restart: AtomicBool,
    phase: watch::Sender<ClientPhase>,
    shutdown: watch::Sender<bool>,
}

impl<C, T, M> ClientCoordinator<C, T, M>
where
    C: StorageConnector,
    T: Transport,
    M: ModelAdapter,
{
    /// Creates a client, recovering the state saved by a previous run.
    ///
    /// The configured client id wins over the one of the profile. A profile of another client is
    /// ignored.
    pub async fn new<P>(
        settings: ClientSettings,
        connector: C,
        transport: T,
        model: M,
        profiles: P,
    ) -> Self
    where
        P: ProfileStore,
    {
        let profile = profiles.load().await.filter(|profile| {
            let foreign = matches!(
                &settings.client.client_id,
                Some(client_id) if !profile.client_id.is_empty() && *client_id != profile.client_id
            );
            if foreign {
                warn!(
                    "ignoring the profile of client {} in {}",
                    profile.client_id,
                    settings.client.working_dir.display()
                );
            }
            !foreign
        });

        let client_id = settings
            .client
            .client_id
            .clone()
            .or_else(|| {
                profile
                    .as_ref()
                    .map(|profile| profile.client_id.clone())
                    .filter(|client_id| !client_id.is_empty())
            })
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut state = State::default();
        if let Some(profile) = profile {
            info!(
                local_epoch = profile.local_epoch,
                version = profile.last_global_version,
                "recovered the profile of a previous run"
            );
            state.session_id = profile.session_id.clone();
            state.local_epoch = profile.local_epoch;
            state.recovered = Some(profile);
        }

        let messenger = Messenger::new(
            transport,
            settings.bus.exchange.clone(),
            Identity::new(state.session_id.clone(), client_id.clone()),
            settings.bus.retry,
        );
        let (phase, _) = watch::channel(ClientPhase::Connecting);
        let (shutdown, _) = watch::channel(false);

        Self {
            schedule: LearningRateSchedule::new(&settings.learning_rate),
            settings,
            client_id,
            connector,
            storage: OnceCell::new(),
            messenger,
            model: Mutex::new(model),
            profiles: Box::new(profiles),
            state: Mutex::new(state),
            adoption: Mutex::new(()),
            pending: PendingUpdate::new(),
            connected: AtomicBool::new(false),
            training: AtomicBool::new(false),
            restart: AtomicBool::new(false),
            phase,
            shutdown,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn role(&self) -> Role {
        self.settings.client.role
    }

    pub fn messenger(&self) -> &Messenger<T> {
        &self.messenger
    }

    pub fn pending(&self) -> &PendingUpdate {
        &self.pending
    }

    pub fn phase(&self) -> ClientPhase {
        *self.phase.borrow()
    }

    /// Watches the phase of the client.
    pub fn phases(&self) -> watch::Receiver<ClientPhase> {
        self.phase.subscribe()
    }

    pub async fn adopted_version(&self) -> u64 {
        self.state.lock().await.adopted_version
    }

    pub async fn local_epoch(&self) -> u64 {
        self.state.lock().await.local_epoch
    }

    pub async fn global_summary(&self) -> GlobalSummary {
        self.state.lock().await.global
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stops every loop of the client. Training stops after the running epoch.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    fn global_dir(&self) -> PathBuf {
        self.settings.client.working_dir.join(GLOBAL_DIR)
    }

    fn local_dir(&self) -> PathBuf {
        self.settings.client.working_dir.join(LOCAL_DIR)
    }

    fn enter(&self, phase: ClientPhase) {
        self.phase.send_if_modified(|current| {
            if *current == ClientPhase::Stopped || *current == phase {
                return false;
            }
            *current = phase;
            true
        });
    }

    /// Leaves `phase` for whatever the client is still busy with.
    fn leave(&self, phase: ClientPhase) {
        let next = if self.is_training() {
            ClientPhase::Training
        } else {
            ClientPhase::Idle
        };
        self.phase.send_if_modified(|current| {
            if *current != phase || phase == next {
                return false;
            }
            *current = next;
            true
        });
    }

    /// Runs the client until the server stops it or [`shutdown`](Self::shutdown) is called.
    pub async fn run(self: &Arc<Self>) -> Result<(), ClientError> {
        let subscription = self
            .messenger
            .subscribe(&[Route::Clients, Route::Client(self.client_id.clone())])
            .await?;
        info!(
            client_id = %self.client_id,
            role = %self.role(),
            "client listening on {}",
            subscription.topics().join(", ")
        );

        let dispatch = async {
            self.messenger
                .dispatch(subscription, self, self.shutdown.subscribe())
                .await;
            self.shutdown.send_replace(true);
        };
        let handshake = periodically(
            self.settings.training.init_retry(),
            self.shutdown.subscribe(),
            move || self.send_init(),
        );
        let publication = periodically(
            self.settings.training.publish_interval(),
            self.shutdown.subscribe(),
            move || self.publish_pending(),
        );
        let retention = periodically(
            self.settings.retention.interval(),
            self.shutdown.subscribe(),
            move || self.clean_cache(),
        );

        tokio::join!(dispatch, handshake, publication, retention);
        info!("client stopped");
        Ok(())
    }

    /// Sends the handshake, unless the server answered already.
    pub(crate) async fn send_init(&self) {
        if self.is_connected() {
            return;
        }
        let init = ClientInit {
            role: self.role(),
            system_info: SystemInfo::current(),
            data_description: DataDescription {
                size: self.settings.dataset.size,
                qod: self.settings.dataset.qod,
            },
        };
        match self.messenger.send(Route::Server, init).await {
            Ok(()) => {
                self.phase.send_if_modified(|phase| {
                    let waiting = *phase == ClientPhase::Connecting;
                    if waiting {
                        *phase = ClientPhase::AwaitingInitResponse;
                    }
                    waiting
                });
                debug!("sent handshake");
            }
            Err(err) => warn!("failed to send handshake: {}", err),
        }
    }

    /// Adopts `version` as the new baseline.
    ///
    /// Versions older than the adopted one are ignored. The artifact is downloaded into the
    /// working directory, then the profile is saved.
    pub async fn adopt(&self, version: u64, announced: Option<&ServerNotifyModelUpdate>) -> Adoption {
        let _exclusive = self.adoption.lock().await;

        let (current, artifact) = {
            let state = self.state.lock().await;
            (state.adopted_version, state.global_artifact(version))
        };
        if version < current {
            debug!(version, current, "ignoring stale global model");
            return Adoption::Stale;
        }
        if version == current {
            return Adoption::AlreadyCurrent;
        }
        let ((name, key), storage) = match (artifact, self.storage.get()) {
            (Some(artifact), Some(storage)) => (artifact, storage),
            _ => {
                warn!(version, "cannot adopt a global model before the handshake");
                return Adoption::Failed;
            }
        };

        if !storage.exists(&key).await {
            info!(version, "global model {} does not exist", key);
            return Adoption::Missing;
        }
        if let Err(err) = storage
            .download_to(&key, &self.global_dir().join(name.to_string()))
            .await
        {
            warn!(version, "skipping global model: {}", err);
            return Adoption::Failed;
        }

        {
            let mut state = self.state.lock().await;
            state.adopted_version = version;
            if let Some(announced) = announced {
                state.global = announced.into();
                state.server_learning_rate = announced.learning_rate;
            }
        }
        info!(version, "adopted global model");
        self.save_profile().await;
        Adoption::Adopted
    }

    async fn save_profile(&self) {
        let profile = {
            let state = self.state.lock().await;
            ClientProfile {
                session_id: state.session_id.clone(),
                client_id: self.client_id.clone(),
                global_model_name: state
                    .model
                    .as_ref()
                    .map(|model| model.name.clone())
                    .unwrap_or_default(),
                local_epoch: state.local_epoch,
                local_qod: self.settings.dataset.qod,
                last_global_version: state.adopted_version,
                last_global_avg_loss: state.global.avg_loss,
                last_global_avg_qod: state.global.avg_qod,
                last_global_update_data_size: state.global.total_data_size,
            }
        };
        if let Err(err) = self.profiles.save(&profile).await {
            warn!("failed to save the profile: {:#}", err);
        }
    }

    async fn handle_init_response(self: &Arc<Self>, response: ServerInitResponse) {
        if self.is_connected() {
            debug!("ignoring repeated handshake response");
            return;
        }
        let store = match self.connector.connect(&response.storage_info) {
            Ok(store) => store,
            Err(err) => {
                error!("failed to open the object store: {:#}", err);
                return;
            }
        };
        if self
            .storage
            .set(StorageGateway::new(store, self.settings.transfer))
            .is_err()
        {
            debug!("object store opened already");
        }
        self.messenger
            .set_session(response.session_id.as_str())
            .await;

        let model = response.model_info;
        let recovered = self.recover(&model).await;
        {
            let mut state = self.state.lock().await;
            state.session_id = response.session_id;
            state.client_folder = response.storage_info.client_folder;
            state.exchange_at = Some(response.exchange_at);
            state.server_learning_rate = response.learning_rate;
            if let Some((version, global)) = recovered {
                state.adopted_version = version;
                state.global = global;
            }
            state.model = Some(model.clone());
        }
        self.connected.store(true, Ordering::SeqCst);
        self.enter(ClientPhase::Idle);
        info!(
            version = model.version,
            reconnect = response.reconnect,
            "joined the federation"
        );

        if model.version == 0 || !model.downloadable {
            info!("no global model to start from yet");
            return;
        }
        match self.adopt(model.version, None).await {
            Adoption::Adopted | Adoption::AlreadyCurrent => self.start_work().await,
            Adoption::Stale => debug!("keeping the newer global model of the previous run"),
            Adoption::Missing | Adoption::Failed => info!("waiting for the next global model"),
        }
    }

    /// The version and statistics of the previous run, if its global model is still cached.
    async fn recover(&self, model: &ModelInfo) -> Option<(u64, GlobalSummary)> {
        let profile = self.state.lock().await.recovered.take()?;
        if profile.last_global_version == 0 || profile.global_model_name != model.name {
            return None;
        }
        let name = ArtifactName::new(profile.last_global_version, &model.file_extension);
        let path = self.global_dir().join(name.to_string());
        if !tokio::fs::metadata(&path)
            .await
            .map_or(false, |metadata| metadata.is_file())
        {
            info!(
                version = profile.last_global_version,
                "the global model of the previous run is not cached anymore"
            );
            return None;
        }
        Some((
            profile.last_global_version,
            GlobalSummary {
                avg_loss: profile.last_global_avg_loss,
                avg_qod: profile.last_global_avg_qod,
                total_data_size: profile.last_global_update_data_size,
            },
        ))
    }

    async fn handle_model_update(self: &Arc<Self>, update: ServerNotifyModelUpdate) {
        if !self.is_connected() {
            debug!("ignoring global model announced before the handshake");
            return;
        }
        if self.role() == Role::Trainer
            && !update.chosen_ids.is_empty()
            && !update.chosen_ids.contains(&self.client_id)
        {
            debug!(version = update.version, "not chosen for the next round");
            return;
        }
        match self.adopt(update.version, Some(&update)).await {
            Adoption::Adopted => self.start_work().await,
            Adoption::AlreadyCurrent | Adoption::Stale => {}
            Adoption::Missing | Adoption::Failed => {
                info!(version = update.version, "waiting for the next global model")
            }
        }
    }

    async fn start_work(self: &Arc<Self>) {
        match self.role() {
            Role::Trainer => self.start_training(),
            Role::Tester => self.evaluate().await,
        }
    }

    fn start_training(self: &Arc<Self>) {
        self.restart.store(true, Ordering::SeqCst);
        if self.training.swap(true, Ordering::SeqCst) {
            debug!("training restarts from the new global model");
            return;
        }
        self.enter(ClientPhase::Training);
        let this = Arc::clone(self);
        let training = tokio::task::spawn_blocking(move || this.train());
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = training.await {
                error!("training aborted: {}", err);
                this.training.store(false, Ordering::SeqCst);
                this.leave(ClientPhase::Training);
            }
        });
    }

    /// The training task. Runs on the blocking thread pool.
    fn train(&self) {
        let _span = info_span!("training", client_id = %self.client_id).entered();
        loop {
            if let Err(err) = self.train_on_latest() {
                error!("training failed: {}", err);
            }
            self.training.store(false, Ordering::SeqCst);
            // a version adopted after the last check starts a new training run
            if !self.restart.load(Ordering::SeqCst)
                || self.is_stopped()
                || self.training.swap(true, Ordering::SeqCst)
            {
                break;
            }
        }
        self.leave(ClientPhase::Training);
    }

    fn train_on_latest(&self) -> Result<(), ClientError> {
        let mut baseline = 0;
        let mut epochs: u64 = 0;
        loop {
            if self.is_stopped() {
                return Ok(());
            }
            if self.restart.swap(false, Ordering::SeqCst) {
                baseline = self.load_adopted_model()?;
                epochs = 0;
                info!(version = baseline, "training from global model");
            }

            let (local_epoch, learning_rate, thresholds) = {
                let mut state = self.state.blocking_lock();
                state.local_epoch += 1;
                let learning_rate = state
                    .server_learning_rate
                    .or_else(|| self.schedule.rate(state.local_epoch - 1))
                    .unwrap_or(self.settings.learning_rate.initial);
                (state.local_epoch, learning_rate, state.exchange_at)
            };
            let metrics = self
                .model
                .blocking_lock()
                .train_epoch(learning_rate)
                .map_err(ClientError::Model)?;
            epochs += 1;
            debug!(
                local_epoch,
                learning_rate,
                loss = metrics.loss,
                performance = metrics.performance,
                "trained local epoch"
            );

            let exchange = thresholds.map_or(true, |thresholds| {
                epochs >= u64::from(thresholds.epoch)
                    && metrics.performance >= thresholds.performance
            });
            if exchange {
                let weights = self.model.blocking_lock().weights();
                let update = self.local_update(weights, baseline, local_epoch, metrics);
                self.pending.put(update);
            }

            if matches!(self.settings.training.max_local_epochs, Some(max) if epochs >= max) {
                info!(
                    version = baseline,
                    "reached the maximal number of local epochs, waiting for a new global model"
                );
                return Ok(());
            }
        }
    }

    /// Loads the adopted global model into the model. Returns its version.
    fn load_adopted_model(&self) -> Result<u64, ClientError> {
        let (version, artifact) = {
            let state = self.state.blocking_lock();
            (state.adopted_version, state.global_artifact(state.adopted_version))
        };
        let (name, _) = artifact.ok_or(ClientError::Disconnected)?;
        let weights = read_weights(&self.global_dir().join(name.to_string()))?;
        self.model
            .blocking_lock()
            .set_weights(weights)
            .map_err(ClientError::Model)?;
        Ok(version)
    }

    fn local_update(
        &self,
        weights: Weights,
        global_version_used: u64,
        local_epoch: u64,
        metrics: Metrics,
    ) -> LocalModelUpdateInfo {
        let state = self.state.blocking_lock();
        let extension = state
            .model
            .as_ref()
            .map(|model| model.file_extension.as_str())
            .unwrap_or_default();
        let file_name = ArtifactName::new(local_epoch, extension).to_string();
        LocalModelUpdateInfo {
            weights,
            local_path: self.local_dir().join(&file_name),
            remote_path: join_key([state.client_folder.as_str(), file_name.as_str()]),
            file_name,
            global_version_used,
            local_epoch,
            train_accuracy: metrics.performance,
            train_loss: metrics.loss,
            has_unpublished: true,
        }
    }

    /// Evaluates the adopted global model and reports the result to the server.
    async fn evaluate(self: &Arc<Self>) {
        self.enter(ClientPhase::Testing);
        let (version, artifact) = {
            let state = self.state.lock().await;
            (state.adopted_version, state.global_artifact(state.adopted_version))
        };
        if let Some((name, remote_path)) = artifact {
            let path = self.global_dir().join(name.to_string());
            let this = Arc::clone(self);
            let evaluated = tokio::task::spawn_blocking(move || {
                let weights = read_weights(&path)?;
                let mut model = this.model.blocking_lock();
                model.set_weights(weights).map_err(ClientError::Model)?;
                model.evaluate().map_err(ClientError::Model)
            })
            .await;

            match evaluated {
                Ok(Ok(metrics)) => {
                    info!(
                        version,
                        performance = metrics.performance,
                        loss = metrics.loss,
                        "evaluated global model"
                    );
                    let evaluation = ClientNotifyEvaluation {
                        remote_path,
                        performance: metrics.performance,
                        loss: metrics.loss,
                    };
                    if let Err(err) = self.messenger.send(Route::Server, evaluation).await {
                        error!(version, "failed to report the evaluation: {}", err);
                    }
                }
                Ok(Err(err)) => error!(version, "evaluation failed: {}", err),
                Err(err) => error!(version, "evaluation panicked: {}", err),
            }
        }
        self.leave(ClientPhase::Testing);
    }

    /// Publishes the pending local update, if any.
    ///
    /// The update stays pending if any step fails, and is retried on the next call.
    pub(crate) async fn publish_pending(&self) {
        let (generation, update) = match self.pending.snapshot() {
            Some(pending) => pending,
            None => return,
        };
        let storage = match self.storage.get() {
            Some(storage) => storage,
            None => return,
        };

        self.enter(ClientPhase::Publishing);
        let published = self.publish(storage, &update).await;
        self.leave(ClientPhase::Publishing);

        match published {
            Ok(()) => {
                info!(
                    local_epoch = update.local_epoch,
                    version = update.global_version_used,
                    "published local update"
                );
                self.save_profile().await;
                if !self.pending.commit(generation) {
                    debug!("a newer local update is pending");
                }
            }
            Err(err) => warn!(
                local_epoch = update.local_epoch,
                "failed to publish local update: {}", err
            ),
        }
    }

    async fn publish(
        &self,
        storage: &StorageGateway<C::Store>,
        update: &LocalModelUpdateInfo,
    ) -> Result<(), ClientError> {
        let data = update.weights.encode()?;
        write_file(&update.local_path, &data).await?;
        storage
            .upload_from(&update.local_path, &update.remote_path)
            .await?;
        let notification = ClientNotifyModelUpdate {
            remote_path: update.remote_path.clone(),
            file_name: update.file_name.clone(),
            global_version_used: update.global_version_used,
            loss: update.train_loss,
            performance: update.train_accuracy,
        };
        self.messenger.send(Route::Server, notification).await?;
        Ok(())
    }

    pub(crate) async fn clean_cache(&self) {
        let (extension, adopted_version, local_epoch) = {
            let state = self.state.lock().await;
            match &state.model {
                Some(model) => (
                    model.file_extension.clone(),
                    state.adopted_version,
                    state.local_epoch,
                ),
                None => return,
            }
        };
        let retention = &self.settings.retention;

        let global = clean_dir(
            &self.global_dir(),
            &extension,
            adopted_version,
            retention.global_keep_versions,
        )
        .await;
        let local = if self.role() == Role::Trainer {
            clean_dir(
                &self.local_dir(),
                &extension,
                local_epoch,
                retention.local_keep_versions,
            )
            .await
        } else {
            Default::default()
        };

        let deleted = global.deleted.len() + local.deleted.len();
        let failed = global.failed + local.failed;
        if deleted > 0 || failed > 0 {
            debug!("deleted {} cached artifacts, {} failures", deleted, failed);
        }
    }

    async fn handle_server_ping(&self, ping: Ping) {
        if ping.worker_id != self.client_id {
            trace!("ignoring ping of another client");
            return;
        }
        if ping.reply {
            trace!("server is alive");
            return;
        }
        let pong = Payload::ClientPing(Ping {
            worker_id: self.client_id.clone(),
            reply: true,
        });
        if let Err(err) = self.messenger.send(Route::Server, pong).await {
            warn!("failed to answer ping: {}", err);
        }
    }

    fn handle_stop(&self, stop: ServerStop) {
        info!("stopped by the server: {}", stop.reason);
        self.phase.send_replace(ClientPhase::Stopped);
        self.shutdown();
    }
}

fn read_weights(path: &Path) -> Result<Weights, ClientError> {
    let data = std::fs::read(path).map_err(|error| ClientError::Cache {
        path: path.display().to_string(),
        error,
    })?;
    Ok(Weights::decode(&data)?)
}

#[async_trait]
impl<C, T, M> MessageHandler for Arc<ClientCoordinator<C, T, M>>
where
    C: StorageConnector,
    T: Transport,
    M: ModelAdapter,
{
    async fn handle(&self, message: Message) {
        let Message { headers, payload } = message;
        let span = info_span!(
            "handle",
            message_type = %headers.message_type,
            client_id = %self.client_id
        );
        async {
            match payload {
                Payload::ServerInitResponse(response) => self.handle_init_response(response).await,
                Payload::ServerNotifyModelUpdate(update) => self.handle_model_update(update).await,
                Payload::ServerPing(ping) => self.handle_server_ping(ping).await,
                Payload::ServerStop(stop) => self.handle_stop(stop),
                Payload::ClientInit(_)
                | Payload::ClientNotifyModelUpdate(_)
                | Payload::ClientNotifyEvaluation(_)
                | Payload::ClientPing(_) => trace!("ignoring message of a client"),
            }
        }
        .instrument(span)
        .await
    }
}
