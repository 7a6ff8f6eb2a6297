use displaydoc::Display;
use thiserror::Error;
use tokio::sync::watch;
use tracing::Instrument;
use uuid::Uuid;

use super::{
    aggregation::{AggregationOutcome, GlobalModel, LoadError},
    registry::{LocalUpdate, Registration, Worker, WorkerRegistry},
    strategy::{AggregationStrategy, Strategy},
};
use crate::{
    messages::{
        ClientInit,
        ClientNotifyEvaluation,
        ClientNotifyModelUpdate,
        ExchangeThresholds,
        Headers,
        Message,
        ModelInfo,
        Payload,
        Ping,
        ServerInitResponse,
        ServerNotifyModelUpdate,
        ServerStop,
    },
    messenger::{Identity, MessageHandler, Messenger, MessengerError, Route, Transport},
    settings::ServerSettings,
    storage::{retention::clean_dir, storage_info, ObjectStore, StorageError, StorageGateway},
    utils::periodic::periodically,
};

/// The id the server puts in the headers of its messages.
pub const SERVER_ID: &str = "server";

/// Errors of the server.
#[derive(Debug, Display, Error)]
pub enum ServerError {
    /// Failed to resume from storage: {0}.
    Resume(StorageError),
    /// Failed to publish the initial weights: {0}.
    Bootstrap(#[from] LoadError),
    /// {0}
    Messenger(#[from] MessengerError),
}

/// The coordinator of a federation.
pub struct ServerCoordinator<S, T> {
    settings: ServerSettings,
    registry: WorkerRegistry,
    model: GlobalModel<S>,
    messenger: Messenger<T>,
    shutdown: watch::Sender<bool>,
}

impl<S, T> ServerCoordinator<S, T>
where
    S: ObjectStore,
    T: Transport,
{
    pub fn new(settings: ServerSettings, store: S, transport: T) -> Self {
        let registry = WorkerRegistry::new(settings.liveness.window());
        let model = GlobalModel::new(
            Strategy::from_settings(&settings.aggregation),
            StorageGateway::new(store, settings.transfer),
            settings.model.clone(),
            &settings.storage.global_folder,
        );
        let messenger = Messenger::new(
            transport,
            settings.bus.exchange.clone(),
            Identity::new(Uuid::new_v4().to_string(), SERVER_ID),
            settings.bus.retry,
        );
        let (shutdown, _) = watch::channel(false);
        Self {
            settings,
            registry,
            model,
            messenger,
            shutdown,
        }
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn model(&self) -> &GlobalModel<S> {
        &self.model
    }

    pub fn messenger(&self) -> &Messenger<T> {
        &self.messenger
    }

    /// Runs the server until it is stopped.
    ///
    /// Resumes the global model from storage, publishes the initial weights if needed, then serves
    /// the clients and runs the aggregation, liveness and retention loops.
    pub async fn run(&self) -> Result<(), ServerError> {
        let version = self.model.resume().await.map_err(ServerError::Resume)?;
        if self.model.bootstrap().await? {
            info!("bootstrapped the global model");
        } else if version == 0 {
            info!("waiting for the first local updates");
        }

        let subscription = self.messenger.subscribe(&[Route::Server]).await?;
        info!(
            version = self.model.current_version().await,
            "server listening on {}",
            subscription.topics().join(", ")
        );

        let dispatch = async {
            self.messenger
                .dispatch(subscription, self, self.shutdown.subscribe())
                .await;
            self.shutdown.send_replace(true);
        };
        let aggregation = periodically(
            self.settings.aggregation.interval(),
            self.shutdown.subscribe(),
            move || async move {
                self.aggregation_pass().await;
            },
        );
        let liveness = periodically(
            self.settings.liveness.probe_interval(),
            self.shutdown.subscribe(),
            move || self.probe_workers(),
        );
        let retention = periodically(
            self.settings.retention.interval(),
            self.shutdown.subscribe(),
            move || self.clean_cache(),
        );

        tokio::join!(dispatch, aggregation, liveness, retention);
        info!("server stopped");
        Ok(())
    }

    /// Stops every loop of the server.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Tells the clients to terminate, then stops the server.
    pub async fn stop(&self, reason: &str) {
        info!("stopping: {}", reason);
        let stop = ServerStop {
            reason: reason.to_string(),
        };
        if let Err(err) = self.messenger.send(Route::Clients, stop).await {
            error!("failed to notify the clients: {}", err);
        }
        self.shutdown();
    }

    /// Aggregates the completed local updates and announces the new global version.
    ///
    /// Does nothing if no local update is pending. Updates recorded while the aggregation runs are
    /// left for the next pass.
    pub async fn aggregation_pass(&self) -> Option<AggregationOutcome> {
        let completed = self.registry.completed_workers().await;
        if completed.is_empty() {
            return None;
        }

        let outcome = match self.model.aggregate(&completed).await {
            Ok(Some(outcome)) => outcome,
            Ok(None) => return None,
            Err(err) if err.is_permanent() => {
                warn!("dropping {} local updates: {}", completed.len(), err);
                self.registry.clear_completed(&completed).await;
                return None;
            }
            Err(err) => {
                warn!("aggregation failed, retrying on the next pass: {}", err);
                return None;
            }
        };
        self.registry.clear_completed(&completed).await;

        let version = outcome.state.current_version;
        let selection = self
            .model
            .strategy()
            .select_participants(&self.registry.workers().await, version);
        let update = ServerNotifyModelUpdate {
            version,
            chosen_ids: selection.chosen_ids(),
            learning_rate: outcome.learning_rate,
            avg_loss: outcome.state.avg_loss,
            avg_qod: outcome.state.avg_qod,
            total_data_size: outcome.state.total_data_size,
        };
        if let Err(err) = self.messenger.send(Route::Clients, update).await {
            // the clients still pick up the version on their next handshake
            error!(version, "failed to announce the global version: {}", err);
        }

        if matches!(self.settings.stop.max_version, Some(max) if version >= max) {
            self.stop(&format!("reached the maximal version {}", version))
                .await;
        }
        Some(outcome)
    }

    async fn probe_workers(&self) {
        let connected = self.registry.refresh_liveness().await;
        let workers = self.registry.workers().await;
        debug!("{} of {} workers connected", connected, workers.len());
        for worker in workers {
            let probe = Payload::ServerPing(Ping {
                worker_id: worker.worker_id.clone(),
                reply: false,
            });
            if let Err(err) = self
                .messenger
                .send(Route::Client(worker.worker_id.clone()), probe)
                .await
            {
                warn!(worker_id = %worker.worker_id, "failed to probe worker: {}", err);
            }
        }
    }

    async fn clean_cache(&self) {
        let report = clean_dir(
            &self.settings.model.cache_dir,
            &self.settings.model.file_extension,
            self.model.current_version().await,
            self.settings.retention.keep_versions,
        )
        .await;
        if !report.deleted.is_empty() || report.failed > 0 {
            debug!(
                "deleted {} cached global models, {} failures",
                report.deleted.len(),
                report.failed
            );
        }
    }

    async fn handle_client_init(&self, headers: &Headers, init: ClientInit) {
        let client_id = headers.client_id.as_str();
        if client_id.is_empty() {
            warn!("discarding handshake without client id");
            return;
        }

        let reconnect = !headers.session_id.is_empty()
            && matches!(
                self.registry.get(client_id).await,
                Some(known) if known.session_id == headers.session_id
            );
        let session_id = if reconnect {
            headers.session_id.clone()
        } else {
            Uuid::new_v4().to_string()
        };

        let worker = Worker::new(
            client_id,
            session_id.as_str(),
            init.role,
            init.system_info,
            init.data_description,
        );
        match self.registry.add_worker(worker).await {
            Registration::New => info!(role = %init.role, "new client joined"),
            Registration::Updated if reconnect => info!("client reconnected"),
            Registration::Updated => info!("known client started a new session"),
        }

        let version = self.model.current_version().await;
        let downloadable =
            version > 0 && self.model.storage().exists(&self.model.remote_path(version)).await;
        if version > 0 && !downloadable {
            warn!(version, "the current global model is missing from storage");
        }
        let response = ServerInitResponse {
            session_id,
            reconnect,
            model_info: ModelInfo {
                name: self.settings.model.name.clone(),
                version,
                global_folder: self.model.folder().to_string(),
                file_extension: self.settings.model.file_extension.clone(),
                downloadable,
            },
            exchange_at: ExchangeThresholds {
                performance: self.settings.exchange.min_performance,
                epoch: self.settings.exchange.min_epoch,
            },
            storage_info: storage_info(&self.settings.storage, client_id),
            learning_rate: self.model.learning_rate().await,
        };
        if let Err(err) = self
            .messenger
            .send(Route::Client(client_id.to_string()), response)
            .await
        {
            error!("failed to answer the handshake: {}", err);
        }
    }

    async fn handle_local_update(&self, headers: &Headers, update: ClientNotifyModelUpdate) {
        let version = update.global_version_used;
        let recorded = self
            .registry
            .record_local_update(
                &headers.client_id,
                LocalUpdate {
                    remote_path: update.remote_path,
                    global_version_used: update.global_version_used,
                    loss: update.loss,
                    performance: update.performance,
                },
            )
            .await;
        if recorded {
            debug!(version, "recorded local update");
        }
    }

    async fn handle_client_ping(&self, headers: &Headers, ping: Ping) {
        if !self.registry.touch_heartbeat(&headers.client_id).await {
            debug!("ping of unknown client");
            return;
        }
        if ping.reply {
            return;
        }
        let pong = Payload::ServerPing(Ping {
            worker_id: headers.client_id.clone(),
            reply: true,
        });
        if let Err(err) = self
            .messenger
            .send(Route::Client(headers.client_id.clone()), pong)
            .await
        {
            warn!("failed to answer ping: {}", err);
        }
    }

    async fn handle_evaluation(&self, evaluation: ClientNotifyEvaluation) {
        info!(
            performance = evaluation.performance,
            loss = evaluation.loss,
            "evaluated {}",
            evaluation.remote_path
        );
        let stop = &self.settings.stop;
        if matches!(stop.expected_performance, Some(expected) if evaluation.performance >= expected)
        {
            self.stop(&format!(
                "reached the expected performance with {}",
                evaluation.remote_path
            ))
            .await;
        } else if matches!(stop.expected_loss, Some(expected) if evaluation.loss <= expected) {
            self.stop(&format!(
                "reached the expected loss with {}",
                evaluation.remote_path
            ))
            .await;
        }
    }
}

#[async_trait]
impl<S, T> MessageHandler for ServerCoordinator<S, T>
where
    S: ObjectStore,
    T: Transport,
{
    async fn handle(&self, message: Message) {
        let Message { headers, payload } = message;
        let span = info_span!(
            "handle",
            message_type = %headers.message_type,
            client_id = %headers.client_id
        );
        async {
            match payload {
                Payload::ClientInit(init) => self.handle_client_init(&headers, init).await,
                Payload::ClientNotifyModelUpdate(update) => {
                    self.handle_local_update(&headers, update).await
                }
                Payload::ClientPing(ping) => self.handle_client_ping(&headers, ping).await,
                Payload::ClientNotifyEvaluation(evaluation) => {
                    self.handle_evaluation(evaluation).await
                }
                Payload::ServerInitResponse(_)
                | Payload::ServerNotifyModelUpdate(_)
                | Payload::ServerPing(_)
                | Payload::ServerStop(_) => debug!("ignoring message of another server"),
            }
        }
        .instrument(span)
        .await
    }
}
