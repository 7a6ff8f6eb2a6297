//! The global model and its aggregation step.

use std::path::PathBuf;

use displaydoc::Display;
use thiserror::Error;
use tokio::sync::Mutex;

use super::{
    registry::{Worker, WorkerId},
    strategy::{participants, AggregationStrategy, Contribution, MergeError, Strategy},
};
use crate::{
    model::{Weights, WeightsError},
    settings::ModelSettings,
    storage::{
        gateway::write_file,
        join_key,
        ArtifactName,
        ObjectStore,
        StorageGateway,
        StorageResult,
        TransferError,
    },
};

/// The bookkeeping of the global model.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct GlobalModelState {
    /// The newest published version. `0` means that no global model exists yet.
    pub current_version: u64,
    /// The loss of the cohort which produced the current version.
    pub avg_loss: f64,
    /// The quality of data of the cohort which produced the current version.
    pub avg_qod: f64,
    /// The data size of the cohort which produced the current version.
    pub total_data_size: u64,
}

/// The result of a successful aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationOutcome {
    /// The state after the new version was published.
    pub state: GlobalModelState,
    /// The learning rate for clients training on top of the new version.
    pub learning_rate: Option<f64>,
    /// The workers whose local update is part of the new version.
    pub contributors: Vec<WorkerId>,
    /// The workers whose local update could not be downloaded.
    pub skipped: Vec<WorkerId>,
}

/// Errors of an aggregation. The global model is unchanged after any of them.
#[derive(Debug, Display, Error)]
pub enum AggregationError {
    /// None of the local updates could be downloaded.
    NoContribution,
    /// Failed to merge the local updates: {0}.
    Merge(#[from] MergeError),
    /// Failed to load global version {version}: {error}.
    Previous { version: u64, error: LoadError },
    /// Failed to encode the global model: {0}.
    Encode(WeightsError),
    /// Failed to publish the global model: {0}.
    Publish(TransferError),
}

impl AggregationError {
    /// Whether retrying with the same local updates can't succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::NoContribution | Self::Merge(_))
    }
}

/// Errors of loading a model artifact.
#[derive(Debug, Display, Error)]
pub enum LoadError {
    /// {0}
    Transfer(#[from] TransferError),
    /// {0}
    Decode(#[from] WeightsError),
    /// Failed to read {path}: {error}.
    Read { path: String, error: std::io::Error },
}

/// The global model of a federation.
///
/// Every change of the global model holds the lock of its cached weights, so two aggregations
/// never overlap and the version advances by exactly one per published artifact. The bookkeeping
/// has a lock of its own which is only held to read it or to commit a new version: transfers never
/// block readers of the current version.
pub struct GlobalModel<S> {
    strategy: Strategy,
    storage: StorageGateway<S>,
    settings: ModelSettings,
    folder: String,
    weights: Mutex<Option<Weights>>,
    state: Mutex<GlobalModelState>,
}

impl<S> GlobalModel<S>
where
    S: ObjectStore,
{
    pub fn new(
        strategy: Strategy,
        storage: StorageGateway<S>,
        settings: ModelSettings,
        global_folder: &str,
    ) -> Self {
        let folder = join_key([global_folder, settings.name.as_str()]);
        Self {
            strategy,
            storage,
            settings,
            folder,
            weights: Mutex::new(None),
            state: Mutex::new(GlobalModelState::default()),
        }
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    pub fn storage(&self) -> &StorageGateway<S> {
        &self.storage
    }

    pub fn settings(&self) -> &ModelSettings {
        &self.settings
    }

    /// The folder of the global artifacts.
    pub fn folder(&self) -> &str {
        &self.folder
    }

    /// The key of the artifact of a global version.
    pub fn remote_path(&self, version: u64) -> String {
        ArtifactName::new(version, self.settings.file_extension.as_str()).key_in(&self.folder)
    }

    pub async fn state(&self) -> GlobalModelState {
        *self.state.lock().await
    }

    pub async fn current_version(&self) -> u64 {
        self.state.lock().await.current_version
    }

    /// The learning rate announced to clients joining at the current version.
    pub async fn learning_rate(&self) -> Option<f64> {
        let current_version = self.current_version().await;
        self.strategy
            .learning_rate(current_version.saturating_sub(1))
    }

    /// Resumes the current version from the newest global artifact in storage.
    pub async fn resume(&self) -> StorageResult<u64> {
        let latest = self
            .storage
            .latest_version(&self.folder, &self.settings.file_extension)
            .await?;
        let mut weights = self.weights.lock().await;
        let mut state = self.state.lock().await;
        if let Some(version) = latest {
            if version > state.current_version {
                info!(version, "resuming from the global model in storage");
                state.current_version = version;
                *weights = None;
            }
        }
        Ok(state.current_version)
    }

    /// Publishes the configured initial weights as version `1` if no global model exists yet.
    ///
    /// Returns whether a version was published.
    pub async fn bootstrap(&self) -> Result<bool, LoadError> {
        let path = match &self.settings.initial_weights {
            Some(path) => path.clone(),
            None => return Ok(false),
        };
        let mut weights = self.weights.lock().await;
        if self.current_version().await > 0 {
            return Ok(false);
        }

        let data = tokio::fs::read(&path).await.map_err(|error| LoadError::Read {
            path: path.display().to_string(),
            error,
        })?;
        let initial = Weights::decode(&data)?;
        self.storage.upload(&self.remote_path(1), data).await?;

        info!("published the initial weights {} as version 1", path.display());
        self.state.lock().await.current_version = 1;
        *weights = Some(initial);
        Ok(true)
    }

    /// Folds the local updates of `completed` into a new global version.
    ///
    /// Returns `None` if there is nothing to aggregate. Local updates that can't be downloaded are
    /// skipped. The new version is only counted once its artifact is published. Only the
    /// contributions taking part in the merge count towards the statistics of the new version.
    pub async fn aggregate(
        &self,
        completed: &[Worker],
    ) -> Result<Option<AggregationOutcome>, AggregationError> {
        if completed.is_empty() {
            return Ok(None);
        }

        let mut weights = self.weights.lock().await;
        let current_version = self.current_version().await;
        let next_version = current_version + 1;

        let (contributions, skipped) = self
            .download_contributions(completed, current_version)
            .await;
        if contributions.is_empty() {
            return Err(AggregationError::NoContribution);
        }

        if weights.is_none() && current_version > 0 {
            let previous =
                self.load(current_version)
                    .await
                    .map_err(|error| AggregationError::Previous {
                        version: current_version,
                        error,
                    })?;
            *weights = Some(previous);
        }
        let merged = self.strategy.merge(weights.as_ref(), &contributions)?;
        let data = merged.encode().map_err(AggregationError::Encode)?;

        let file_name = ArtifactName::new(next_version, self.settings.file_extension.as_str());
        if let Err(err) = write_file(&self.cache_path(&file_name), &data).await {
            warn!("failed to cache global version {}: {}", next_version, err);
        }
        self.storage
            .upload(&file_name.key_in(&self.folder), data)
            .await
            .map_err(AggregationError::Publish)?;

        let cohort = participants(&self.strategy, &contributions);
        let (avg_loss, avg_qod, total_data_size) = cohort_statistics(&cohort);
        let state = GlobalModelState {
            current_version: next_version,
            avg_loss,
            avg_qod,
            total_data_size,
        };
        *self.state.lock().await = state;
        *weights = Some(merged);
        info!(
            version = next_version,
            contributions = cohort.len(),
            ignored = contributions.len() - cohort.len(),
            "published a new global version"
        );

        Ok(Some(AggregationOutcome {
            state,
            learning_rate: self.strategy.learning_rate(current_version),
            contributors: cohort.iter().map(|c| c.worker_id.clone()).collect(),
            skipped,
        }))
    }

    async fn download_contributions(
        &self,
        completed: &[Worker],
        current_version: u64,
    ) -> (Vec<Contribution>, Vec<WorkerId>) {
        let mut contributions = Vec::with_capacity(completed.len());
        let mut skipped = Vec::new();
        for worker in completed {
            let update = match &worker.update {
                Some(update) => update,
                None => continue,
            };
            let weights = match self.storage.download(&update.remote_path).await {
                Ok(data) => Weights::decode(&data).map_err(LoadError::from),
                Err(err) => Err(LoadError::from(err)),
            };
            match weights {
                Ok(weights) => contributions.push(Contribution {
                    worker_id: worker.worker_id.clone(),
                    weights,
                    data_size: worker.data_description.size,
                    staleness: current_version.saturating_sub(update.global_version_used),
                    loss: update.loss,
                    qod: worker.data_description.qod,
                }),
                Err(err) => {
                    warn!(worker_id = %worker.worker_id, "skipping local update: {}", err);
                    skipped.push(worker.worker_id.clone());
                }
            }
        }
        (contributions, skipped)
    }

    async fn load(&self, version: u64) -> Result<Weights, LoadError> {
        let data = self.storage.download(&self.remote_path(version)).await?;
        Ok(Weights::decode(&data)?)
    }

    fn cache_path(&self, file_name: &ArtifactName) -> PathBuf {
        self.settings.cache_dir.join(file_name.to_string())
    }
}

/// The data-size weighted loss and quality of data of a cohort, and its total data size.
///
/// A cohort without reported data sizes is weighted uniformly.
fn cohort_statistics(contributions: &[&Contribution]) -> (f64, f64, u64) {
    let total_data_size: u64 = contributions.iter().map(|c| c.data_size).sum();
    let weight_of = |c: &&Contribution| {
        if total_data_size > 0 {
            c.data_size as f64
        } else {
            1.
        }
    };
    let total: f64 = contributions.iter().map(weight_of).sum();
    if total <= 0. {
        return (0., 0., total_data_size);
    }
    let avg_loss = contributions.iter().map(|c| weight_of(c) * c.loss).sum::<f64>() / total;
    let avg_qod = contributions.iter().map(|c| weight_of(c) * c.qod).sum::<f64>() / total;
    (avg_loss, avg_qod, total_data_size)
}
