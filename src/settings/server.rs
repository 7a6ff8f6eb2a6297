use std::{path::PathBuf, time::Duration};

use serde::Deserialize;
use validator::{Validate, ValidationError};

use super::{BusSettings, LearningRateSettings, LoggingSettings, RetrySettings, StorageSettings};

#[derive(Debug, Deserialize, Validate)]
/// The combined settings of the server.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct ServerSettings {
    #[serde(default)]
    pub log: LoggingSettings,
    #[validate]
    pub bus: BusSettings,
    #[serde(default)]
    #[validate]
    pub storage: StorageSettings,
    #[validate]
    pub model: ModelSettings,
    #[serde(default)]
    #[validate]
    pub aggregation: AggregationSettings,
    #[serde(default)]
    #[validate]
    pub liveness: LivenessSettings,
    #[serde(default)]
    #[validate]
    pub exchange: ExchangeSettings,
    #[serde(default)]
    #[validate]
    pub retention: RetentionSettings,
    #[serde(default)]
    #[validate]
    pub transfer: RetrySettings,
    #[serde(default)]
    #[validate]
    pub stop: StopSettings,
}

#[derive(Debug, Clone, Deserialize, Validate)]
/// Global model settings.
pub struct ModelSettings {
    /// The name of the model. Global artifacts are stored in
    /// `<storage.global_folder>/<model.name>/<version>.<model.file_extension>`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [model]
    /// name = "cifar10"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// ASYNFED_SERVER_MODEL__NAME=cifar10
    /// ```
    #[validate(length(min = 1))]
    pub name: String,

    /// The extension of the model artifacts. Defaults to `bin`.
    #[serde(default = "default_file_extension")]
    #[validate(length(min = 1))]
    pub file_extension: String,

    /// Weights published as version `1` when the storage holds no global model yet.
    #[serde(default)]
    pub initial_weights: Option<PathBuf>,

    /// The directory where the server keeps a copy of the global models it produced.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

fn default_file_extension() -> String {
    String::from("bin")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./cache")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
/// The aggregation strategies.
pub enum StrategyKind {
    /// Staleness-weighted blending into the previous global model.
    Asynchronous,
    /// Data-size weighted averaging of the up-to-date workers.
    Synchronous,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
/// Aggregation settings.
pub struct AggregationSettings {
    /// The aggregation strategy. Defaults to `asynchronous`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [aggregation]
    /// strategy = "synchronous"
    /// ```
    pub strategy: StrategyKind,

    /// How often the server checks for completed local updates, in milliseconds.
    #[validate(range(min = 1))]
    pub interval_ms: u64,

    /// The exponent `a` of the staleness discount `(1 + staleness)^-a`.
    #[validate(range(min = 0.0))]
    pub staleness_exponent: f64,

    /// The share of the averaged local updates mixed into the previous global model.
    #[validate(range(min = 0.0, max = 1.0))]
    pub mixing_rate: f64,

    /// How many versions a worker may lag behind before the synchronous strategy ignores it.
    pub max_staleness: u64,

    #[validate]
    pub learning_rate: LearningRateSettings,
}

impl AggregationSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Asynchronous,
            interval_ms: 1_000,
            staleness_exponent: 0.5,
            mixing_rate: 0.5,
            max_staleness: 2,
            learning_rate: LearningRateSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Validate)]
#[serde(default)]
/// Liveness settings.
pub struct LivenessSettings {
    /// A worker is connected when it was heard from within this window, in seconds.
    #[validate(range(min = 1))]
    pub window_secs: u64,
    /// How often the server refreshes liveness and probes the known workers, in seconds.
    #[validate(range(min = 1))]
    pub probe_interval_secs: u64,
}

impl LivenessSettings {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }
}

impl Default for LivenessSettings {
    fn default() -> Self {
        Self {
            window_secs: 10,
            probe_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Validate)]
#[serde(default)]
/// The thresholds a trainer must reach before it publishes a local update.
pub struct ExchangeSettings {
    #[validate(range(min = 0.0, max = 1.0))]
    pub min_performance: f64,
    #[validate(range(min = 1))]
    pub min_epoch: u32,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            min_performance: 0.,
            min_epoch: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Validate)]
#[serde(default)]
/// Retention of the cached global models.
pub struct RetentionSettings {
    /// How often old artifacts are deleted, in seconds.
    #[validate(range(min = 1))]
    pub interval_secs: u64,
    /// How many versions below the current one are kept.
    #[validate(range(min = 1))]
    pub keep_versions: u64,
}

impl RetentionSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            interval_secs: 600,
            keep_versions: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_stop"))]
/// The conditions which end the training.
///
/// The server stops as soon as one of the configured conditions is met.
pub struct StopSettings {
    /// Stop once this global version is published.
    pub max_version: Option<u64>,
    /// Stop once a tester reports at least this performance.
    pub expected_performance: Option<f64>,
    /// Stop once a tester reports at most this loss.
    pub expected_loss: Option<f64>,
}

fn validate_stop(s: &StopSettings) -> Result<(), ValidationError> {
    match s.expected_performance {
        Some(performance) if !(0.0..=1.0).contains(&performance) => Err(ValidationError::new(
            "the expected performance must be in [0, 1]",
        )),
        _ => Ok(()),
    }
}
