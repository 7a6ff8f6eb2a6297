use std::{path::PathBuf, time::Duration};

use serde::Deserialize;
use validator::Validate;

use super::{BusSettings, LearningRateSettings, LoggingSettings, RetrySettings};
use crate::messages::Role;

#[derive(Debug, Deserialize, Validate)]
/// The combined settings of a client.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct ClientSettings {
    #[serde(default)]
    pub log: LoggingSettings,
    #[validate]
    pub bus: BusSettings,
    #[validate]
    pub client: ClientIdentitySettings,
    #[serde(default)]
    #[validate]
    pub dataset: DatasetSettings,
    #[serde(default)]
    #[validate]
    pub transfer: RetrySettings,
    #[serde(default)]
    #[validate]
    pub retention: ClientRetentionSettings,
    #[serde(default)]
    #[validate]
    pub training: TrainingSettings,
    /// The rate used when the server does not manage one.
    #[serde(default)]
    #[validate]
    pub learning_rate: LearningRateSettings,
}

#[derive(Debug, Clone, Deserialize, Validate)]
/// Identity and local state of a client.
pub struct ClientIdentitySettings {
    /// The stable identity of the client. When unset, the identity saved in the profile is reused,
    /// or a new one is generated on the very first start.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [client]
    /// client_id = "hospital-7"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// ASYNFED_CLIENT_CLIENT__CLIENT_ID=hospital-7
    /// ```
    #[validate(length(min = 1))]
    pub client_id: Option<String>,

    /// Either `trainer` or `tester`. Defaults to `trainer`.
    #[serde(default)]
    pub role: Role,

    /// The directory of the profile and of the cached artifacts. It must not be shared between
    /// clients.
    pub working_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, Deserialize, Validate)]
#[serde(default)]
/// The description of the local dataset announced to the server.
pub struct DatasetSettings {
    /// The number of samples.
    pub size: u64,
    /// The quality of the data, in `[0, 1]`.
    #[validate(range(min = 0.0, max = 1.0))]
    pub qod: f64,
}

impl Default for DatasetSettings {
    fn default() -> Self {
        Self { size: 0, qod: 1. }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Validate)]
#[serde(default)]
/// Retention of the cached global models and local updates.
pub struct ClientRetentionSettings {
    /// How often old artifacts are deleted, in seconds.
    #[validate(range(min = 1))]
    pub interval_secs: u64,
    /// How many global versions below the adopted one are kept.
    #[validate(range(min = 1))]
    pub global_keep_versions: u64,
    /// How many local epochs below the latest one are kept.
    #[validate(range(min = 1))]
    pub local_keep_versions: u64,
}

impl ClientRetentionSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for ClientRetentionSettings {
    fn default() -> Self {
        Self {
            interval_secs: 600,
            global_keep_versions: 5,
            local_keep_versions: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Validate)]
#[serde(default)]
/// Settings of the local training and of the publication of its results.
pub struct TrainingSettings {
    /// The maximal number of local epochs trained on top of a single global version. Unbounded
    /// when unset.
    pub max_local_epochs: Option<u64>,
    /// How often the pending local update is checked, in milliseconds.
    #[validate(range(min = 1))]
    pub publish_interval_ms: u64,
    /// How often the handshake is repeated until the server answers, in seconds.
    #[validate(range(min = 1))]
    pub init_retry_secs: u64,
}

impl TrainingSettings {
    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms)
    }

    pub fn init_retry(&self) -> Duration {
        Duration::from_secs(self.init_retry_secs)
    }
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            max_local_epochs: None,
            publish_interval_ms: 10_000,
            init_retry_secs: 30,
        }
    }
}
