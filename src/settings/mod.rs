//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables. Examples of
//! configuration files can be found in the `configs/` directory located in the repository root.

use std::{fmt, path::Path, path::PathBuf, time::Duration};

use config::{Config, ConfigError, Environment};
use redis::{ConnectionInfo, IntoConnectionInfo};
use serde::{
    de::{self, DeserializeOwned, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::storage::StorageKind;

mod client;
#[cfg(feature = "s3")]
#[cfg_attr(docsrs, doc(cfg(feature = "s3")))]
pub mod s3;
mod server;

pub use self::{
    client::{
        ClientIdentitySettings,
        ClientRetentionSettings,
        ClientSettings,
        DatasetSettings,
        TrainingSettings,
    },
    server::{
        AggregationSettings,
        ExchangeSettings,
        LivenessSettings,
        ModelSettings,
        RetentionSettings,
        ServerSettings,
        StopSettings,
        StrategyKind,
    },
};
#[cfg(feature = "s3")]
pub use self::s3::S3Settings;


#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

/// Loads settings from a configuration file, then applies the environment overrides.
///
/// An override for the key `section.key` is read from `<PREFIX>_SECTION__KEY`.
fn load<T>(path: impl AsRef<Path>, env_prefix: &str) -> Result<T, ConfigError>
where
    T: DeserializeOwned,
{
    Config::builder()
        .add_source(config::File::from(path.as_ref()))
        .add_source(
            Environment::with_prefix(env_prefix)
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?
        .try_deserialize()
}

/// Loads and validates settings of type `T`.
fn load_validated<T>(path: impl AsRef<Path>, env_prefix: &str) -> Result<T, SettingsError>
where
    T: DeserializeOwned + Validate,
{
    let settings: T = load(path, env_prefix)?;
    settings.validate()?;
    Ok(settings)
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "asynfed=debug,info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// ASYNFED_SERVER_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.3/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: EnvFilter::new("info"),
        }
    }
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.3/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}

#[derive(Debug, Clone, Deserialize, Validate)]
/// Message bus settings.
pub struct BusSettings {
    /// The URL where Redis is running.
    ///
    /// The format of the URL is `redis://[<username>][:<passwd>@]<hostname>[:port][/<db>]`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [bus]
    /// url = "redis://127.0.0.1/"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// ASYNFED_SERVER_BUS__URL=redis://127.0.0.1/
    /// ```
    #[serde(deserialize_with = "deserialize_redis_url")]
    pub url: ConnectionInfo,

    /// The name shared by every topic of a federation. Servers and clients only talk to each
    /// other when they use the same exchange. Defaults to `asynfed`.
    #[serde(default = "default_exchange")]
    #[validate(length(min = 1))]
    pub exchange: String,

    /// How often a message is sent before giving up.
    #[serde(default)]
    #[validate]
    pub retry: RetrySettings,
}

fn default_exchange() -> String {
    String::from("asynfed")
}

fn deserialize_redis_url<'de, D>(deserializer: D) -> Result<ConnectionInfo, D::Error>
where
    D: Deserializer<'de>,
{
    struct ConnectionInfoVisitor;

    impl<'de> Visitor<'de> for ConnectionInfoVisitor {
        type Value = ConnectionInfo;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(
                formatter,
                "redis://[<username>][:<passwd>@]<hostname>[:port][/<db>]"
            )
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            value
                .into_connection_info()
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(ConnectionInfoVisitor)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Validate)]
#[serde(default)]
/// Settings of an operation that is retried with a fixed backoff.
pub struct RetrySettings {
    /// The maximal number of attempts, including the first one. Must be at least `1`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [transfer]
    /// attempts = 10
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// ASYNFED_CLIENT_TRANSFER__ATTEMPTS=10
    /// ```
    #[validate(range(min = 1))]
    pub attempts: usize,

    /// The time to wait between two attempts, in milliseconds.
    pub backoff_ms: u64,
}

impl RetrySettings {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            attempts: 10,
            backoff_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[validate(schema(function = "validate_storage"))]
/// Object storage settings.
pub struct StorageSettings {
    /// The backend holding the artifacts: `local` or `s3`. Defaults to `local`.
    #[serde(default)]
    pub backend: StorageKind,

    /// The root directory of the `local` backend. It must be reachable by the server and by every
    /// client.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [storage]
    /// backend = "local"
    /// root = "/srv/asynfed"
    /// ```
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,

    /// The folder of the global models. Defaults to `global-models`.
    #[serde(default = "default_global_folder")]
    #[validate(length(min = 1))]
    pub global_folder: String,

    /// The folder of the local updates. Each client uploads into its own sub-folder. Defaults to
    /// `clients`.
    #[serde(default = "default_client_folder")]
    #[validate(length(min = 1))]
    pub client_folder: String,

    #[cfg(feature = "s3")]
    #[validate]
    pub s3: Option<S3Settings>,
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./storage")
}

fn default_global_folder() -> String {
    String::from("global-models")
}

fn default_client_folder() -> String {
    String::from("clients")
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageKind::default(),
            root: default_storage_root(),
            global_folder: default_global_folder(),
            client_folder: default_client_folder(),
            #[cfg(feature = "s3")]
            s3: None,
        }
    }
}

fn validate_storage(s: &StorageSettings) -> Result<(), ValidationError> {
    match s.backend {
        StorageKind::Local => Ok(()),
        #[cfg(feature = "s3")]
        StorageKind::S3 if s.s3.is_some() => Ok(()),
        StorageKind::S3 => Err(ValidationError::new(
            "the s3 backend requires a [storage.s3] section and the `s3` feature",
        )),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_learning_rate"))]
/// Learning-rate schedule settings.
///
/// Without `total_steps` the rate is not managed by a schedule.
pub struct LearningRateSettings {
    /// The rate at step `0`.
    pub initial: f64,
    /// The lower bound of the rate, reached after `total_steps` steps.
    pub floor: f64,
    /// The number of steps of the cosine decay. `0` disables the schedule.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [aggregation.learning_rate]
    /// initial = 0.01
    /// floor = 0.001
    /// total_steps = 100
    /// ```
    #[serde(default)]
    pub total_steps: Option<u64>,
}

impl Default for LearningRateSettings {
    fn default() -> Self {
        Self {
            initial: 0.01,
            floor: 0.001,
            total_steps: None,
        }
    }
}

fn validate_learning_rate(s: &LearningRateSettings) -> Result<(), ValidationError> {
    if s.floor >= 0. && s.floor <= s.initial {
        Ok(())
    } else {
        Err(ValidationError::new(
            "the learning rate floor must be in [0, initial]",
        ))
    }
}

impl ServerSettings {
    /// Loads and validates the server settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        load_validated(path, "asynfed_server")
    }
}

impl ClientSettings {
    /// Loads and validates the client settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        load_validated(path, "asynfed_client")
    }
}
