use derive_more::Display;

use crate::storage::StorageKind;

/// The role of a client.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Trains on its local data and publishes local updates.
    #[default]
    #[display(fmt = "trainer")]
    Trainer,
    /// Evaluates every global version and reports the results.
    #[display(fmt = "tester")]
    Tester,
}

/// A description of the host of a client.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub arch: String,
    pub cpus: usize,
}

impl SystemInfo {
    /// Describes the current host.
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            cpus: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

/// The size and quality of the local dataset of a client.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DataDescription {
    pub size: u64,
    pub qod: f64,
}

/// Sent by a client to join the federation, and repeated until the server answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInit {
    pub role: Role,
    pub system_info: SystemInfo,
    pub data_description: DataDescription,
}

/// The global model a client should start from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    /// The current global version. `0` means that no global model exists yet.
    pub version: u64,
    /// The folder of the global artifacts, `<folder>/<version>.<file_extension>`.
    pub global_folder: String,
    pub file_extension: String,
    /// Whether the artifact of `version` can be downloaded.
    pub downloadable: bool,
}

/// Where and how to reach the object store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub kind: StorageKind,
    /// The root directory of a local store, or the bucket of an S3 store.
    pub location: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    /// The folder the client uploads its local updates to.
    pub client_folder: String,
}

/// The thresholds a trainer must reach before it publishes a local update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExchangeThresholds {
    /// The minimal training performance.
    pub performance: f64,
    /// The minimal number of local epochs against the current global version.
    pub epoch: u32,
}

/// The answer to a [`ClientInit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInitResponse {
    pub session_id: String,
    /// Whether the server resumed an earlier session of the client.
    pub reconnect: bool,
    pub model_info: ModelInfo,
    pub exchange_at: ExchangeThresholds,
    pub storage_info: StorageInfo,
    /// The learning rate managed by the server, if any.
    pub learning_rate: Option<f64>,
}

/// Sent by a trainer once a local update is uploaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientNotifyModelUpdate {
    pub remote_path: String,
    pub file_name: String,
    /// The global version the local update was trained from.
    pub global_version_used: u64,
    pub loss: f64,
    pub performance: f64,
}

/// Broadcast by the server after each aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerNotifyModelUpdate {
    pub version: u64,
    /// The clients expected to train on `version`. Empty means every client.
    pub chosen_ids: Vec<String>,
    pub learning_rate: Option<f64>,
    pub avg_loss: f64,
    pub avg_qod: f64,
    pub total_data_size: u64,
}

/// Sent by a tester after evaluating a global version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientNotifyEvaluation {
    pub remote_path: String,
    pub performance: f64,
    pub loss: f64,
}

/// A liveness probe, or the reply to one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// The addressed client for probes of the server, the sending client otherwise.
    pub worker_id: String,
    /// Replies are never answered.
    #[serde(default)]
    pub reply: bool,
}

/// Tells the clients to terminate.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServerStop {
    pub reason: String,
}
