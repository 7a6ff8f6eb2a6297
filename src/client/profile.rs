//! The durable state of a client.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::Context;

/// The file name of the profile inside the working directory of a client.
pub const PROFILE_FILE: &str = "profile.json";

/// What a client remembers across restarts.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientProfile {
    pub session_id: String,
    pub client_id: String,
    pub global_model_name: String,
    /// The number of local epochs trained so far.
    pub local_epoch: u64,
    pub local_qod: f64,
    /// The last adopted global version.
    pub last_global_version: u64,
    pub last_global_avg_loss: f64,
    pub last_global_avg_qod: f64,
    pub last_global_update_data_size: u64,
}

#[async_trait]
/// Persistence of the [`ClientProfile`].
pub trait ProfileStore: Send + Sync + 'static {
    /// Loads the saved profile.
    ///
    /// # Behavior
    ///
    /// A missing or unreadable profile is `None`, the client then starts from scratch.
    async fn load(&self) -> Option<ClientProfile>;

    /// Replaces the saved profile.
    async fn save(&self, profile: &ClientProfile) -> anyhow::Result<()>;
}

/// A profile saved as JSON.
#[derive(Debug, Clone)]
pub struct JsonProfileStore {
    path: PathBuf,
}

impl JsonProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The profile of the client working in `working_dir`.
    pub fn in_dir(working_dir: &Path) -> Self {
        Self::new(working_dir.join(PROFILE_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ProfileStore for JsonProfileStore {
    async fn load(&self) -> Option<ClientProfile> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!("failed to read {}: {}", self.path.display(), err);
                return None;
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(profile) => Some(profile),
            Err(err) => {
                warn!("ignoring corrupt profile {}: {}", self.path.display(), err);
                None
            }
        }
    }

    async fn save(&self, profile: &ClientProfile) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let raw = serde_json::to_vec_pretty(profile).context("failed to serialize the profile")?;
        // a crash while saving leaves the previous profile intact
        let partial = self.path.with_extension("json.partial");
        tokio::fs::write(&partial, raw)
            .await
            .with_context(|| format!("failed to write {}", partial.display()))?;
        tokio::fs::rename(&partial, &self.path)
            .await
            .with_context(|| format!("failed to move {}", partial.display()))
    }
}
