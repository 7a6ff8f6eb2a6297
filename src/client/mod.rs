//! The client side of a federation.
//!
//! A [`ClientCoordinator`] performs the handshake with the server, adopts the global versions it
//! announces and, depending on its [`Role`](crate::messages::Role), trains the local model on top
//! of them or evaluates them. Local updates are published by a background loop from the single
//! [`PendingUpdate`] slot, and the state needed to resume after a crash is kept in a
//! [`ClientProfile`].

pub mod coordinator;
pub mod profile;
pub mod update;

#[cfg(test)]
mod tests;

pub use self::{
    coordinator::{Adoption, ClientCoordinator, GlobalSummary},
    profile::{ClientProfile, JsonProfileStore, ProfileStore},
    update::{LocalModelUpdateInfo, PendingUpdate},
};

use derive_more::Display;
use displaydoc::Display as DisplayDoc;
use thiserror::Error;

use crate::{
    messenger::MessengerError,
    model::{ModelError, WeightsError},
    storage::TransferError,
};

/// The phases of a client.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    #[display(fmt = "connecting")]
    Connecting,
    /// The handshake is sent, the server did not answer yet.
    #[display(fmt = "awaiting init response")]
    AwaitingInitResponse,
    #[display(fmt = "idle")]
    Idle,
    #[display(fmt = "training")]
    Training,
    #[display(fmt = "testing")]
    Testing,
    #[display(fmt = "publishing")]
    Publishing,
    /// Terminal. Entered when the server stops the federation.
    #[display(fmt = "stopped")]
    Stopped,
}

/// Errors of a client.
#[derive(Debug, DisplayDoc, Error)]
pub enum ClientError {
    /// {0}
    Messenger(#[from] MessengerError),
    /// {0}
    Transfer(#[from] TransferError),
    /// {0}
    Weights(#[from] WeightsError),
    /// Failed to read the cached global model {path}: {error}.
    Cache {
        path: String,
        error: std::io::Error,
    },
    /// The model failed: {0}.
    Model(ModelError),
    /// No global model was announced yet.
    Disconnected,
}
