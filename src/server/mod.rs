//! The server side of a federation.
//!
//! The [`ServerCoordinator`] answers the handshakes of the clients, records their local updates
//! in the [`WorkerRegistry`] and periodically folds the completed updates into a new version of
//! the [`GlobalModel`], following the configured [`Strategy`].

pub mod aggregation;
pub mod coordinator;
pub mod registry;
pub mod strategy;

#[cfg(test)]
mod tests;

pub use self::{
    aggregation::{AggregationError, AggregationOutcome, GlobalModel, GlobalModelState},
    coordinator::{ServerCoordinator, ServerError},
    registry::{LocalUpdate, Registration, Worker, WorkerId, WorkerRegistry},
    strategy::{AggregationStrategy, Selection, Strategy},
};
