//! Aggregation strategies.
//!
//! A strategy decides which workers are expected to train on the next global version, how much
//! each completed local update contributes to it and how the contributions are folded into the
//! previous global model.

mod asynchronous;
mod synchronous;

use std::collections::BTreeSet;

use derive_more::From;
use displaydoc::Display;
use thiserror::Error;

pub use self::{asynchronous::AsynchronousStrategy, synchronous::SynchronousStrategy};
use super::registry::{Worker, WorkerId};
use crate::{
    model::{Weights, WeightsError},
    schedule::LearningRateSchedule,
    settings::{AggregationSettings, StrategyKind},
};

/// The workers expected to train on the next global version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    Only(BTreeSet<WorkerId>),
}

impl Selection {
    /// The chosen ids as broadcast to the clients. Empty means every client.
    pub fn chosen_ids(&self) -> Vec<String> {
        match self {
            Self::All => Vec::new(),
            Self::Only(ids) => ids.iter().cloned().collect(),
        }
    }
}

/// A downloaded local update, ready to be merged.
#[derive(Debug, Clone, PartialEq)]
pub struct Contribution {
    pub worker_id: WorkerId,
    pub weights: Weights,
    pub data_size: u64,
    /// How many versions the update lags behind the current global version.
    pub staleness: u64,
    pub loss: f64,
    pub qod: f64,
}

/// Errors of a merge.
#[derive(Debug, Display, Error)]
pub enum MergeError {
    /// No contribution to merge.
    NoContribution,
    /// Every contribution has a zero weight.
    NoEligibleContribution,
    /// Incompatible contribution of {worker_id}: {error}.
    Incompatible {
        worker_id: WorkerId,
        error: WeightsError,
    },
}

/// The behavior of an aggregation strategy.
pub trait AggregationStrategy {
    /// Selects the workers expected to train on `next_version`.
    fn select_participants(&self, workers: &[Worker], next_version: u64) -> Selection;

    /// The weight of a local update.
    ///
    /// # Behavior
    ///
    /// The weight is non-decreasing in `data_size` and non-increasing in `staleness`.
    fn contribution_weight(&self, data_size: u64, staleness: u64) -> f64;

    /// Whether a local update lagging `staleness` versions behind may contribute at all.
    fn accepts(&self, _staleness: u64) -> bool {
        true
    }

    /// Folds the contributions into the previous global model, if any.
    fn merge(
        &self,
        previous: Option<&Weights>,
        contributions: &[Contribution],
    ) -> Result<Weights, MergeError>;

    /// The learning rate for clients training on top of `version`.
    fn learning_rate(&self, version: u64) -> Option<f64>;
}

/// The aggregation strategy chosen in the settings.
#[derive(Debug, Clone, From)]
pub enum Strategy {
    Asynchronous(AsynchronousStrategy),
    Synchronous(SynchronousStrategy),
}

impl Strategy {
    pub fn from_settings(settings: &AggregationSettings) -> Self {
        let schedule = LearningRateSchedule::new(&settings.learning_rate);
        match settings.strategy {
            StrategyKind::Asynchronous => AsynchronousStrategy::new(
                settings.staleness_exponent,
                settings.mixing_rate,
                schedule,
            )
            .into(),
            StrategyKind::Synchronous => {
                SynchronousStrategy::new(settings.max_staleness, schedule).into()
            }
        }
    }
}

impl AggregationStrategy for Strategy {
    fn select_participants(&self, workers: &[Worker], next_version: u64) -> Selection {
        match self {
            Self::Asynchronous(strategy) => strategy.select_participants(workers, next_version),
            Self::Synchronous(strategy) => strategy.select_participants(workers, next_version),
        }
    }

    fn contribution_weight(&self, data_size: u64, staleness: u64) -> f64 {
        match self {
            Self::Asynchronous(strategy) => strategy.contribution_weight(data_size, staleness),
            Self::Synchronous(strategy) => strategy.contribution_weight(data_size, staleness),
        }
    }

    fn accepts(&self, staleness: u64) -> bool {
        match self {
            Self::Asynchronous(strategy) => strategy.accepts(staleness),
            Self::Synchronous(strategy) => strategy.accepts(staleness),
        }
    }

    fn merge(
        &self,
        previous: Option<&Weights>,
        contributions: &[Contribution],
    ) -> Result<Weights, MergeError> {
        match self {
            Self::Asynchronous(strategy) => strategy.merge(previous, contributions),
            Self::Synchronous(strategy) => strategy.merge(previous, contributions),
        }
    }

    fn learning_rate(&self, version: u64) -> Option<f64> {
        match self {
            Self::Asynchronous(strategy) => strategy.learning_rate(version),
            Self::Synchronous(strategy) => strategy.learning_rate(version),
        }
    }
}

/// The contributions which take part in a merge.
///
/// These are the accepted contributions with a positive weight, or every accepted contribution if
/// none of them has a positive weight.
pub fn participants<'a, S>(
    strategy: &S,
    contributions: &'a [Contribution],
) -> Vec<&'a Contribution>
where
    S: AggregationStrategy + ?Sized,
{
    let accepted: Vec<&Contribution> = contributions
        .iter()
        .filter(|c| strategy.accepts(c.staleness))
        .collect();
    let weighted: Vec<&Contribution> = accepted
        .iter()
        .copied()
        .filter(|c| strategy.contribution_weight(c.data_size, c.staleness) > 0.)
        .collect();
    if weighted.is_empty() {
        accepted
    } else {
        weighted
    }
}

/// The weighted average of the contributions.
///
/// Falls back to a plain average if every weight is zero and `uniform_fallback` is set.
fn weighted_average<S>(
    strategy: &S,
    contributions: &[Contribution],
    uniform_fallback: bool,
) -> Result<Weights, MergeError>
where
    S: AggregationStrategy + ?Sized,
{
    let first = contributions.first().ok_or(MergeError::NoContribution)?;

    let mut weights: Vec<f64> = contributions
        .iter()
        .map(|c| strategy.contribution_weight(c.data_size, c.staleness))
        .collect();
    let mut total: f64 = weights.iter().sum();
    if total <= 0. {
        if !uniform_fallback {
            return Err(MergeError::NoEligibleContribution);
        }
        weights = vec![1.; contributions.len()];
        total = contributions.len() as f64;
    }

    let mut average = Weights::zeros(&first.weights.shape());
    for (contribution, weight) in contributions.iter().zip(weights) {
        if weight == 0. {
            continue;
        }
        average
            .add_scaled(&contribution.weights, weight / total)
            .map_err(|error| MergeError::Incompatible {
                worker_id: contribution.worker_id.clone(),
                error,
            })?;
    }
    Ok(average)
}
