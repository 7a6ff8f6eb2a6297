use std::collections::BTreeSet;

use super::{weighted_average, AggregationStrategy, Contribution, MergeError, Selection};
use crate::{
    messages::Role,
    model::Weights,
    schedule::LearningRateSchedule,
    server::registry::Worker,
};

/// Federated averaging of the up-to-date workers.
///
/// Only local updates at most `max_staleness` versions behind contribute, weighted by data size,
/// and their average replaces the global model. Stragglers are left out of the selection until
/// they catch up.
#[derive(Debug, Clone, PartialEq)]
pub struct SynchronousStrategy {
    max_staleness: u64,
    schedule: LearningRateSchedule,
}

impl SynchronousStrategy {
    pub fn new(max_staleness: u64, schedule: LearningRateSchedule) -> Self {
        Self {
            max_staleness,
            schedule,
        }
    }

    fn is_eligible(&self, worker: &Worker, next_version: u64) -> bool {
        // a worker which never reported an update joins whatever version is current
        let fresh = worker.current_version == 0;
        worker.role == Role::Trainer
            && worker.is_connected
            && (fresh || next_version.saturating_sub(worker.current_version) <= self.max_staleness)
    }
}

impl AggregationStrategy for SynchronousStrategy {
    fn select_participants(&self, workers: &[Worker], next_version: u64) -> Selection {
        let chosen: BTreeSet<_> = workers
            .iter()
            .filter(|worker| self.is_eligible(worker, next_version))
            .map(|worker| worker.worker_id.clone())
            .collect();
        if chosen.is_empty() {
            // nobody would ever train again
            Selection::All
        } else {
            Selection::Only(chosen)
        }
    }

    fn contribution_weight(&self, data_size: u64, staleness: u64) -> f64 {
        if self.accepts(staleness) {
            data_size as f64
        } else {
            0.
        }
    }

    fn accepts(&self, staleness: u64) -> bool {
        staleness <= self.max_staleness
    }

    fn merge(
        &self,
        _previous: Option<&Weights>,
        contributions: &[Contribution],
    ) -> Result<Weights, MergeError> {
        if contributions.iter().all(|c| !self.accepts(c.staleness)) {
            return Err(MergeError::NoEligibleContribution);
        }
        // eligible updates without reported data sizes count equally
        let all_empty = contributions
            .iter()
            .filter(|c| self.accepts(c.staleness))
            .all(|c| c.data_size == 0);
        if all_empty {
            let eligible: Vec<_> = contributions
                .iter()
                .filter(|c| self.accepts(c.staleness))
                .cloned()
                .collect();
            return weighted_average(self, &eligible, true);
        }
        weighted_average(self, contributions, false)
    }

    fn learning_rate(&self, version: u64) -> Option<f64> {
        self.schedule.rate(version)
    }
}
