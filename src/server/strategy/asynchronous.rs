use super::{weighted_average, AggregationStrategy, Contribution, MergeError, Selection};
use crate::{model::Weights, schedule::LearningRateSchedule, server::registry::Worker};

/// Staleness-weighted blending.
///
/// A local update lagging `s` versions behind weighs `data_size * (1 + s)^-a`. The weighted
/// average of the updates is mixed into the previous global model with the rate
/// `mixing_rate * (discounted data size / data size)`, so a cohort of stale updates moves the
/// global model less than a fresh one.
#[derive(Debug, Clone, PartialEq)]
pub struct AsynchronousStrategy {
    staleness_exponent: f64,
    mixing_rate: f64,
    schedule: LearningRateSchedule,
}

impl AsynchronousStrategy {
    pub fn new(staleness_exponent: f64, mixing_rate: f64, schedule: LearningRateSchedule) -> Self {
        Self {
            staleness_exponent: staleness_exponent.max(0.),
            mixing_rate: mixing_rate.clamp(0., 1.),
            schedule,
        }
    }

    fn discount(&self, staleness: u64) -> f64 {
        (1. + staleness as f64).powf(-self.staleness_exponent)
    }

    /// The share of the averaged updates mixed into the previous global model.
    pub fn mixing_factor(&self, contributions: &[Contribution]) -> f64 {
        let (discounted, total) = contributions
            .iter()
            .fold((0., 0.), |(discounted, total), c| {
                let size = c.data_size as f64;
                (discounted + size * self.discount(c.staleness), total + size)
            });
        if total > 0. {
            self.mixing_rate * discounted / total
        } else {
            // no reported data sizes
            let n = contributions.len().max(1) as f64;
            self.mixing_rate
                * contributions
                    .iter()
                    .map(|c| self.discount(c.staleness))
                    .sum::<f64>()
                / n
        }
    }
}

impl AggregationStrategy for AsynchronousStrategy {
    fn select_participants(&self, _workers: &[Worker], _next_version: u64) -> Selection {
        Selection::All
    }

    fn contribution_weight(&self, data_size: u64, staleness: u64) -> f64 {
        data_size as f64 * self.discount(staleness)
    }

    fn merge(
        &self,
        previous: Option<&Weights>,
        contributions: &[Contribution],
    ) -> Result<Weights, MergeError> {
        let average = weighted_average(self, contributions, true)?;
        let previous = match previous {
            Some(previous) => previous,
            None => return Ok(average),
        };

        let alpha = self.mixing_factor(contributions);
        let mut merged = previous * (1. - alpha);
        merged
            .add_scaled(&average, alpha)
            .map_err(|error| MergeError::Incompatible {
                worker_id: String::from("<global model>"),
                error,
            })?;
        Ok(merged)
    }

    fn learning_rate(&self, version: u64) -> Option<f64> {
        self.schedule.rate(version)
    }
}
