//! Learning-rate schedules.

use std::f64::consts::PI;

use crate::settings::LearningRateSettings;

/// A learning-rate schedule indexed by a step counter.
///
/// The server indexes it by global version, a client by local epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LearningRateSchedule {
    /// No managed rate.
    Unmanaged,
    /// A cosine decay from `initial` to `floor` over `total_steps` steps.
    Cosine {
        initial: f64,
        floor: f64,
        total_steps: u64,
    },
}

impl LearningRateSchedule {
    pub fn new(settings: &LearningRateSettings) -> Self {
        match settings.total_steps {
            Some(total_steps) if total_steps > 0 => Self::Cosine {
                initial: settings.initial,
                floor: settings.floor,
                total_steps,
            },
            _ => Self::Unmanaged,
        }
    }

    /// The rate at `step`.
    ///
    /// `max(floor, 0.5 * initial * (1 + cos(pi * step / total)))` up to `total`, `floor` beyond.
    pub fn rate(&self, step: u64) -> Option<f64> {
        match *self {
            Self::Unmanaged => None,
            Self::Cosine {
                floor, total_steps, ..
            } if step >= total_steps => Some(floor),
            Self::Cosine {
                initial,
                floor,
                total_steps,
            } => {
                let progress = step as f64 / total_steps as f64;
                Some((0.5 * initial * (1. + (PI * progress).cos())).max(floor))
            }
        }
    }
}
