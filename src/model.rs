//! Model weights and the interface of the trainable model of a client.

use std::ops::{Add, Mul};

use derive_more::From;
use displaydoc::Display;
use thiserror::Error;

/// The error type of the model adapters.
pub type ModelError = anyhow::Error;

/// The flattened weights of a model: one tensor per layer.
#[derive(Debug, Clone, Default, PartialEq, From, Serialize, Deserialize)]
pub struct Weights(pub Vec<Vec<f64>>);

/// Errors of the weights codec and arithmetic.
#[derive(Debug, Display, Error)]
pub enum WeightsError {
    /// Failed to encode weights: {0}.
    Encode(bincode::Error),
    /// Failed to decode weights: {0}.
    Decode(bincode::Error),
    /// Weights have incompatible shapes.
    ShapeMismatch,
}

impl Weights {
    pub fn layers(&self) -> &[Vec<f64>] {
        &self.0
    }

    /// The length of every layer.
    pub fn shape(&self) -> Vec<usize> {
        self.0.iter().map(Vec::len).collect()
    }

    /// Encodes the weights into an artifact.
    pub fn encode(&self) -> Result<Vec<u8>, WeightsError> {
        bincode::serialize(self).map_err(WeightsError::Encode)
    }

    /// Decodes the weights of an artifact.
    pub fn decode(bytes: &[u8]) -> Result<Self, WeightsError> {
        bincode::deserialize(bytes).map_err(WeightsError::Decode)
    }

    /// All-zero weights of the given shape.
    pub fn zeros(shape: &[usize]) -> Self {
        Self(shape.iter().map(|len| vec![0.; *len]).collect())
    }

    /// Computes `self + factor * other` in place.
    pub fn add_scaled(&mut self, other: &Weights, factor: f64) -> Result<(), WeightsError> {
        if self.shape() != other.shape() {
            return Err(WeightsError::ShapeMismatch);
        }
        for (layer, other) in self.0.iter_mut().zip(other.0.iter()) {
            for (weight, other) in layer.iter_mut().zip(other.iter()) {
                *weight += factor * other;
            }
        }
        Ok(())
    }
}

impl Mul<f64> for &Weights {
    type Output = Weights;

    fn mul(self, factor: f64) -> Weights {
        Weights(
            self.0
                .iter()
                .map(|layer| layer.iter().map(|weight| weight * factor).collect())
                .collect(),
        )
    }
}

impl Add for &Weights {
    type Output = Result<Weights, WeightsError>;

    fn add(self, other: &Weights) -> Self::Output {
        let mut sum = self.clone();
        sum.add_scaled(other, 1.)?;
        Ok(sum)
    }
}

/// The metrics of a training epoch or of an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Metrics {
    /// The accuracy, in `[0, 1]`.
    pub performance: f64,
    pub loss: f64,
}

/// The trainable model of a client.
///
/// The methods are blocking. They are run on the blocking thread pool and never concurrently.
#[cfg_attr(test, mockall::automock)]
pub trait ModelAdapter: Send + 'static {
    fn weights(&self) -> Weights;

    fn set_weights(&mut self, weights: Weights) -> Result<(), ModelError>;

    /// Trains one epoch on the local dataset.
    fn train_epoch(&mut self, learning_rate: f64) -> Result<Metrics, ModelError>;

    /// Evaluates the model on the local dataset.
    fn evaluate(&mut self) -> Result<Metrics, ModelError>;
}
