use std::{path::PathBuf, process, sync::Arc};

use anyhow::bail;
use rand::{rngs::StdRng, Rng, SeedableRng};
use structopt::StructOpt;
use tokio::signal;
use tracing_subscriber::FmtSubscriber;

use asynfed::{
    client::{ClientCoordinator, JsonProfileStore},
    messenger::RedisTransport,
    model::{Metrics, ModelAdapter, ModelError, Weights},
    settings::{ClientSettings, LoggingSettings},
    storage::BackendConnector,
};

#[macro_use]
extern crate tracing;

#[derive(Debug, StructOpt)]
#[structopt(name = "Client")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,

    /// Seed of the synthetic dataset
    #[structopt(long, default_value = "0")]
    seed: u64,
}

const FEATURES: usize = 4;
const TRUE_WEIGHTS: [f64; FEATURES] = [1.5, -2., 0.5, 3.];
const TRUE_BIAS: f64 = 0.7;

/// A linear regression trained by full-batch gradient descent on a synthetic dataset.
///
/// The weights are two layers: the coefficients, then the bias.
struct LinearRegression {
    coefficients: Vec<f64>,
    bias: f64,
    samples: Vec<([f64; FEATURES], f64)>,
}

impl LinearRegression {
    fn synthetic(size: u64, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let samples = (0..size.max(1))
            .map(|_| {
                let mut x = [0.; FEATURES];
                x.iter_mut().for_each(|x| *x = rng.gen_range(-1.0..1.0));
                let noise: f64 = rng.gen_range(-0.1..0.1);
                let y = dot(&TRUE_WEIGHTS, &x) + TRUE_BIAS + noise;
                (x, y)
            })
            .collect();
        Self {
            coefficients: vec![0.; FEATURES],
            bias: 0.,
            samples,
        }
    }

    fn predict(&self, x: &[f64; FEATURES]) -> f64 {
        dot(&self.coefficients, x) + self.bias
    }

    /// The mean squared error and the coefficient of determination, clamped to `[0, 1]`.
    fn metrics(&self) -> Metrics {
        let n = self.samples.len() as f64;
        let mean = self.samples.iter().map(|(_, y)| y).sum::<f64>() / n;
        let (residual, total) = self
            .samples
            .iter()
            .fold((0., 0.), |(residual, total), (x, y)| {
                (
                    residual + (y - self.predict(x)).powi(2),
                    total + (y - mean).powi(2),
                )
            });
        let r2 = if total > 0. { 1. - residual / total } else { 0. };
        Metrics {
            performance: r2.clamp(0., 1.),
            loss: residual / n,
        }
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(a, b)| a * b).sum()
}

impl ModelAdapter for LinearRegression {
    fn weights(&self) -> Weights {
        Weights(vec![self.coefficients.clone(), vec![self.bias]])
    }

    fn set_weights(&mut self, weights: Weights) -> Result<(), ModelError> {
        if weights.shape() != [FEATURES, 1] {
            bail!("expected weights of shape [{}, 1], got {:?}", FEATURES, weights.shape());
        }
        let Weights(mut layers) = weights;
        self.bias = layers[1][0];
        self.coefficients = layers.swap_remove(0);
        Ok(())
    }

    fn train_epoch(&mut self, learning_rate: f64) -> Result<Metrics, ModelError> {
        let n = self.samples.len() as f64;
        let mut gradient = [0.; FEATURES];
        let mut bias_gradient = 0.;
        for (x, y) in &self.samples {
            let error = self.predict(x) - y;
            gradient
                .iter_mut()
                .zip(x)
                .for_each(|(g, x)| *g += 2. * error * x / n);
            bias_gradient += 2. * error / n;
        }
        self.coefficients
            .iter_mut()
            .zip(gradient)
            .for_each(|(w, g)| *w -= learning_rate * g);
        self.bias -= learning_rate * bias_gradient;
        Ok(self.metrics())
    }

    fn evaluate(&mut self) -> Result<Metrics, ModelError> {
        Ok(self.metrics())
    }
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let mut settings = ClientSettings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let LoggingSettings { filter } = std::mem::take(&mut settings.log);
    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_ansi(true)
        .init();

    let transport = RedisTransport::new(settings.bus.url.clone())
        .await
        .expect("failed to connect to the message bus");
    let profiles = JsonProfileStore::in_dir(&settings.client.working_dir);
    let model = LinearRegression::synthetic(settings.dataset.size, opt.seed);

    let client = Arc::new(
        ClientCoordinator::new(settings, BackendConnector, transport, model, profiles).await,
    );
    tokio::select! {
        result = client.run() => match result {
            Ok(()) => info!("shutting down: federation stopped"),
            Err(err) => {
                error!("shutting down: {}", err);
                process::exit(1);
            }
        },
        _ = signal::ctrl_c() => {
            warn!("shutting down: interrupted");
            client.shutdown();
        }
    }
}
