use std::{fmt, future::Future};

use futures_retry::{ErrorHandler, FutureRetry, RetryPolicy};

use crate::settings::RetrySettings;

/// The error returned once every attempt of a retried operation failed.
#[derive(Debug)]
pub(crate) struct Exhausted<E> {
    pub attempts: usize,
    pub error: E,
}

/// Retries an operation with a fixed backoff until it succeeds or the attempt limit is reached.
struct FixedBackoff<'a> {
    operation: &'a str,
    settings: RetrySettings,
}

impl<'a, E> ErrorHandler<E> for FixedBackoff<'a>
where
    E: fmt::Display,
{
    type OutError = E;

    fn handle(&mut self, attempt: usize, error: E) -> RetryPolicy<E> {
        if attempt >= self.settings.attempts {
            warn!(
                "{} failed after {} attempts: {}",
                self.operation, attempt, error
            );
            RetryPolicy::ForwardError(error)
        } else {
            debug!(
                attempt,
                "{} failed: {}, retrying in {:?}",
                self.operation,
                error,
                self.settings.backoff()
            );
            RetryPolicy::WaitRetry(self.settings.backoff())
        }
    }
}

/// Runs the future produced by `factory` at most `settings.attempts` times.
///
/// The total number of attempts made is returned together with the output.
pub(crate) async fn with_retry<F, Fut, T, E>(
    operation: &str,
    settings: RetrySettings,
    factory: F,
) -> Result<(T, usize), Exhausted<E>>
where
    F: FnMut() -> Fut + Unpin,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let handler = FixedBackoff {
        operation,
        settings,
    };
    FutureRetry::new(factory, handler)
        .await
        .map_err(|(error, attempts)| Exhausted { attempts, error })
}
