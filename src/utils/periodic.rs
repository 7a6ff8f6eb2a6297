use std::{future::Future, time::Duration};

use tokio::{
    sync::watch,
    time::{self, MissedTickBehavior},
};

/// Runs `tick` every `period` until `shutdown` turns `true`.
///
/// The first tick happens immediately. A tick that overruns the period delays the next one
/// instead of bursting. A running tick is never interrupted.
pub(crate) async fn periodically<F, Fut>(
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = interval.tick() => tick().await,
        }
    }
}
