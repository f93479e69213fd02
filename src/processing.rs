pub(crate) mod bot;
pub(crate) mod checker;
pub(crate) mod feed_listener;
pub(crate) mod sender;

use std::future::Future;
use std::time::Duration;

/// Runs `job` every `period`, logging failures instead of stopping.
pub(crate) async fn run_periodically<F, Fut>(name: &str, period: Duration, job: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        log::debug!("Started {}", name);
        match job().await {
            Ok(()) => log::debug!("Finished {}", name),
            Err(e) => log::error!("{} failed with an error: {:#}", name, e),
        }
    }
}
