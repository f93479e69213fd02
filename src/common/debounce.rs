use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

#[derive(Default)]
struct TriggerState {
    pending: AtomicBool,
    notify: Notify,
}

/// Cheap cloneable wake-up signal. Signals fired while the consumer is busy
/// collapse into a single pending wake-up.
#[derive(Clone, Default)]
pub(crate) struct Trigger {
    state: Arc<TriggerState>,
}

impl Trigger {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fire(&self) {
        self.state.pending.store(true, Ordering::SeqCst);
        self.state.notify.notify_one();
    }

    async fn fired(&self) {
        self.state.notify.notified().await;
    }

    fn take_pending(&self) -> bool {
        self.state.pending.swap(false, Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn is_fired(&self) -> bool {
        self.state.pending.load(Ordering::SeqCst)
    }
}

/// Runs `job` once per burst of signals, `delay` after the burst started.
pub(crate) async fn run_debounced<F, Fut>(trigger: Trigger, delay: Duration, job: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        trigger.fired().await;
        tokio::time::sleep(delay).await;
        if !trigger.take_pending() {
            continue;
        }
        job().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn burst_is_coalesced() {
        let trigger = Trigger::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let task = {
            let runs = runs.clone();
            tokio::spawn(run_debounced(
                trigger.clone(),
                Duration::from_secs(1),
                move || {
                    let runs = runs.clone();
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                    }
                },
            ))
        };

        for _ in 0..10 {
            trigger.fire();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        trigger.fire();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        task.abort();
    }
}
