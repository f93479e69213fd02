use std::future::Future;

use tokio::sync::Mutex;

/// Lets a single run of a job through at a time. Calls made while a run is
/// in progress are dropped instead of queued.
#[derive(Default)]
pub(crate) struct OneLimit {
    running: Mutex<()>,
}

impl OneLimit {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn run<F, T>(&self, job: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        let _guard = self.running.try_lock().ok()?;
        Some(job.await)
    }
}
