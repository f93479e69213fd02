use std::future::Future;
use std::time::Duration;

/// Calls `f` up to `attempts` times while `should_retry` accepts the error,
/// sleeping `delay` between attempts.
pub(crate) async fn retry<T, E, F, Fut, P>(
    attempts: usize,
    delay: Duration,
    mut f: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < attempts && should_retry(&error) => {
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }
}
