use std::future::Future;
use std::time::Duration;

use crate::errors::ManagerError;
use crate::phase::Phase;

/// Run `step` to completion or fail with `Timeout` once `timeout` elapses.
///
/// On timeout the step future is dropped, abandoning any request in flight.
pub async fn with_deadline<T, F>(phase: Phase, timeout: Duration, step: F) -> Result<T, ManagerError>
where
    F: Future<Output = Result<T, ManagerError>>,
{
    match tokio::time::timeout(timeout, step).await {
        Ok(result) => result,
        Err(_) => Err(ManagerError::Timeout {
            step: phase,
            seconds: timeout.as_secs(),
        }),
    }
}
