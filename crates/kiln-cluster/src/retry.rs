//! Retry for optimistic-concurrency conflicts.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::ClusterResult;

const MAX_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(10);

/// Run `f` until it succeeds, fails with a non-conflict error, or runs
/// out of attempts. `f` must re-read the object it writes on every call.
pub async fn retry_on_conflict<T, F, Fut>(mut f: F) -> ClusterResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ClusterResult<T>>,
{
    let mut backoff = INITIAL_BACKOFF;
    let mut attempt = 1;
    loop {
        match f().await {
            Err(e) if e.is_conflict() && attempt < MAX_ATTEMPTS => {
                debug!(attempt, error = %e, "write conflict, retrying");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                attempt += 1;
            }
            result => return result,
        }
    }
}
