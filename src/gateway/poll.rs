//! Bounded convergence waits.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::time::{sleep, timeout};
use tracing::debug;

use crate::error::{Error, Result};

/// Re-evaluates `check` every `interval` until it reports `true`, returns an
/// error, or `limit` elapses.
///
/// The first check runs immediately. The whole loop, including in-flight
/// checks, is bounded by `limit`, so a call never outlives `limit` plus the
/// time needed to drop the pending check.
pub async fn poll_until<F, Fut>(
    what: &str,
    interval: Duration,
    limit: Duration,
    mut check: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = Instant::now();

    let outcome = timeout(limit, async {
        loop {
            if check().await? {
                return Ok(());
            }
            debug!(
                "waiting for {} ({} seconds elapsed)",
                what,
                start.elapsed().as_secs()
            );
            sleep(interval).await;
        }
    })
    .await;

    match outcome {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            what: what.to_string(),
            duration: limit,
        }),
    }
}
