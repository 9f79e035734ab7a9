//! Retrying connection acquisition.

use crate::config::RetryOptions;
use std::fmt::Display;
use std::future::Future;
use tracing::debug;

/// Run `attempt` until it succeeds or the attempt budget is spent.
///
/// Returns the value with the messages of the attempts that failed before
/// it, or every failure message in order when all attempts fail. Failed
/// attempts are separated by the randomized backoff from [`RetryOptions`].
pub async fn retry_connect<T, E, F, Fut>(
    retry: &RetryOptions,
    mut attempt: F,
) -> Result<(T, Vec<String>), Vec<String>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let attempts = retry.attempts();
    let mut failures = Vec::new();

    for n in 0..attempts {
        match attempt(n).await {
            Ok(value) => return Ok((value, failures)),
            Err(e) => {
                failures.push(e.to_string());
                if n + 1 < attempts {
                    let delay = retry.delay(n, rand::random::<f64>());
                    debug!(
                        attempt = n + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Connection attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    Err(failures)
}
