//! Retry policy with exponential backoff.

use super::config::RetryConfig;
use super::transport::{ClientError, HttpResponse};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Lower bound of the jitter factor; delays are scaled into `[0.5, 1.0]`.
const JITTER_FLOOR: f64 = 0.5;

/// Returns the delay to sleep before retry number `attempt`.
///
/// With jitter the delay is drawn from `[max(base / 2, previous base), base]`.
/// Every jittered delay stays at or above the previous attempt's ceiling, so
/// the sequence never decreases; once the cap is reached it stays at `max_delay`.
pub fn backoff(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config.delay_for_attempt(attempt);
    if !config.jitter || base.is_zero() {
        return base;
    }
    let previous = match attempt.checked_sub(1) {
        Some(prev) => config.delay_for_attempt(prev),
        None => Duration::ZERO,
    };
    let floor = base.mul_f64(JITTER_FLOOR).max(previous).min(base);
    let secs = rand::thread_rng().gen_range(floor.as_secs_f64()..=base.as_secs_f64());
    Duration::from_secs_f64(secs)
}

enum Outcome {
    Done,
    Retry(&'static str),
}

fn classify(config: &RetryConfig, result: &Result<HttpResponse, ClientError>) -> Outcome {
    match result {
        Ok(response) if config.is_retryable(response.status) => Outcome::Retry("retryable status"),
        Ok(_) => Outcome::Done,
        // an open circuit will reject the retry as well
        Err(ClientError::CircuitOpen { .. }) | Err(ClientError::Cancelled) => Outcome::Done,
        Err(_) => Outcome::Retry("error"),
    }
}

/// Runs `attempt` up to `max_retries + 1` times.
///
/// Errors and retryable statuses are retried; once retries are exhausted the
/// last result, response or error, is returned as is.
pub async fn run<F, Fut>(config: &RetryConfig, client: &str, mut attempt: F) -> Result<HttpResponse, ClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<HttpResponse, ClientError>>,
{
    let mut retry = 0;
    loop {
        let result = attempt().await;
        match classify(config, &result) {
            Outcome::Done => return result,
            Outcome::Retry(reason) if retry < config.max_retries => {
                let delay = backoff(config, retry);
                match &result {
                    Ok(response) => debug!(
                        client,
                        status = response.status,
                        "retrying ({}/{}) after {:?}: {}",
                        retry + 1,
                        config.max_retries,
                        delay,
                        reason
                    ),
                    Err(e) => debug!(
                        client,
                        error = %e,
                        "retrying ({}/{}) after {:?}: {}",
                        retry + 1,
                        config.max_retries,
                        delay,
                        reason
                    ),
                }
                tokio::time::sleep(delay).await;
                retry += 1;
            }
            Outcome::Retry(reason) => {
                warn!(client, "giving up after {} retries: {}", retry, reason);
                return result;
            }
        }
    }
}
