use backoff::backoff::Backoff;
use backoff::exponential::ExponentialBackoff;
use std::time::Duration;
use tracing::{debug, warn};

/// Jittered exponential backoff for retrying a single operation inside a
/// run (page fetches, output flushes, cache round-trips).
fn retry_schedule(base_delay_ms: u64) -> ExponentialBackoff<backoff::SystemClock> {
    ExponentialBackoff {
        current_interval: Duration::from_millis(base_delay_ms),
        initial_interval: Duration::from_millis(base_delay_ms),
        randomization_factor: 0.5,
        multiplier: 2.0,
        max_interval: Duration::from_secs(30),
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

/// Backoff pacing an instance's next trigger after repeated transient
/// failures. Never gives up; the scheduler resets it on success.
pub fn trigger_backoff(base_secs: u64, max_secs: u64) -> ExponentialBackoff<backoff::SystemClock> {
    ExponentialBackoff {
        current_interval: Duration::from_secs(base_secs),
        initial_interval: Duration::from_secs(base_secs),
        randomization_factor: 0.5,
        multiplier: 2.0,
        max_interval: Duration::from_secs(max_secs),
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

/// Run `operation` up to `max_attempts` times, sleeping the schedule's
/// delay between failures. The final error is returned unchanged.
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation: F,
    max_attempts: u32,
    base_delay_ms: u64,
    operation_name: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut schedule = retry_schedule(base_delay_ms);

    for attempt in 1.. {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = operation_name, attempt, "Succeeded after retrying");
                }
                return Ok(value);
            }
            Err(e) if attempt >= max_attempts => {
                warn!(
                    operation = operation_name,
                    attempt,
                    error = %e,
                    "Giving up"
                );
                return Err(e);
            }
            Err(e) => {
                let delay = schedule
                    .next_backoff()
                    .unwrap_or(Duration::from_millis(base_delay_ms));
                warn!(
                    operation = operation_name,
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }

    unreachable!("retry loop always returns")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn returns_first_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_backoff(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            },
            3,
            1,
            "test_op",
        )
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_backoff(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("boom".to_string())
            },
            3,
            1,
            "test_op",
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_backoff(
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("not yet".to_string())
                } else {
                    Ok(42)
                }
            },
            5,
            1,
            "test_op",
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn trigger_backoff_is_capped() {
        let mut schedule = trigger_backoff(30, 120);
        let mut last = Duration::ZERO;
        for _ in 0..10 {
            last = schedule.next_backoff().expect("trigger backoff never ends");
        }
        // Jitter may push past the cap, but never past 1.5x.
        assert!(last <= Duration::from_secs(180));
    }
}
