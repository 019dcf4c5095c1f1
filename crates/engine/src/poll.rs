//! Bounded retry for eventually consistent assertions

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{AccordError, AccordResult, ErrorKind};
use crate::fixtures::queue::MessageQueue;

pub const DEFAULT_WAIT_SECONDS: u64 = 5;
pub const DEFAULT_DRAIN_SECONDS: u64 = 20;
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

const ATTEMPTS_PER_SECOND: u64 = 1000 / POLL_INTERVAL.as_millis() as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::for_seconds(None)
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Attempts spread over `seconds` at the standard interval
    pub fn for_seconds(seconds: Option<u64>) -> Self {
        let seconds = seconds.unwrap_or(DEFAULT_WAIT_SECONDS);
        let attempts = (seconds * ATTEMPTS_PER_SECOND).clamp(1, u32::MAX as u64) as u32;
        Self::new(attempts, POLL_INTERVAL)
    }
}

/// Runs `action` until it succeeds or the attempt budget is spent.
///
/// The action receives the 1-based attempt number. Configuration errors are
/// returned at once; any other failure is logged and retried. After the last
/// attempt the most recent error is returned unchanged. There is no sleep
/// after a success or after the final attempt.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, label: &str, mut action: F) -> AccordResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = AccordResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match action(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}", label, attempt);
                }
                return Ok(value);
            }
            Err(e) if e.kind() == ErrorKind::Configuration => return Err(e),
            Err(e) => {
                let category = match &e {
                    AccordError::PathNotFound { .. } => "path not found",
                    _ if e.kind() == ErrorKind::Assertion => "assertion failed",
                    _ => "error",
                };
                if attempt >= max_attempts {
                    warn!(
                        "{} gave up after {} attempts ({}): {}",
                        label, attempt, category, e
                    );
                    return Err(e);
                }
                info!(
                    "{} attempt {}/{} ({}): {}",
                    label, attempt, max_attempts, category, e
                );
            }
        }
        sleep(policy.interval).await;
        attempt += 1;
    }
}

/// Waits until every active queue reports no pending messages.
///
/// An empty reading is confirmed by a second one, which narrows (but does not
/// close) the window where handling one message enqueues another.
pub async fn wait_for_drain(queue: &dyn MessageQueue, seconds: Option<u64>) -> AccordResult<()> {
    let seconds = seconds.unwrap_or(DEFAULT_DRAIN_SECONDS);
    let policy = RetryPolicy::for_seconds(Some(seconds));

    let drained = retry(policy, "Queue drain", |_| async move {
        if pending_total(queue).await? == 0 && pending_total(queue).await? == 0 {
            Ok(())
        } else {
            Err(AccordError::assertion("queues still have pending messages"))
        }
    })
    .await;

    drained.map_err(|e| match e.kind() {
        ErrorKind::Assertion => AccordError::assertion(format!(
            "Queue processing did not complete after {} seconds",
            seconds
        )),
        _ => e,
    })
}

async fn pending_total(queue: &dyn MessageQueue) -> AccordResult<u64> {
    let counts = queue.pending_counts().await?;
    let busy: Vec<_> = counts.iter().filter(|(_, n)| *n > 0).collect();
    for (name, count) in &busy {
        debug!("Queue {} has {} pending message(s)", name, count);
    }
    Ok(busy.iter().map(|(_, n)| *n).sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[test]
    fn test_policy_from_seconds() {
        assert_eq!(RetryPolicy::default().max_attempts, 20);
        assert_eq!(RetryPolicy::for_seconds(Some(20)).max_attempts, 80);
        assert_eq!(RetryPolicy::for_seconds(Some(0)).max_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_third_attempt_does_not_sleep_after() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let value = retry(RetryPolicy::new(5, POLL_INTERVAL), "test", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(AccordError::assertion("not yet"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), POLL_INTERVAL * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_budget_and_returns_last_error() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let err = retry(RetryPolicy::new(5, POLL_INTERVAL), "test", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err::<(), _>(AccordError::assertion(format!("attempt {}", attempt))) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(err.to_string(), "Assertion failed: attempt 5");
        assert_eq!(started.elapsed(), POLL_INTERVAL * 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configuration_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let err = retry(RetryPolicy::new(5, POLL_INTERVAL), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(AccordError::VariableNotFound("TOKEN".into())) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, AccordError::VariableNotFound(_)));
    }
}
