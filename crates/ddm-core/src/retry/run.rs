//! Retry loop: run a closure until success or policy says stop.

use super::classify;
use super::error::SegmentError;
use super::policy::{RetryDecision, RetryPolicy};

/// Runs a closure until it succeeds or the retry policy says to stop.
/// On retryable failure, sleeps for the backoff duration then tries again.
///
/// `made_progress` is polled after each transient failure. If it reports
/// true, the failure streak resets to a fresh attempt budget before the
/// policy decides on a backoff — a heartbeat rule so an attempt that moved
/// real bytes before dying doesn't spend down the same retry budget as one
/// that failed outright.
pub fn run_with_retry<F, P>(
    policy: &RetryPolicy,
    mut f: F,
    mut made_progress: P,
) -> Result<(), SegmentError>
where
    F: FnMut() -> Result<(), SegmentError>,
    P: FnMut() -> bool,
{
    let mut attempt = 1u32;
    loop {
        match f() {
            Ok(()) => return Ok(()),
            Err(e) => {
                if made_progress() {
                    attempt = 1;
                }
                let kind = classify::classify(&e);
                match policy.decide(attempt, kind) {
                    RetryDecision::NoRetry => return Err(e),
                    RetryDecision::RetryAfter(d) => {
                        std::thread::sleep(d);
                        attempt += 1;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            max_delay: Duration::from_millis(0),
        }
    }

    #[test]
    fn exhausts_attempt_budget_without_progress() {
        let policy = fast_policy(3);
        let mut calls = 0;
        let result = run_with_retry(
            &policy,
            || {
                calls += 1;
                Err(SegmentError::Http(503))
            },
            || false,
        );
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn progress_resets_the_failure_streak() {
        // A 2-attempt budget would normally stop at the second failure, but
        // every attempt here reports heartbeat progress, so the streak keeps
        // resetting until the transfer actually succeeds.
        let policy = fast_policy(2);
        let mut calls = 0;
        let result = run_with_retry(
            &policy,
            || {
                calls += 1;
                if calls <= 4 {
                    Err(SegmentError::Http(503))
                } else {
                    Ok(())
                }
            },
            || true,
        );
        assert!(result.is_ok());
        assert_eq!(calls, 5);
    }
}
