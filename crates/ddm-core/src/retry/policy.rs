use std::time::Duration;

/// High-level classification of an error for retry purposes.
///
/// This intentionally stays generic; callers can map HTTP status codes,
/// curl errors, or IO failures into these kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operation timed out (connect/read).
    Timeout,
    /// Server asked us to slow down (e.g. 429, 503).
    Throttled,
    /// Network-level failure (connection reset, DNS, etc.).
    Connection,
    /// HTTP status that is retryable but not strictly throttling (5xx).
    Http5xx(u16),
    /// 401/403 on a provider fetch. Not retried here: surfaced to the task
    /// so the caller can `update_url` with a freshly signed URL and resume.
    AuthExpired,
    /// Any other error (typically not retried).
    Other,
}

/// Decision returned by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Do not retry this error.
    NoRetry,
    /// Retry after the given delay.
    RetryAfter(Duration),
}

/// Linear backoff policy: `sleep(retries)` seconds, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Upper bound on backoff delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Compute the next backoff delay for a given attempt and error kind.
    ///
    /// `attempt` is 1-based (1 = first attempt, i.e. the number of failures
    /// seen so far). Returns `RetryDecision::NoRetry` when we should stop
    /// retrying: either the attempt budget is exhausted, or the error kind
    /// is not a transient transport failure.
    pub fn decide(&self, attempt: u32, kind: ErrorKind) -> RetryDecision {
        if attempt >= self.max_attempts {
            return RetryDecision::NoRetry;
        }

        match kind {
            ErrorKind::Other | ErrorKind::AuthExpired => RetryDecision::NoRetry,
            ErrorKind::Timeout
            | ErrorKind::Connection
            | ErrorKind::Throttled
            | ErrorKind::Http5xx(_) => {
                let delay = Duration::from_secs(attempt as u64).min(self.max_delay);
                RetryDecision::RetryAfter(delay)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_retry_for_other() {
        let p = RetryPolicy::default();
        assert_eq!(p.decide(1, ErrorKind::Other), RetryDecision::NoRetry);
    }

    #[test]
    fn no_retry_for_auth_expired() {
        let p = RetryPolicy::default();
        assert_eq!(p.decide(1, ErrorKind::AuthExpired), RetryDecision::NoRetry);
    }

    #[test]
    fn linear_backoff_equals_attempt_count_in_seconds() {
        let mut p = RetryPolicy::default();
        p.max_attempts = 20;
        assert_eq!(
            p.decide(1, ErrorKind::Timeout),
            RetryDecision::RetryAfter(Duration::from_secs(1))
        );
        assert_eq!(
            p.decide(4, ErrorKind::Timeout),
            RetryDecision::RetryAfter(Duration::from_secs(4))
        );
    }

    #[test]
    fn backoff_capped_at_max_delay() {
        let mut p = RetryPolicy::default();
        p.max_attempts = 100;
        p.max_delay = Duration::from_secs(10);
        assert_eq!(
            p.decide(50, ErrorKind::Timeout),
            RetryDecision::RetryAfter(Duration::from_secs(10))
        );
    }

    #[test]
    fn respects_max_attempts() {
        let mut p = RetryPolicy::default();
        p.max_attempts = 3;
        assert!(matches!(
            p.decide(1, ErrorKind::Throttled),
            RetryDecision::RetryAfter(_)
        ));
        assert!(matches!(
            p.decide(2, ErrorKind::Throttled),
            RetryDecision::RetryAfter(_)
        ));
        assert_eq!(p.decide(3, ErrorKind::Throttled), RetryDecision::NoRetry);
    }
}
