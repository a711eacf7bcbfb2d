//! Cancellable timed retry
//!
//! Runs an attempt on a fixed schedule until it reports ready, aborts, the
//! optional deadline passes, or the cancellation token fires. The first
//! attempt runs immediately; later attempts start one interval after the
//! previous one started, clipped to the deadline.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Schedule for a retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// `None` retries until ready or cancelled.
    pub timeout: Option<Duration>,
}

impl RetryPolicy {
    pub fn bounded(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout: Some(timeout),
        }
    }

    pub fn unbounded(interval: Duration) -> Self {
        Self {
            interval,
            timeout: None,
        }
    }
}

/// Result of a single attempt.
#[derive(Debug)]
pub enum Attempt<T, E> {
    Ready(T),
    NotYet,
    Abort(E),
}

/// Passed to each attempt.
#[derive(Debug, Clone, Copy)]
pub struct AttemptContext {
    /// 1-based attempt number.
    pub number: u32,
    /// Time left before the deadline, if there is one.
    pub remaining: Option<Duration>,
}

#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub value: T,
    pub attempts: u32,
    pub elapsed: Duration,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RetryError<E> {
    TimedOut { attempts: u32, elapsed: Duration },
    Cancelled,
    Aborted(E),
}

pub async fn retry_until<T, E, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Result<RetryOutcome<T>, RetryError<E>>
where
    F: FnMut(AttemptContext) -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
{
    let start = Instant::now();
    let deadline = policy.timeout.map(|t| start + t);
    let mut attempts = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        attempts += 1;
        let started = Instant::now();
        let ctx = AttemptContext {
            number: attempts,
            remaining: deadline.map(|d| d.saturating_duration_since(started)),
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            result = attempt(ctx) => result,
        };

        match result {
            Attempt::Ready(value) => {
                return Ok(RetryOutcome {
                    value,
                    attempts,
                    elapsed: start.elapsed(),
                })
            }
            Attempt::Abort(e) => return Err(RetryError::Aborted(e)),
            Attempt::NotYet => {}
        }

        let mut wake = started + policy.interval;
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(RetryError::TimedOut {
                    attempts,
                    elapsed: start.elapsed(),
                });
            }
            wake = wake.min(deadline);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = sleep_until(wake) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    type Never = ();

    #[tokio::test(start_paused = true)]
    async fn ready_on_third_attempt_at_two_intervals() {
        let policy = RetryPolicy::unbounded(Duration::from_millis(2000));
        let cancel = CancellationToken::new();

        let outcome = retry_until(policy, &cancel, |ctx| async move {
            if ctx.number == 3 {
                Attempt::<_, Never>::Ready(ctx.number)
            } else {
                Attempt::NotYet
            }
        })
        .await
        .unwrap();

        assert_eq!(outcome.value, 3);
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.elapsed >= Duration::from_millis(4000));
        assert!(outcome.elapsed < Duration::from_millis(6000));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_within_one_interval_of_deadline() {
        let policy = RetryPolicy::bounded(Duration::from_millis(2000), Duration::from_millis(30000));
        let cancel = CancellationToken::new();

        let err = retry_until(policy, &cancel, |_| async { Attempt::<(), Never>::NotYet })
            .await
            .unwrap_err();

        match err {
            RetryError::TimedOut { attempts, elapsed } => {
                assert!(elapsed >= Duration::from_millis(30000));
                assert!(elapsed < Duration::from_millis(32000));
                // 0, 2, 4 ... 30 seconds
                assert_eq!(attempts, 16);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_between_ticks_gets_a_final_attempt() {
        let policy = RetryPolicy::bounded(Duration::from_millis(2000), Duration::from_millis(5000));
        let cancel = CancellationToken::new();
        let seen = RefCell::new(Vec::new());
        let start = Instant::now();

        let err = retry_until(policy, &cancel, |_| {
            seen.borrow_mut().push(start.elapsed());
            async { Attempt::<(), Never>::NotYet }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, RetryError::TimedOut { attempts: 4, .. }));
        assert_eq!(
            *seen.borrow(),
            vec![
                Duration::from_millis(0),
                Duration::from_millis(2000),
                Duration::from_millis(4000),
                Duration::from_millis(5000),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempt_is_followed_by_exactly_one_more_after_interval() {
        let policy = RetryPolicy::unbounded(Duration::from_millis(250));
        let cancel = CancellationToken::new();
        let seen = RefCell::new(Vec::new());
        let start = Instant::now();

        retry_until(policy, &cancel, |ctx| {
            seen.borrow_mut().push(start.elapsed());
            async move {
                if ctx.number == 1 {
                    Attempt::<_, Never>::NotYet
                } else {
                    Attempt::Ready(())
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(
            *seen.borrow(),
            vec![Duration::from_millis(0), Duration::from_millis(250)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_keeps_polling_until_cancelled() {
        let policy = RetryPolicy::unbounded(Duration::from_secs(1));
        let cancel = CancellationToken::new();
        let count = RefCell::new(0u32);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            trigger.cancel();
        });

        let err = retry_until(policy, &cancel, |_| {
            *count.borrow_mut() += 1;
            async { Attempt::<(), Never>::NotYet }
        })
        .await
        .unwrap_err();

        assert_eq!(err, RetryError::Cancelled);
        assert!(*count.borrow() >= 3600);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_stops_immediately() {
        let policy = RetryPolicy::unbounded(Duration::from_secs(1));
        let cancel = CancellationToken::new();

        let err = retry_until(policy, &cancel, |ctx| async move {
            if ctx.number == 2 {
                Attempt::<(), _>::Abort("backend gone")
            } else {
                Attempt::NotYet
            }
        })
        .await
        .unwrap_err();

        assert_eq!(err, RetryError::Aborted("backend gone"));
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_budget_shrinks_toward_deadline() {
        let policy = RetryPolicy::bounded(Duration::from_secs(1), Duration::from_secs(3));
        let cancel = CancellationToken::new();
        let budgets = RefCell::new(Vec::new());

        let _ = retry_until(policy, &cancel, |ctx| {
            budgets.borrow_mut().push(ctx.remaining);
            async { Attempt::<(), Never>::NotYet }
        })
        .await;

        assert_eq!(
            *budgets.borrow(),
            vec![
                Some(Duration::from_secs(3)),
                Some(Duration::from_secs(2)),
                Some(Duration::from_secs(1)),
                Some(Duration::ZERO),
            ]
        );
    }
}
