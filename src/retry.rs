//! Bounded retry with sleeping backoff.
//!
//! Used by the attachment manager for attach, unmount and release. The
//! orchestrator never retries a stage itself.

use std::fmt::Display;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Default number of attempts for attach/detach primitives.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the second attempt; later attempts scale linearly.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(500);

/// Retry exhausted: how many attempts ran and the last error seen.
#[derive(Debug)]
pub struct RetryError<E> {
    pub attempts: u32,
    pub last: E,
}

/// Max attempts plus linear backoff between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Policy with a single attempt.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Run `op` until it succeeds or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. On success returns the value
    /// and the attempt that produced it.
    pub fn run<T, E, F>(&self, what: &str, op: F) -> Result<(T, u32), RetryError<E>>
    where
        E: Display,
        F: FnMut(u32) -> Result<T, E>,
    {
        self.run_while(what, |_| true, op)
    }

    /// Like [`run`](Self::run), but stops early when `is_transient` says the
    /// error will not go away by retrying.
    pub fn run_while<T, E, P, F>(
        &self,
        what: &str,
        is_transient: P,
        mut op: F,
    ) -> Result<(T, u32), RetryError<E>>
    where
        E: Display,
        P: Fn(&E) -> bool,
        F: FnMut(u32) -> Result<T, E>,
    {
        let max = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "{} succeeded after retry", what);
                    }
                    return Ok((value, attempt));
                }
                Err(err) => {
                    if attempt >= max || !is_transient(&err) {
                        return Err(RetryError {
                            attempts: attempt,
                            last: err,
                        });
                    }
                    warn!(attempt, max, "{} failed: {}; retrying", what, err);
                    let delay = self.backoff * attempt;
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instant(max: u32) -> RetryPolicy {
        RetryPolicy::new(max, Duration::ZERO)
    }

    #[test]
    fn test_first_attempt_success() {
        let (value, attempt) = instant(3).run("op", |_| Ok::<_, String>(7)).unwrap();
        assert_eq!(value, 7);
        assert_eq!(attempt, 1);
    }

    #[test]
    fn test_succeeds_on_second_attempt() {
        let mut calls = 0;
        let (_, attempt) = instant(3)
            .run("op", |_| {
                calls += 1;
                if calls < 2 {
                    Err("busy".to_string())
                } else {
                    Ok(())
                }
            })
            .unwrap();
        assert_eq!(attempt, 2);
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_exhausts_after_max_attempts() {
        let mut calls = 0;
        let err = instant(3)
            .run("op", |_| {
                calls += 1;
                Err::<(), _>(format!("fail {}", calls))
            })
            .unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.last, "fail 3");
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_permanent_error_stops_early() {
        let mut calls = 0;
        let err = instant(3)
            .run_while(
                "op",
                |e: &String| e != "permanent",
                |_| {
                    calls += 1;
                    Err::<(), _>("permanent".to_string())
                },
            )
            .unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        let policy = RetryPolicy {
            max_attempts: 0,
            backoff: Duration::ZERO,
        };
        let mut calls = 0;
        let _ = policy.run("op", |_| {
            calls += 1;
            Err::<(), _>("x")
        });
        assert_eq!(calls, 1);
    }
}
