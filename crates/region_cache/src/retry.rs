// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bounded retries with randomized delays.

use std::fmt::Debug;
use std::time::Duration;

use tokio::time::Instant;

use crate::LockConfig;

/// Supplies the delay to wait before the next attempt.
pub trait RetryDelay: Debug + Send + Sync {
    /// Delay to wait after the given (1-based) attempt failed.
    fn next_delay(&self, attempt: u32) -> Duration;
}

/// Non-cryptographic random source for delay jitter.
#[derive(Clone, Default)]
pub(crate) enum Rnd {
    #[default]
    Real,

    #[cfg(test)]
    Test(std::sync::Arc<dyn Fn() -> f64 + Send + Sync>),
}

impl Debug for Rnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Real => write!(f, "Real"),
            #[cfg(test)]
            Self::Test(_) => write!(f, "Test"),
        }
    }
}

impl Rnd {
    #[cfg(test)]
    pub fn new_fixed(value: f64) -> Self {
        Self::Test(std::sync::Arc::new(move || value))
    }

    pub fn next_f64(&self) -> f64 {
        match self {
            Self::Real => fastrand::f64(),
            #[cfg(test)]
            Self::Test(generator) => generator(),
        }
    }
}

/// Draws each delay uniformly within `[min, max]`, so competing clients drift apart.
#[derive(Clone, Debug)]
pub struct JitteredDelay {
    min: Duration,
    max: Duration,
    rnd: Rnd,
}

impl JitteredDelay {
    /// Creates a provider drawing within `[min, max]`. Inverted bounds are swapped.
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        Self { min, max, rnd: Rnd::Real }
    }

    #[cfg(test)]
    fn with_rnd(mut self, rnd: Rnd) -> Self {
        self.rnd = rnd;
        self
    }
}

impl RetryDelay for JitteredDelay {
    fn next_delay(&self, _attempt: u32) -> Duration {
        self.min + (self.max - self.min).mul_f64(self.rnd.next_f64().clamp(0.0, 1.0))
    }
}

/// The final state of an operation that ran out of retries.
#[derive(Debug)]
pub struct Exhausted<T> {
    attempts: u32,
    elapsed: Duration,
    last: T,
}

impl<T> Exhausted<T> {
    /// Number of attempts made.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Time spent across all attempts.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Result of the last attempt.
    #[must_use]
    pub fn last(&self) -> &T {
        &self.last
    }

    /// Consumes the context, returning the last result.
    #[must_use]
    pub fn into_last(self) -> T {
        self.last
    }
}

/// Runs an operation until it succeeds or an attempt or time budget runs out.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use region_cache::{JitteredDelay, RetryPolicy};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let policy = RetryPolicy::new(3, Duration::from_secs(1), JitteredDelay::new(Duration::ZERO, Duration::ZERO));
///
/// let outcome = policy
///     .execute(|attempt| async move { attempt }, |attempt| *attempt < 2, |_| async {})
///     .await;
///
/// assert_eq!(outcome.ok(), Some(2));
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct RetryPolicy<D = JitteredDelay> {
    max_attempts: u32,
    time_budget: Duration,
    delay: D,
}

impl RetryPolicy {
    /// Policy used to acquire locks: `retry_times` attempts within `acquire_timeout`.
    #[must_use]
    pub fn for_locks(config: &LockConfig) -> Self {
        Self::new(
            config.retry_times(),
            config.acquire_timeout(),
            JitteredDelay::new(config.min_retry_delay(), config.max_retry_delay()),
        )
    }
}

impl<D: RetryDelay> RetryPolicy<D> {
    /// Creates a policy. At least one attempt is always made.
    #[must_use]
    pub fn new(max_attempts: u32, time_budget: Duration, delay: D) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            time_budget,
            delay,
        }
    }

    /// Maximum number of attempts.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Runs `operation` with the 1-based attempt number until `should_retry` declines.
    ///
    /// When a budget runs out while `should_retry` still asks for another attempt,
    /// `on_failure` is awaited with the final context and the context is returned as the
    /// error.
    ///
    /// # Errors
    ///
    /// Returns [`Exhausted`] when the attempt or time budget is spent.
    pub async fn execute<T, Op, Fut, P, F, FFut>(&self, mut operation: Op, should_retry: P, on_failure: F) -> Result<T, Exhausted<T>>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = T>,
        P: Fn(&T) -> bool,
        F: FnOnce(&Exhausted<T>) -> FFut,
        FFut: Future<Output = ()>,
    {
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outcome = operation(attempt).await;
            if !should_retry(&outcome) {
                return Ok(outcome);
            }

            let elapsed = started.elapsed();
            let delay = self.delay.next_delay(attempt);
            if attempt >= self.max_attempts || elapsed + delay > self.time_budget {
                tracing::event!(
                    name: "region_cache.retry.exhausted",
                    tracing::Level::WARN,
                    retry.attempts = attempt,
                    retry.elapsed = ?elapsed,
                    "retry budget exhausted"
                );
                let exhausted = Exhausted {
                    attempts: attempt,
                    elapsed,
                    last: outcome,
                };
                on_failure(&exhausted).await;
                return Err(exhausted);
            }

            tracing::event!(
                name: "region_cache.retry",
                tracing::Level::DEBUG,
                retry.attempt = attempt,
                retry.delay = ?delay,
                "retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use super::*;

    fn fixed(delay: Duration) -> JitteredDelay {
        JitteredDelay::new(delay, delay)
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let min = Duration::from_millis(10);
        let max = Duration::from_millis(400);

        assert_eq!(JitteredDelay::new(min, max).with_rnd(Rnd::new_fixed(0.0)).next_delay(1), min);
        assert_eq!(JitteredDelay::new(min, max).with_rnd(Rnd::new_fixed(1.0)).next_delay(1), max);
        assert_eq!(
            JitteredDelay::new(min, max).with_rnd(Rnd::new_fixed(0.5)).next_delay(1),
            Duration::from_millis(205)
        );

        let real = JitteredDelay::new(max, min);
        for attempt in 1..100 {
            let delay = real.next_delay(attempt);
            assert!(delay >= min && delay <= max, "{delay:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_attempt_budget() {
        let policy = RetryPolicy::new(3, Duration::from_secs(60), fixed(Duration::from_millis(10)));
        let calls = AtomicU32::new(0);
        let failed = AtomicBool::new(false);

        let outcome = policy
            .execute(
                |_| {
                    calls.fetch_add(1, Ordering::Relaxed);
                    async { false }
                },
                |acquired| !acquired,
                |context| {
                    assert_eq!(context.attempts(), 3);
                    failed.store(true, Ordering::Relaxed);
                    async {}
                },
            )
            .await;

        let exhausted = outcome.expect_err("should exhaust");
        assert_eq!(exhausted.attempts(), 3);
        assert!(!exhausted.into_last());
        assert_eq!(calls.load(Ordering::Relaxed), 3);
        assert!(failed.load(Ordering::Relaxed));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_time_budget() {
        let policy = RetryPolicy::new(100, Duration::from_millis(250), fixed(Duration::from_millis(100)));
        let calls = AtomicU32::new(0);

        let outcome = policy
            .execute(
                |_| {
                    calls.fetch_add(1, Ordering::Relaxed);
                    async { false }
                },
                |acquired| !acquired,
                |_| async {},
            )
            .await;

        let exhausted = outcome.expect_err("should exhaust");
        assert_eq!(exhausted.attempts(), 3);
        assert!(exhausted.elapsed() >= Duration::from_millis(200), "{:?}", exhausted.elapsed());
        assert!(exhausted.elapsed() < Duration::from_millis(250), "{:?}", exhausted.elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn returns_first_accepted_result() {
        let policy = RetryPolicy::new(5, Duration::from_secs(5), fixed(Duration::from_millis(1)));

        let outcome = policy.execute(|attempt| async move { attempt }, |attempt| *attempt < 4, |_| async {}).await;

        assert_eq!(outcome.ok(), Some(4));
    }

    #[tokio::test]
    async fn zero_attempts_still_runs_once() {
        let policy = RetryPolicy::new(0, Duration::ZERO, fixed(Duration::ZERO));

        let outcome = policy.execute(|attempt| async move { attempt }, |_| true, |_| async {}).await;

        assert_eq!(outcome.expect_err("single attempt").attempts(), 1);
    }
}
