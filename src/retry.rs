//! Retry and timeout utilities.
//!
//! The helpers in this module are transport-agnostic. The connection state
//! machine uses [`Backoff`] to space out reconnect attempts and
//! [`with_timeout`] to bound waits on transport shutdown.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

/// Policy controlling exponential reconnect backoff.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Delay used before the first reconnect attempt, and the value the delay
    /// resets to after a successful connect.
    pub base: Duration,
    /// Multiplier applied to the delay after each failed attempt. Values
    /// below 1 are treated as 1.
    pub factor: f64,
    /// Upper bound for delay growth (jitter is added on top).
    pub max: Duration,
    /// Maximum random jitter as a fraction of the current delay.
    pub jitter_fraction: f64,
}

impl BackoffPolicy {
    /// Returns the policy used by long-lived realtime connections.
    pub fn realtime() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2.0,
            max: Duration::from_secs(60),
            jitter_fraction: 0.5,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::realtime()
    }
}

/// Stateful backoff tracker for consecutive reconnect attempts.
///
/// The stored delay never includes jitter, so jitter does not compound across
/// attempts.
#[derive(Clone, Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
    attempt: usize,
}

impl Backoff {
    /// Creates a tracker starting at `policy.base`.
    pub fn new(policy: BackoffPolicy) -> Self {
        let current = policy.base;
        Self {
            policy,
            current,
            attempt: 0,
        }
    }

    /// Returns the un-jittered delay the next attempt will wait for.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Returns the delay for the next attempt and grows the stored delay.
    ///
    /// The returned value lies in `[d, d * (1 + jitter_fraction)]` where `d` is
    /// [`Backoff::current`] before the call.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.attempt += 1;
        self.current = grow(self.current, self.policy.factor, self.policy.max);

        let jittered = delay.saturating_add(jitter_duration(delay, self.policy.jitter_fraction));
        debug!(
            event = "backoff_delay",
            attempt = self.attempt,
            delay_ms = jittered.as_millis() as u64,
            next_base_ms = self.current.as_millis() as u64
        );
        jittered
    }

    /// Resets the delay to the policy base.
    pub fn reset(&mut self) {
        self.current = self.policy.base;
        self.attempt = 0;
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

/// Multiplies `current` by `factor`, saturating at `max`.
fn grow(current: Duration, factor: f64, max: Duration) -> Duration {
    let factor = if factor.is_finite() { factor.max(1.0) } else { 1.0 };
    let grown = current.as_secs_f64() * factor;
    if !grown.is_finite() || grown >= max.as_secs_f64() {
        return max;
    }
    Duration::try_from_secs_f64(grown).map_or(max, |grown| grown.min(max))
}

/// Samples jitter in `[0, delay * fraction]`, clamped so that adding it to
/// `delay` cannot overflow.
fn jitter_duration(delay: Duration, fraction: f64) -> Duration {
    if delay.is_zero() || !fraction.is_finite() || fraction <= 0.0 {
        return Duration::ZERO;
    }

    let headroom = Duration::MAX.saturating_sub(delay).as_secs_f64();
    let limit = (delay.as_secs_f64() * fraction).min(headroom);
    if !limit.is_finite() || limit <= 0.0 {
        return Duration::ZERO;
    }
    let sampled = rand::thread_rng().gen_range(0.0..=limit);
    Duration::try_from_secs_f64(sampled).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{with_timeout, Backoff, BackoffPolicy};

    fn policy(jitter_fraction: f64) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_secs(1),
            factor: 2.0,
            max: Duration::from_secs(60),
            jitter_fraction,
        }
    }

    #[test]
    fn delays_double_until_cap_without_jitter() {
        let mut backoff = Backoff::new(policy(0.0));
        let delays: Vec<u64> = (0..9).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60, 60]);
    }

    #[test]
    fn jittered_delays_stay_within_bounds_and_are_non_decreasing_at_base() {
        let mut backoff = Backoff::new(policy(0.5));
        let mut previous_base = Duration::ZERO;
        for _ in 0..12 {
            let base = backoff.current();
            assert!(base >= previous_base);
            let delay = backoff.next_delay();
            assert!(delay >= base, "{delay:?} < {base:?}");
            assert!(delay <= base.mul_f64(1.5), "{delay:?} > 1.5 * {base:?}");
            previous_base = base;
        }
    }

    #[test]
    fn reset_returns_to_base() {
        let mut backoff = Backoff::new(policy(0.0));
        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.current(), Duration::from_secs(8));
        assert_eq!(backoff.attempt(), 3);

        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_secs(1));
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn zero_factor_is_treated_as_constant_delay() {
        let mut backoff = Backoff::new(BackoffPolicy {
            factor: 0.0,
            ..policy(0.0)
        });
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn fractional_factor_grows_gradually() {
        let mut backoff = Backoff::new(BackoffPolicy {
            factor: 1.5,
            ..policy(0.0)
        });
        let delays: Vec<u128> = (0..4).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![1000, 1500, 2250, 3375]);
    }

    #[test]
    fn uncapped_policy_saturates_instead_of_overflowing() {
        let mut backoff = Backoff::new(BackoffPolicy {
            max: Duration::MAX,
            ..policy(0.5)
        });
        let mut previous = Duration::ZERO;
        for _ in 0..200 {
            let base = backoff.current();
            assert!(base >= previous);
            assert!(backoff.next_delay() >= base);
            previous = base;
        }
        assert_eq!(backoff.current(), Duration::MAX);
    }

    #[test]
    fn huge_jitter_fraction_is_clamped() {
        let mut backoff = Backoff::new(policy(1e30));
        for _ in 0..10 {
            let base = backoff.current();
            assert!(backoff.next_delay() >= base);
        }

        let mut backoff = Backoff::new(BackoffPolicy {
            max: Duration::MAX,
            factor: f64::MAX,
            ..policy(f64::MAX)
        });
        for _ in 0..5 {
            backoff.next_delay();
        }
        assert_eq!(backoff.current(), Duration::MAX);
    }

    #[test]
    fn timeout_helper_reports_elapsed() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let result = with_timeout(
                Duration::from_millis(10),
                tokio::time::sleep(Duration::from_secs(1)),
            )
            .await;
            assert!(result.is_err());

            let value = with_timeout(Duration::from_secs(1), async { 7 })
                .await
                .expect("completes before timeout");
            assert_eq!(value, 7);
        });
    }
}
