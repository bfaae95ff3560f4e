//! Keepalive scheduling.
//!
//! The connection actor polls [`Timer`]s inside its select loop instead of
//! spawning a task per timer, so re-arming on every inbound frame only resets
//! a deadline.

use std::pin::Pin;
use std::time::Duration;

use tokio::time::{Instant, Sleep};

/// Stand-in deadline for durations that overflow `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Re-armable one-shot deadline.
#[derive(Debug)]
pub(crate) struct Timer {
    sleep: Pin<Box<Sleep>>,
    armed: bool,
}

impl Timer {
    pub(crate) fn new() -> Self {
        Self {
            sleep: Box::pin(tokio::time::sleep(Duration::ZERO)),
            armed: false,
        }
    }

    pub(crate) fn arm(&mut self, after: Duration) {
        let now = Instant::now();
        let deadline = now.checked_add(after).unwrap_or_else(|| now + FAR_FUTURE);
        self.sleep.as_mut().reset(deadline);
        self.armed = true;
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.armed
    }

    /// Completes when the armed deadline passes, leaving the timer disarmed.
    ///
    /// Only poll this while [`Timer::is_armed`] holds.
    pub(crate) async fn fired(&mut self) {
        self.sleep.as_mut().await;
        self.armed = false;
    }
}

/// Idle timer that triggers a ping after `interval` without inbound traffic.
#[derive(Debug)]
pub(crate) struct KeepaliveScheduler {
    enabled: bool,
    interval: Duration,
    active: bool,
    timer: Timer,
}

impl KeepaliveScheduler {
    pub(crate) fn new(enabled: bool, interval: Duration) -> Self {
        Self {
            enabled,
            interval,
            active: false,
            timer: Timer::new(),
        }
    }

    /// Starts idle tracking for a freshly connected session.
    pub(crate) fn start(&mut self) {
        if !self.enabled {
            return;
        }
        self.active = true;
        self.timer.arm(self.interval);
    }

    /// Stops idle tracking; later traffic does not re-arm the timer.
    pub(crate) fn stop(&mut self) {
        self.active = false;
        self.timer.disarm();
    }

    /// Records liveness evidence: any inbound frame postpones the next ping.
    pub(crate) fn touch(&mut self) {
        if self.active {
            self.timer.arm(self.interval);
        }
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.active && self.timer.is_armed()
    }

    /// Completes when the connection has been idle for a full interval.
    pub(crate) async fn idle(&mut self) {
        self.timer.fired().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::{KeepaliveScheduler, Timer};

    #[tokio::test(start_paused = true)]
    async fn timer_fires_after_armed_duration() {
        let mut timer = Timer::new();
        let started = Instant::now();
        timer.arm(Duration::from_secs(3));
        assert!(timer.is_armed());
        timer.fired().await;
        assert!(!timer.is_armed());
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn arming_with_unbounded_duration_stays_pending() {
        let mut timer = Timer::new();
        timer.arm(Duration::MAX);
        assert!(timer.is_armed());
        let fired = tokio::time::timeout(Duration::from_secs(3600), timer.fired()).await;
        assert!(fired.is_err());
        assert!(timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn touch_postpones_idle_deadline() {
        let mut keepalive = KeepaliveScheduler::new(true, Duration::from_secs(10));
        let started = Instant::now();
        keepalive.start();

        tokio::time::sleep(Duration::from_secs(6)).await;
        keepalive.touch();
        keepalive.idle().await;

        assert!(started.elapsed() >= Duration::from_secs(16));
        assert!(!keepalive.is_armed());
        keepalive.touch();
        assert!(keepalive.is_armed());
    }

    #[test]
    fn disabled_scheduler_never_arms() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let mut keepalive = KeepaliveScheduler::new(false, Duration::from_secs(1));
            keepalive.start();
            keepalive.touch();
            assert!(!keepalive.is_armed());
        });
    }

    #[tokio::test(start_paused = true)]
    async fn stop_disables_touch() {
        let mut keepalive = KeepaliveScheduler::new(true, Duration::from_secs(1));
        keepalive.start();
        keepalive.stop();
        keepalive.touch();
        assert!(!keepalive.is_armed());
    }
}
