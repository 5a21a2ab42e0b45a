//! Adaptive heartbeat interval state.
//!
//! Each session carries one [`HeartbeatState`].  Every completed heartbeat
//! cycle recomputes the interval from how long the session has been idle:
//! `current = clamp(init + (now − last_activity), min, max)`.  Steady
//! command traffic keeps `last_activity` fresh and the interval near `init`;
//! an idle peer drifts toward `max`, cutting keepalive overhead.

use crate::config::HeartbeatConfig;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct HeartbeatState {
    min: Duration,
    max: Duration,
    init: Duration,
    current: Duration,
    last_activity: Instant,
}

impl HeartbeatState {
    pub fn new(cfg: &HeartbeatConfig) -> Self {
        let min = Duration::from_millis(cfg.min_interval_ms);
        let max = Duration::from_millis(cfg.max_interval_ms);
        let init = Duration::from_millis(cfg.init_interval_ms);
        HeartbeatState {
            min,
            max,
            init,
            current: init.clamp(min, max),
            last_activity: Instant::now(),
        }
    }

    /// Recompute the interval for the cycle that just completed and mark the
    /// cycle itself as activity.
    pub fn advance(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_activity);
        self.current = (self.init + elapsed).clamp(self.min, self.max);
        self.last_activity = now;
        self.current
    }

    /// Record peer activity (a handled command) without touching the interval.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// The sleep before the next heartbeat cycle.
    pub fn current_interval(&self) -> Duration {
        self.current
    }

    /// The current interval as whole milliseconds, as reported in ACK frames.
    pub fn current_millis(&self) -> u64 {
        u64::try_from(self.current.as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(min: u64, max: u64, init: u64) -> HeartbeatConfig {
        HeartbeatConfig {
            min_interval_ms: min,
            max_interval_ms: max,
            init_interval_ms: init,
            timeout_ms: 3000,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn starts_at_init_within_bounds() {
        let state = HeartbeatState::new(&cfg(1000, 5000, 2000));
        assert_eq!(state.current_millis(), 2000);
    }

    #[tokio::test(start_paused = true)]
    async fn init_outside_bounds_is_clamped_at_construction() {
        let low = HeartbeatState::new(&cfg(1000, 5000, 10));
        assert_eq!(low.current_millis(), 1000);
        let high = HeartbeatState::new(&cfg(1000, 5000, 60_000));
        assert_eq!(high.current_millis(), 5000);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_session_stays_near_init() {
        let mut state = HeartbeatState::new(&cfg(1000, 5000, 2000));
        tokio::time::advance(Duration::from_millis(400)).await;
        state.touch();
        let interval = state.advance();
        assert_eq!(interval, Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_time_stretches_the_interval() {
        let mut state = HeartbeatState::new(&cfg(1000, 5000, 2000));
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(state.advance(), Duration::from_millis(3500));
    }

    #[tokio::test(start_paused = true)]
    async fn interval_is_capped_at_max() {
        let mut state = HeartbeatState::new(&cfg(1000, 5000, 2000));
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(state.advance(), Duration::from_millis(5000));
    }

    #[tokio::test(start_paused = true)]
    async fn invariant_holds_across_many_cycles() {
        let mut state = HeartbeatState::new(&cfg(1000, 5000, 2000));
        for step_ms in [0, 100, 2500, 9000, 50, 100_000] {
            tokio::time::advance(Duration::from_millis(step_ms)).await;
            let interval = state.advance();
            assert!(interval >= Duration::from_millis(1000), "below min after {step_ms}ms idle");
            assert!(interval <= Duration::from_millis(5000), "above max after {step_ms}ms idle");
        }
    }
}
