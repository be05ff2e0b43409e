//! Exponential delay between child relaunches.
//!
//! The first relaunch after a crash waits `initial`, each further one
//! waits `multiplier` times longer, capped at `max`. `reset()` is called
//! together with the crash record once a child has proven stable.

use std::time::Duration;

use crate::config::SupervisorConfig;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: u32,
    next: Duration,
    /// Relaunches scheduled since the last reset.
    pub relaunches: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: u32) -> Self {
        let initial = initial.min(max);
        Self {
            initial,
            max,
            multiplier: multiplier.max(1),
            next: initial,
            relaunches: 0,
        }
    }

    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self::new(
            Duration::from_millis(config.backoff_initial_ms),
            Duration::from_millis(config.backoff_max_ms),
            config.backoff_multiplier,
        )
    }

    /// Delay before the next relaunch; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.relaunches += 1;
        self.next = self
            .next
            .checked_mul(self.multiplier)
            .unwrap_or(self.max)
            .min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
        self.relaunches = 0;
    }
}
