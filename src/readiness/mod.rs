//! Readiness gate. Waits for an external dependency before a child is
//! spawned.
//!
//! The poller checks a [`StatusProbe`] immediately and then once per
//! interval until the probe reports ready or the total budget runs out.
//! Probe failures are not fatal: they simply count as "not ready yet".

pub mod http;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::ReadinessConfig;

pub use http::{HttpStatusProbe, ProbeError};

/// Source of the dependency's readiness.
#[async_trait]
pub trait StatusProbe: Send + Sync {
    /// `Ok(true)` when the dependency is ready. Errors are retried.
    async fn check(&self) -> Result<bool, ProbeError>;

    fn description(&self) -> String;
}

/// How a polling run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Ready { attempts: u32, elapsed: Duration },
    TimedOut { attempts: u32, elapsed: Duration },
}

/// Polls a probe at a fixed interval within a total budget.
#[derive(Clone)]
pub struct ReadinessPoller {
    probe: Arc<dyn StatusProbe>,
    interval: Duration,
    timeout: Duration,
}

impl ReadinessPoller {
    pub fn new(probe: Arc<dyn StatusProbe>, interval: Duration, timeout: Duration) -> Self {
        Self {
            probe,
            interval,
            timeout,
        }
    }

    pub fn from_config(probe: Arc<dyn StatusProbe>, config: &ReadinessConfig) -> Self {
        Self::new(probe, config.interval(), config.timeout())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Polls until ready or out of budget. Dropping the future cancels it.
    pub async fn wait(&self) -> PollOutcome {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut attempts = 0;

        info!(
            "Waiting for {} (every {}ms, up to {}ms)",
            self.probe.description(),
            self.interval.as_millis(),
            self.timeout.as_millis()
        );

        loop {
            let now = Instant::now();
            if now >= deadline {
                return PollOutcome::TimedOut {
                    attempts,
                    elapsed: now - started,
                };
            }

            attempts += 1;
            match tokio::time::timeout_at(deadline, self.probe.check()).await {
                Ok(Ok(true)) => {
                    let elapsed = started.elapsed();
                    info!(
                        "Dependency ready after {attempts} poll(s), {}ms",
                        elapsed.as_millis()
                    );
                    return PollOutcome::Ready { attempts, elapsed };
                }
                Ok(Ok(false)) => debug!("Poll {attempts}: dependency not ready"),
                Ok(Err(e)) => debug!("Poll {attempts} failed: {e}"),
                Err(_) => debug!("Poll {attempts} still pending at deadline"),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(self.interval.min(remaining)).await;
        }
    }
}
