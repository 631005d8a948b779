//! Restart supervision
//!
//! Decides what happens when an instance exits, fails to start, or never
//! becomes ready, and paces restarts with exponential backoff.

use super::event::EventKind;
use super::instance::ServiceInstance;
use crate::container::ExitStatus;
use crate::error::{BerthError, Result};
use crate::service::{RestartPolicy, ServiceSpec};
use std::time::Duration;

/// Exponential backoff: `base * 2^(attempt - 1)`, capped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    /// Create a backoff with the given base delay and cap
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay before restart number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// Why an instance stopped running
#[derive(Debug)]
pub enum ExitCause {
    /// The container exited on its own
    Exited(ExitStatus),
    /// The container could not be started
    StartFailed(BerthError),
    /// The readiness probe timed out
    NotReady(BerthError),
}

/// What to do about an exit
#[derive(Debug)]
pub enum RestartDecision {
    /// Restart after `delay`
    Restart { attempt: u32, delay: Duration },
    /// Exited cleanly and stays stopped
    Settle,
    /// Fail the instance
    GiveUp(BerthError),
}

/// Applies restart policies
#[derive(Debug, Clone, Copy, Default)]
pub struct RestartSupervisor {
    backoff: Backoff,
}

impl RestartSupervisor {
    /// Create a supervisor with the given backoff
    pub fn new(backoff: Backoff) -> Self {
        Self { backoff }
    }

    /// Backoff in use
    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Decide how to react to `cause`, given the restarts already performed
    pub fn decide(&self, spec: &ServiceSpec, cause: ExitCause, restarts: u32) -> RestartDecision {
        let restart = match (&spec.restart, &cause) {
            (RestartPolicy::Never, _) => false,
            (RestartPolicy::OnFailure, ExitCause::Exited(status)) => !status.success(),
            (RestartPolicy::OnFailure, _) => true,
            (RestartPolicy::Always, _) => true,
        };

        if !restart {
            return match cause {
                ExitCause::Exited(status) if status.success() => RestartDecision::Settle,
                ExitCause::Exited(status) => RestartDecision::GiveUp(BerthError::launch(
                    &spec.name,
                    format!("exited with code {}", status.code),
                )),
                ExitCause::StartFailed(e) | ExitCause::NotReady(e) => RestartDecision::GiveUp(e),
            };
        }

        if let Some(max) = spec.max_restarts {
            if restarts >= max {
                return RestartDecision::GiveUp(BerthError::RestartsExhausted {
                    service: spec.name.clone(),
                    attempts: restarts,
                });
            }
        }

        let attempt = restarts + 1;
        RestartDecision::Restart {
            attempt,
            delay: self.backoff.delay(attempt),
        }
    }

    /// Announce restart `attempt` of `instance` and wait out `delay`.
    ///
    /// Fails with [`BerthError::Cancelled`] when the instance is stopped
    /// while waiting.
    pub async fn wait_backoff(
        &self,
        instance: &ServiceInstance,
        attempt: u32,
        delay: Duration,
    ) -> Result<()> {
        instance.record_restart();
        tracing::warn!(
            "Restarting service {} (attempt {}) in {:?}",
            instance.name(),
            attempt,
            delay
        );
        instance.emit(EventKind::RestartScheduled { attempt, delay });

        tokio::select! {
            biased;
            _ = instance.stop_token().cancelled() => Err(BerthError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}
