//! Reconnection controller
//!
//! One controller per independent connection (the control channel, each
//! camera tile). It bounds the number of automatic attempts and spaces them
//! with an exponential delay:
//!
//! ```text
//! delay = min(base * multiplier ^ attempt_count, max_delay)
//! ```
//!
//! An attempt may start only when `now - last_attempt_at >= delay`. The
//! counter increments when an attempt starts and resets only on a confirmed
//! connection. Once it reaches `max_attempts` automatic attempts stop until
//! a manual reset.

use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Backoff parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Automatic attempts before giving up
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    /// Upper bound of the delay
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Required spacing before the next attempt, given the attempts made
    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        let exponent = attempt_count.min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }
}

/// Whether an attempt may start now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Proceed,
    /// Too early; wait this long
    Defer(Duration),
    /// Attempt limit reached, manual reset required
    Exhausted,
}

/// Attempt bookkeeping for one connection
#[derive(Debug, Clone)]
pub struct ReconnectController {
    policy: ReconnectPolicy,
    attempt_count: u32,
    last_attempt_at: Option<Instant>,
}

impl ReconnectController {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempt_count: 0,
            last_attempt_at: None,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn last_attempt_at(&self) -> Option<Instant> {
        self.last_attempt_at
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt_count >= self.policy.max_attempts
    }

    /// Check the gate without starting an attempt
    pub fn check(&self, now: Instant) -> Gate {
        if self.is_exhausted() {
            return Gate::Exhausted;
        }
        match self.last_attempt_at {
            None => Gate::Proceed,
            Some(last) => {
                let required = self.policy.delay_for(self.attempt_count);
                let elapsed = now.saturating_duration_since(last);
                if elapsed >= required {
                    Gate::Proceed
                } else {
                    Gate::Defer(required - elapsed)
                }
            }
        }
    }

    /// Start an attempt if the gate allows it
    pub fn try_begin(&mut self, now: Instant) -> Gate {
        let gate = self.check(now);
        if gate == Gate::Proceed {
            self.attempt_count += 1;
            self.last_attempt_at = Some(now);
        }
        gate
    }

    /// Connection confirmed
    ///
    /// The counter resets; the last attempt time is kept so a quick
    /// disconnect still waits the base delay.
    pub fn on_connected(&mut self) {
        self.attempt_count = 0;
    }

    /// Manual reset: the next attempt may start immediately
    pub fn reset(&mut self) {
        self.attempt_count = 0;
        self.last_attempt_at = None;
    }

    /// Wait until an attempt may start and begin it
    ///
    /// Deferred attempts sleep on a timer. When exhausted, waits for
    /// `manual` and resets. A `manual` signal also cuts a deferral short.
    /// Only signals raised while this call waits count: callers signal with
    /// `notify_waiters`, so a retry requested mid-attempt is not carried
    /// over into the next deferral. Returns the attempt number, or `None`
    /// if cancelled.
    pub async fn acquire(&mut self, cancel: &CancellationToken, manual: &Notify) -> Option<u32> {
        loop {
            match self.try_begin(Instant::now()) {
                Gate::Proceed => return Some(self.attempt_count),
                Gate::Defer(wait) => {
                    tracing::debug!(reason = %Error::RateLimited(wait), "Attempt deferred");
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(wait) => {}
                        _ = manual.notified() => self.reset(),
                    }
                }
                Gate::Exhausted => {
                    tracing::info!(
                        attempts = self.attempt_count,
                        "Automatic attempts exhausted, waiting for manual retry"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = manual.notified() => self.reset(),
                    }
                }
            }
        }
    }
}
