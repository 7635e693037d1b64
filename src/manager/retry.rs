//! Retry budgets and reconnect throttling
//!
//! Pure decision functions over [`RetryCounters`]; the manager applies the
//! decisions.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Thresholds for escalating failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Link failures before hopping to the next network
    #[serde(default = "default_hop_threshold")]
    pub hop_threshold: u32,
    /// Broker handshakes per link failure
    #[serde(default = "default_broker_attempt_budget")]
    pub broker_attempt_budget: u32,
}

fn default_hop_threshold() -> u32 {
    20
}

fn default_broker_attempt_budget() -> u32 {
    5
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            hop_threshold: default_hop_threshold(),
            broker_attempt_budget: default_broker_attempt_budget(),
        }
    }
}

/// Failure counters owned by one manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryCounters {
    pub link_failures: u32,
    pub broker_attempts: u32,
}

impl RetryCounters {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// What to do after recording a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    /// Hop threshold reached
    Failover,
}

impl RetryPolicy {
    /// Whether another handshake fits in the broker budget
    pub fn can_attempt_broker(&self, counters: &RetryCounters) -> bool {
        counters.broker_attempts < self.broker_attempt_budget
    }

    pub fn record_link_failure(&self, counters: &mut RetryCounters) -> RetryDecision {
        counters.link_failures = counters.link_failures.saturating_add(1);
        if counters.link_failures >= self.hop_threshold {
            RetryDecision::Failover
        } else {
            RetryDecision::Retry
        }
    }

    pub fn record_broker_failure(&self, counters: &mut RetryCounters) {
        counters.broker_attempts = counters.broker_attempts.saturating_add(1);
    }

    /// Convert an exhausted broker budget into one link failure
    ///
    /// Returns `None` while budget remains.
    pub fn roll_over(&self, counters: &mut RetryCounters) -> Option<RetryDecision> {
        if counters.broker_attempts < self.broker_attempt_budget {
            return None;
        }
        counters.broker_attempts = 0;
        Some(self.record_link_failure(counters))
    }
}

/// Monotonic throttle between reconnection attempts
#[derive(Debug, Clone)]
pub struct ReconnectTimer {
    interval: Duration,
    last: Option<Instant>,
}

impl ReconnectTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether the interval has elapsed since the last reset
    pub fn check(&self, now: Instant) -> bool {
        match self.last {
            Some(last) => now.saturating_duration_since(last) >= self.interval,
            None => true,
        }
    }

    pub fn reset(&mut self, now: Instant) {
        self.last = Some(now);
    }
}
