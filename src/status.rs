//! Rolling success/failure counters for one guarded component

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

/// Counters owned by a single circuit breaker.
/// Not synchronised; the owner serialises access.
#[derive(Debug, Clone)]
pub struct ComponentStatus
{   successes: u64
  , failures: u64
  , consecutive_failures: u32
  , total_latency_ms: u64
  , last_failures: VecDeque<DateTime<Utc>>
  , window: usize
}

impl ComponentStatus
{   pub fn new(window: usize) -> Self
    {   ComponentStatus
        {   successes: 0
          , failures: 0
          , consecutive_failures: 0
          , total_latency_ms: 0
          , last_failures: VecDeque::with_capacity(window)
          , window
        }
    }

    pub fn record_success(&mut self, latency_ms: u64)
    {   self.successes += 1;
        self.consecutive_failures = 0;
        self.total_latency_ms = self.total_latency_ms
          .saturating_add(latency_ms);
    }

    /// Count a failure. The timestamp window is kept for
    /// observability only.
    pub fn record_failure(&mut self, latency_ms: u64)
    {   self.failures += 1;
        self.consecutive_failures += 1;
        self.total_latency_ms = self.total_latency_ms
          .saturating_add(latency_ms);
        if self.window == 0
        {   return;
        }
        if self.last_failures.len() == self.window
        {   self.last_failures.pop_front();
        }
        self.last_failures.push_back(Utc::now());
    }

    /// `failures / (successes + failures)`, 0 with no samples
    pub fn failure_rate(&self) -> f64
    {   let total = self.total_samples();
        if total == 0
        {   return 0.0;
        }
        self.failures as f64 / total as f64
    }

    /// Zero the counters so recovery is judged on fresh evidence.
    /// The failure timestamp window survives.
    pub fn reset_counters(&mut self)
    {   self.successes = 0;
        self.failures = 0;
        self.consecutive_failures = 0;
        self.total_latency_ms = 0;
    }

    pub fn successes(&self) -> u64
    {   self.successes
    }

    pub fn failures(&self) -> u64
    {   self.failures
    }

    pub fn consecutive_failures(&self) -> u32
    {   self.consecutive_failures
    }

    pub fn total_samples(&self) -> u64
    {   self.successes + self.failures
    }

    pub fn total_latency_ms(&self) -> u64
    {   self.total_latency_ms
    }

    pub fn average_latency_ms(&self) -> f64
    {   let total = self.total_samples();
        if total == 0
        {   return 0.0;
        }
        self.total_latency_ms as f64 / total as f64
    }

    pub fn last_failures(&self) -> impl Iterator<Item = &DateTime<Utc>>
    {   self.last_failures.iter()
    }
}
