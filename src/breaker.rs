//! Circuit breaker guarding one operation.
//!
//! CLOSED lets every call through and trips to OPEN according to the
//! configured [`TripPolicy`]. OPEN answers with the fallback until the
//! recovery timeout has passed, then moves to HALF_OPEN and lets exactly
//! one probe through. A successful probe closes the circuit, a failed
//! one re-opens it immediately.

use std::future::Future;
use std::time::Instant;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::{BreakerConfig, TripPolicy};
use crate::error::Error;
use crate::request::RequestContext;
use crate::status::ComponentStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState
{   Closed
  , Open
  , HalfOpen
}

/// Why the fallback ran instead of the primary
#[derive(Debug, Clone, PartialEq)]
pub enum FallbackReason
{   /// Breaker refused to attempt the primary
    CircuitOpen
  , /// Primary was attempted and failed
    PrimaryFailed(Error)
}

/// What `execute` produced
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T>
{   Primary(T)
  , Fallback
    {   value: T
      , reason: FallbackReason
    }
}

impl<T> Outcome<T>
{   pub fn into_value(self) -> T
    {   match self
        {   Outcome::Primary(value) => value
          , Outcome::Fallback { value, .. } => value
        }
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitSnapshot
{   pub name: String
  , pub state: CircuitState
  , pub successes: u64
  , pub failures: u64
  , pub consecutive_failures: u32
  , pub failure_rate: f64
  , pub average_latency_ms: f64
  , pub recent_failures: Vec<DateTime<Utc>>
  , pub ms_since_state_change: u64
}

#[derive(Debug)]
struct Inner
{   state: CircuitState
  , status: ComponentStatus
  , last_state_change: Instant
  , probe_in_flight: bool
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission
{   Closed
  , Probe
}

pub struct CircuitBreaker
{   name: String
  , config: BreakerConfig
  , inner: Mutex<Inner>
}

impl CircuitBreaker
{   pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self
    {   let status = ComponentStatus::new(config.failure_window);
        CircuitBreaker
        {   name: name.into()
          , config
          , inner: Mutex::new(Inner
            {   state: CircuitState::Closed
              , status
              , last_state_change: Instant::now()
              , probe_in_flight: false
            })
        }
    }

    pub fn name(&self) -> &str
    {   &self.name
    }

    pub fn config(&self) -> &BreakerConfig
    {   &self.config
    }

    pub fn state(&self) -> CircuitState
    {   self.inner.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot
    {   let inner = self.inner.lock();
        CircuitSnapshot
        {   name: self.name.clone()
          , state: inner.state
          , successes: inner.status.successes()
          , failures: inner.status.failures()
          , consecutive_failures: inner.status.consecutive_failures()
          , failure_rate: inner.status.failure_rate()
          , average_latency_ms: inner.status.average_latency_ms()
          , recent_failures: inner.status.last_failures()
              .cloned()
              .collect()
          , ms_since_state_change:
              inner.last_state_change.elapsed().as_millis() as u64
        }
    }

    /// Run `primary` through the breaker, or `fallback` when the
    /// circuit refuses it or it fails. Only errors from `fallback`
    /// reach the caller.
    pub async fn execute<T, P, PFut, F, FFut>(
      &self
    , ctx: &RequestContext
    , primary: P
    , fallback: F
    ) -> Result<Outcome<T>, Error>
    where
      P: FnOnce() -> PFut,
      PFut: Future<Output = Result<T, Error>>,
      F: FnOnce(FallbackReason) -> FFut,
      FFut: Future<Output = Result<T, Error>>,
    {   let admission = match self.admit(ctx)
        {   Some(admission) => admission
          , None => {
              warn!(
                "{} circuit '{}' is open, primary not attempted",
                ctx, self.name
              );
              let value = fallback(FallbackReason::CircuitOpen).await?;
              return Ok(Outcome::Fallback
              {   value
                , reason: FallbackReason::CircuitOpen
              });
            }
        };

        let mut permit = Permit::new(self, admission, ctx);

        let started = Instant::now();
        let result = tokio::time::timeout(
            self.config.call_timeout(),
            primary()
          )
          .await
          .map_err(Error::from)
          .and_then(|r| r);
        let latency_ms = started.elapsed().as_millis() as u64;

        match result
        {   Ok(value) => {
              permit.settle(latency_ms, None);
              Ok(Outcome::Primary(value))
            }
          , Err(e) => {
              permit.settle(latency_ms, Some(&e));
              let reason = FallbackReason::PrimaryFailed(e);
              let value = fallback(reason.clone()).await?;
              Ok(Outcome::Fallback { value, reason })
            }
        }
    }

    /// Decide whether a call may attempt the primary.
    fn admit(&self, ctx: &RequestContext) -> Option<Admission>
    {   let mut inner = self.inner.lock();
        match inner.state
        {   CircuitState::Closed => Some(Admission::Closed)
          , CircuitState::Open => {
              let elapsed = inner.last_state_change.elapsed();
              if elapsed > self.config.recovery_timeout()
              {   inner.state = CircuitState::HalfOpen;
                  inner.status.reset_counters();
                  inner.last_state_change = Instant::now();
                  inner.probe_in_flight = true;
                  info!(
                    "{} circuit '{}' half-open after {:?}, probing",
                    ctx, self.name, elapsed
                  );
                  Some(Admission::Probe)
              } else
              {   None
              }
            }
          , CircuitState::HalfOpen => {
              if inner.probe_in_flight
              {   debug!(
                    "{} circuit '{}' probe already in flight",
                    ctx, self.name
                  );
                  None
              } else
              {   inner.probe_in_flight = true;
                  Some(Admission::Probe)
              }
            }
        }
    }

    fn record(
      &self
    , ctx: &RequestContext
    , admission: Admission
    , latency_ms: u64
    , error: Option<&Error>
    )
    {   let mut inner = self.inner.lock();
        match error
        {   None => {
              inner.status.record_success(latency_ms);
              if admission == Admission::Probe
              {   inner.state = CircuitState::Closed;
                  inner.last_state_change = Instant::now();
                  inner.probe_in_flight = false;
                  info!(
                    "{} circuit '{}' closed, probe succeeded",
                    ctx, self.name
                  );
              }
            }
          , Some(e) => {
              inner.status.record_failure(latency_ms);
              warn!(
                "{} circuit '{}' recorded failure: {}",
                ctx, self.name, e
              );
              if admission == Admission::Probe
              {   inner.state = CircuitState::Open;
                  inner.last_state_change = Instant::now();
                  inner.probe_in_flight = false;
                  warn!(
                    "{} circuit '{}' re-opened, probe failed",
                    ctx, self.name
                  );
              } else if inner.state == CircuitState::Closed
                && self.tripped(&inner.status)
              {   inner.state = CircuitState::Open;
                  inner.last_state_change = Instant::now();
                  warn!(
                    "{} circuit '{}' opened: {} failures / {} samples",
                    ctx,
                    self.name,
                    inner.status.failures(),
                    inner.status.total_samples()
                  );
              }
            }
        }
    }

    fn tripped(&self, status: &ComponentStatus) -> bool
    {   match self.config.policy
        {   TripPolicy::FailureRate { threshold, min_samples } => {
              status.total_samples() >= min_samples
                && status.failure_rate() >= threshold
            }
          , TripPolicy::ConsecutiveFailures { count } => {
              status.consecutive_failures() >= count
            }
        }
    }
}

/// Admission held while the primary runs. A probe dropped before it
/// reports (its request was cancelled) counts as a failed probe.
struct Permit<'a>
{   breaker: &'a CircuitBreaker
  , admission: Admission
  , ctx: RequestContext
  , settled: bool
}

impl<'a> Permit<'a>
{   fn new(
      breaker: &'a CircuitBreaker
    , admission: Admission
    , ctx: &RequestContext
    ) -> Self
    {   Permit
        {   breaker
          , admission
          , ctx: ctx.clone()
          , settled: false
        }
    }

    fn settle(&mut self, latency_ms: u64, error: Option<&Error>)
    {   self.settled = true;
        self.breaker.record(&self.ctx, self.admission, latency_ms, error);
    }
}

impl Drop for Permit<'_>
{   fn drop(&mut self)
    {   if self.settled || self.admission != Admission::Probe
        {   return;
        }
        self.breaker.record(
          &self.ctx,
          Admission::Probe,
          0,
          Some(&Error::Other("probe cancelled".to_string()))
        );
    }
}

#[cfg(test)]
mod tests
{   use super::*;

    fn consecutive(count: u32) -> BreakerConfig
    {   BreakerConfig
        {   policy: TripPolicy::ConsecutiveFailures { count }
          , recovery_timeout_ms: 60_000
          , ..BreakerConfig::default()
        }
    }

    #[tokio::test]
    async fn success_stays_closed()
    {   let breaker = CircuitBreaker::new("unit", consecutive(1));
        let ctx = RequestContext::new("t");
        let outcome = breaker
          .execute(
            &ctx,
            || async { Ok::<_, Error>(1) },
            |_| async { Ok(2) }
          )
          .await
          .unwrap();
        assert_eq!(outcome, Outcome::Primary(1));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn fallback_error_propagates()
    {   let breaker = CircuitBreaker::new("unit", consecutive(5));
        let ctx = RequestContext::new("t");
        let result = breaker
          .execute(
            &ctx,
            || async { Err::<u8, _>(Error::Timeout) },
            |_| async { Err(Error::Other("no floor".to_string())) }
          )
          .await;
        assert_eq!(result, Err(Error::Other("no floor".to_string())));
    }

    #[tokio::test]
    async fn dropped_probe_reopens()
    {   let config = BreakerConfig
        {   policy: TripPolicy::ConsecutiveFailures { count: 1 }
          , recovery_timeout_ms: 0
          , ..BreakerConfig::default()
        };
        let breaker = CircuitBreaker::new("unit", config);
        let ctx = RequestContext::new("t");
        let _ = breaker
          .execute(
            &ctx,
            || async { Err::<u8, _>(Error::Timeout) },
            |_| async { Ok(0) }
          )
          .await;
        assert_eq!(breaker.state(), CircuitState::Open);
        std::thread::sleep(std::time::Duration::from_millis(2));

        let probe = breaker.execute(
          &ctx,
          || std::future::pending::<Result<u8, Error>>(),
          |_| async { Ok(0) }
        );
        let timed_out = tokio::time::timeout(
          std::time::Duration::from_millis(10),
          probe
        ).await;
        assert!(timed_out.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn unsettled_permit_reports_under_its_request()
    {   let breaker = CircuitBreaker::new("unit", consecutive(1));
        {   let mut inner = breaker.inner.lock();
            inner.state = CircuitState::HalfOpen;
            inner.probe_in_flight = true;
        }

        let permit = Permit::new(&breaker, Admission::Probe, &RequestContext::new("req-42"));
        assert_eq!(permit.ctx.request_id, "req-42");
        drop(permit);

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.failures, 1);
        assert!(!breaker.inner.lock().probe_in_flight);
    }

    #[test]
    fn settled_permit_records_once()
    {   let breaker = CircuitBreaker::new("unit", consecutive(5));
        let mut permit = Permit::new(&breaker, Admission::Closed, &RequestContext::new("t"));
        permit.settle(3, None);
        drop(permit);
        assert_eq!(breaker.snapshot().successes, 1);
        assert_eq!(breaker.snapshot().failures, 0);
    }
}
