//! Configuration for models, the circuit breaker and the monitor

use std::fs;
use std::path::Path;
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Model tier configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig
{   /// Model used when a request names none
    pub primary: String
  , /// Alternate models, highest priority first
    pub fallbacks: Vec<String>
  , /// Base URL of the model server
    pub api_base: String
  , /// Deadline for a single model call in milliseconds
    pub call_timeout_ms: u64
}

impl Default for ModelsConfig
{   fn default() -> Self
    {   ModelsConfig
        {   primary: "gemma:2b".to_string()
          , fallbacks: vec![
              "llama3.2:1b".to_string()
            , "phi3:mini".to_string()
            ]
          , api_base: "http://localhost:11434".to_string()
          , call_timeout_ms: 30_000
        }
    }
}

impl ModelsConfig
{   pub fn call_timeout(&self) -> Duration
    {   Duration::from_millis(self.call_timeout_ms)
    }

    /// Most model calls one request can make: the requested model,
    /// the primary, then every fallback.
    pub fn max_attempts(&self) -> u64
    {   2 + self.fallbacks.len() as u64
    }
}

/// When a closed circuit opens.
///
/// `FailureRate` is the production policy. `ConsecutiveFailures`
/// must be chosen explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TripPolicy
{   /// Open once `failures / total >= threshold` with at least
    /// `min_samples` calls observed since the last reset
    FailureRate
    {   threshold: f64
      , min_samples: u64
    }
  , /// Open after `count` failures in a row
    ConsecutiveFailures
    {   count: u32
    }
}

impl Default for TripPolicy
{   fn default() -> Self
    {   TripPolicy::FailureRate
        {   threshold: 0.5
          , min_samples: 5
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig
{   pub policy: TripPolicy
  , /// How long an open circuit waits before letting a probe through
    pub recovery_timeout_ms: u64
  , /// Deadline for the whole guarded operation. Must outlast every
    /// model attempt of one request.
    pub call_timeout_ms: u64
  , /// How many failure timestamps to keep for observability
    pub failure_window: usize
}

impl Default for BreakerConfig
{   fn default() -> Self
    {   BreakerConfig
        {   policy: TripPolicy::default()
          , recovery_timeout_ms: 30_000
          , call_timeout_ms: 150_000
          , failure_window: 20
        }
    }
}

impl BreakerConfig
{   pub fn recovery_timeout(&self) -> Duration
    {   Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration
    {   Duration::from_millis(self.call_timeout_ms)
    }
}

/// Performance monitor and anomaly detector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig
{   /// Rolling history size
    pub history_capacity: usize
  , /// History entries needed before any anomaly can be scored
    pub min_samples: usize
  , /// z-score mapped to an anomaly score of 1.0
    pub z_score_ceiling: f64
  , /// Scores above this are logged as warnings
    pub anomaly_warn_threshold: f64
}

impl Default for MonitorConfig
{   fn default() -> Self
    {   MonitorConfig
        {   history_capacity: 50
          , min_samples: 10
          , z_score_ceiling: 3.0
          , anomaly_warn_threshold: 0.7
        }
    }
}

/// Values applied when a request leaves them unset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestDefaults
{   pub max_tokens: u32
  , pub temperature: f32
}

impl Default for RequestDefaults
{   fn default() -> Self
    {   RequestDefaults
        {   max_tokens: 100
          , temperature: 0.7
        }
    }
}

/// rellm configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RellmConfig
{   pub models: ModelsConfig
  , pub breaker: BreakerConfig
  , pub monitor: MonitorConfig
  , pub defaults: RequestDefaults
}

impl RellmConfig
{   /// Parse and validate a JSON document. Missing sections
    /// take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, Error>
    {   let config: RellmConfig = serde_json::from_str(json)
          .map_err(|e| Error::InvalidConfiguration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P)
      -> Result<Self, Error>
    {   let path = path.as_ref();
        debug!("Loading configuration from {}", path.display());
        let json = fs::read_to_string(path).map_err(|e| {
          Error::InvalidConfiguration(
            format!("{}: {}", path.display(), e)
          )
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), Error>
    {   if self.models.primary.trim().is_empty()
        {   return Err(Error::InvalidConfiguration(
              "models.primary must not be empty".to_string()
            ));
        }
        match self.breaker.policy
        {   TripPolicy::FailureRate { threshold, min_samples } => {
              if !(threshold > 0.0 && threshold <= 1.0)
              {   return Err(Error::InvalidConfiguration(format!(
                    "breaker threshold must be in (0, 1], got {}",
                    threshold
                  )));
              }
              if min_samples == 0
              {   return Err(Error::InvalidConfiguration(
                    "breaker min_samples must be at least 1".to_string()
                  ));
              }
            }
          , TripPolicy::ConsecutiveFailures { count } => {
              if count == 0
              {   return Err(Error::InvalidConfiguration(
                    "breaker count must be at least 1".to_string()
                  ));
              }
            }
        }
        if self.monitor.history_capacity == 0
        {   return Err(Error::InvalidConfiguration(
              "monitor.history_capacity must be at least 1".to_string()
            ));
        }
        let model_budget = self.models.call_timeout_ms
          .saturating_mul(self.models.max_attempts());
        if self.breaker.call_timeout_ms <= model_budget
        {   return Err(Error::InvalidConfiguration(format!(
              "breaker.call_timeout_ms must exceed {} ({} model attempts of {}ms), got {}",
              model_budget,
              self.models.max_attempts(),
              self.models.call_timeout_ms,
              self.breaker.call_timeout_ms
            )));
        }
        let ceiling = self.monitor.z_score_ceiling;
        if !(ceiling.is_finite() && ceiling > 0.0)
        {   return Err(Error::InvalidConfiguration(format!(
              "monitor.z_score_ceiling must be positive, got {}",
              ceiling
            )));
        }
        if !(0.0..=1.0).contains(&self.monitor.anomaly_warn_threshold)
        {   return Err(Error::InvalidConfiguration(format!(
              "monitor.anomaly_warn_threshold must be in [0, 1], got {}",
              self.monitor.anomaly_warn_threshold
            )));
        }
        Ok(())
    }
}
