//! Per-request performance metrics and anomaly scoring over a
//! bounded rolling history.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::MonitorConfig;
use crate::request::{FallbackLevel, Request, RequestContext, Response};

/// Derived metrics for one completed request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceMetrics
{   pub request_id: String
  , pub model: String
  , pub prompt_tokens: u32
  , pub completion_tokens: u32
  , pub total_tokens: u32
  , pub latency_ms: u64
  , pub estimated_cost: f64
  , pub anomaly_score: f64
  , pub fallback_level: FallbackLevel
}

/// Estimates what a call cost
pub trait CostModel: Send + Sync
{   fn estimate(
      &self
    , model: &str
    , prompt_tokens: u32
    , completion_tokens: u32
    ) -> f64;
}

/// Locally hosted models cost nothing per call
#[derive(Debug, Clone, Copy, Default)]
pub struct SelfHosted;

impl CostModel for SelfHosted
{   fn estimate(&self, _model: &str, _prompt: u32, _completion: u32) -> f64
    {   0.0
    }
}

/// Flat USD pricing per million tokens
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerTokenPricing
{   pub input_per_million: f64
  , pub output_per_million: f64
}

impl CostModel for PerTokenPricing
{   fn estimate(&self, _model: &str, prompt: u32, completion: u32) -> f64
    {   (prompt as f64 * self.input_per_million
          + completion as f64 * self.output_per_million)
          / 1_000_000.0
    }
}

/// One entry of the rolling history
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample
{   pub latency_ms: f64
  , pub tokens: f64
  , pub estimated_cost: f64
  , pub anomaly_score: f64
}

/// Mean and population standard deviation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RollingStats
{   pub mean: f64
  , pub std_dev: f64
}

impl RollingStats
{   fn of(values: impl Iterator<Item = f64> + Clone) -> Option<Self>
    {   let count = values.clone().count();
        if count == 0
        {   return None;
        }
        let n = count as f64;
        let mean = values.clone().sum::<f64>() / n;
        let variance = values.map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Some(RollingStats
        {   mean
          , std_dev: variance.sqrt()
        })
    }
}

/// Fixed-capacity ring buffer; the oldest sample is evicted first.
#[derive(Debug, Clone)]
pub struct MetricsHistory
{   samples: VecDeque<Sample>
  , capacity: usize
}

impl MetricsHistory
{   pub fn new(capacity: usize) -> Self
    {   let capacity = capacity.max(1);
        MetricsHistory
        {   samples: VecDeque::with_capacity(capacity)
          , capacity
        }
    }

    pub fn push(&mut self, sample: Sample)
    {   if self.samples.len() == self.capacity
        {   self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize
    {   self.samples.len()
    }

    pub fn is_empty(&self) -> bool
    {   self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize
    {   self.capacity
    }

    pub fn latency_stats(&self) -> Option<RollingStats>
    {   RollingStats::of(self.samples.iter().map(|s| s.latency_ms))
    }

    pub fn token_stats(&self) -> Option<RollingStats>
    {   RollingStats::of(self.samples.iter().map(|s| s.tokens))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample>
    {   self.samples.iter()
    }
}

/// z-score anomaly scoring against a history snapshot
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnomalyDetector
{   min_samples: usize
  , z_score_ceiling: f64
}

impl AnomalyDetector
{   pub fn new(min_samples: usize, z_score_ceiling: f64) -> Self
    {   AnomalyDetector
        {   min_samples
          , z_score_ceiling
        }
    }

    /// Score in [0, 1]: the larger of the latency and token z-scores
    /// divided by the ceiling. 0 until `min_samples` history exists.
    /// `history` must not already contain the scored request.
    pub fn score(
      &self
    , latency_ms: f64
    , tokens: f64
    , history: &MetricsHistory
    ) -> f64
    {   if history.len() < self.min_samples.max(1)
        {   return 0.0;
        }
        let (latency, token) = match (history.latency_stats(), history.token_stats())
        {   (Some(l), Some(t)) => (l, t)
          , _ => return 0.0
        };
        let z = z_score(latency_ms, &latency).max(z_score(tokens, &token));
        (z / self.z_score_ceiling).clamp(0.0, 1.0)
    }
}

impl From<&MonitorConfig> for AnomalyDetector
{   fn from(config: &MonitorConfig) -> Self
    {   AnomalyDetector::new(config.min_samples, config.z_score_ceiling)
    }
}

// A flat history has no spread; one unit is the smallest deviation
// worth measuring.
fn z_score(value: f64, stats: &RollingStats) -> f64
{   (value - stats.mean).abs() / stats.std_dev.max(1.0)
}

/// Aggregates over the rolling window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSummary
{   pub count: usize
  , pub avg_latency_ms: f64
  , pub avg_tokens: f64
  , pub total_estimated_cost: f64
  , pub anomaly_rate: f64
}

/// Computes metrics for each response and owns the process-wide
/// history. All history access goes through one lock.
pub struct PerformanceMonitor
{   history: Mutex<MetricsHistory>
  , detector: AnomalyDetector
  , cost_model: Arc<dyn CostModel>
  , warn_threshold: f64
}

impl PerformanceMonitor
{   pub fn new(config: &MonitorConfig) -> Self
    {   PerformanceMonitor
        {   history: Mutex::new(MetricsHistory::new(config.history_capacity))
          , detector: AnomalyDetector::from(config)
          , cost_model: Arc::new(SelfHosted)
          , warn_threshold: config.anomaly_warn_threshold
        }
    }

    pub fn with_cost_model(mut self, cost_model: Arc<dyn CostModel>) -> Self
    {   self.cost_model = cost_model;
        self
    }

    /// Derive metrics for `response`, score them and append them to
    /// the history.
    pub fn monitor(
      &self
    , ctx: &RequestContext
    , request: &Request
    , response: &Response
    ) -> PerformanceMetrics
    {   let total_tokens = response.tokens_used;
        let prompt_tokens = total_tokens / 2;
        let completion_tokens = total_tokens - prompt_tokens;
        let estimated_cost = self.cost_model.estimate(
          &response.model_used,
          prompt_tokens,
          completion_tokens
        );

        let latency = response.latency_ms as f64;
        let tokens = total_tokens as f64;
        let anomaly_score = {
          let mut history = self.history.lock();
          let score = self.detector.score(latency, tokens, &history);
          history.push(Sample
          {   latency_ms: latency
            , tokens
            , estimated_cost
            , anomaly_score: score
          });
          score
        };

        if anomaly_score > self.warn_threshold
        {   warn!(
              "{} anomalous request: score {:.2}, latency {}ms, {} tokens, model {}",
              ctx,
              anomaly_score,
              response.latency_ms,
              total_tokens,
              response.model_used
            );
        } else
        {   debug!(
              "{} metrics: score {:.2}, latency {}ms, {} tokens",
              ctx, anomaly_score, response.latency_ms, total_tokens
            );
        }

        PerformanceMetrics
        {   request_id: request.request_id().to_string()
          , model: response.model_used.clone()
          , prompt_tokens
          , completion_tokens
          , total_tokens
          , latency_ms: response.latency_ms
          , estimated_cost
          , anomaly_score
          , fallback_level: response.fallback_level
        }
    }

    pub fn summary(&self) -> PerformanceSummary
    {   let history = self.history.lock();
        let count = history.len();
        if count == 0
        {   return PerformanceSummary
            {   count: 0
              , avg_latency_ms: 0.0
              , avg_tokens: 0.0
              , total_estimated_cost: 0.0
              , anomaly_rate: 0.0
            };
        }
        let n = count as f64;
        let anomalies = history
          .iter()
          .filter(|s| s.anomaly_score > self.warn_threshold)
          .count();
        PerformanceSummary
        {   count
          , avg_latency_ms: history.iter().map(|s| s.latency_ms).sum::<f64>() / n
          , avg_tokens: history.iter().map(|s| s.tokens).sum::<f64>() / n
          , total_estimated_cost: history.iter().map(|s| s.estimated_cost).sum()
          , anomaly_rate: anomalies as f64 / n
        }
    }
}
