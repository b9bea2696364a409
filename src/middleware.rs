//! Request middleware: validation, the guarded model tier, the
//! terminal floor and per-request metrics.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;

use crate::breaker::{CircuitBreaker, CircuitSnapshot, CircuitState, FallbackReason};
use crate::config::RellmConfig;
use crate::error::{Error, ValidationError};
use crate::fallback::{
  Category, ChainOptions, FailureSimulator, FallbackStrategy, Forced, NoFailures,
};
use crate::monitor::{CostModel, PerformanceMonitor, PerformanceSummary};
use crate::providers::{ModelCall, ModelInvoker, ModelOperation, ModelReply, OllamaClient};
use crate::request::{FallbackLevel, Request, RequestContext, RequestOptions, Response};
use crate::terminal::{terminal_reply, terminal_response};

/// Per-model usage over the process lifetime
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelUsage
{   pub invocations: u64
  , pub fallback_invocations: u64
  , pub fallback_rate: f64
}

#[derive(Debug, Clone, Copy, Default)]
struct UsageCounts
{   invocations: u64
  , fallback_invocations: u64
}

pub struct RequestMiddleware
{   config: RellmConfig
  , invoker: Arc<dyn ModelInvoker>
  , breaker: CircuitBreaker
  , strategy: FallbackStrategy<ModelCall, ModelReply>
  , monitor: PerformanceMonitor
  , simulator: Arc<dyn FailureSimulator>
  , usage: Mutex<HashMap<String, UsageCounts>>
}

impl RequestMiddleware
{   /// Build a middleware over `invoker`. The generator chain holds
    /// the primary model followed by `config.models.fallbacks`, each
    /// model once.
    pub fn new(
      config: RellmConfig
    , invoker: Arc<dyn ModelInvoker>
    ) -> Result<Self, Error>
    {   config.validate()?;
        debug!(
          "Creating RequestMiddleware: primary {}, {} fallbacks",
          config.models.primary,
          config.models.fallbacks.len()
        );

        let simulator: Arc<dyn FailureSimulator> = Arc::new(NoFailures);
        let mut strategy = FallbackStrategy::new(|call: &ModelCall| {
            terminal_reply(&call.prompt)
          })
          .with_options(ChainOptions
          {   call_timeout: config.models.call_timeout()
            , simulator: simulator.clone()
          });
        let models = std::iter::once(&config.models.primary)
          .chain(config.models.fallbacks.iter());
        for model in models
        {   strategy.register(
              Category::Generator,
              Arc::new(ModelOperation::new(invoker.clone(), model.clone()))
            );
        }

        Ok(RequestMiddleware
        {   breaker: CircuitBreaker::new("model-tier", config.breaker.clone())
          , monitor: PerformanceMonitor::new(&config.monitor)
          , invoker
          , strategy
          , simulator
          , usage: Mutex::new(HashMap::new())
          , config
        })
    }

    /// Middleware talking to the Ollama server named in the config
    pub fn with_ollama(config: RellmConfig) -> Result<Self, Error>
    {   let client = OllamaClient::with_timeout(
          Some(config.models.api_base.clone()),
          config.models.call_timeout()
        )?;
        Self::new(config, Arc::new(client))
    }

    /// Install a failure simulator. Tests only.
    pub fn with_failure_simulator(
      mut self
    , simulator: Arc<dyn FailureSimulator>
    ) -> Self
    {   self.strategy = self.strategy.with_options(ChainOptions
        {   call_timeout: self.config.models.call_timeout()
          , simulator: simulator.clone()
        });
        self.simulator = simulator;
        self
    }

    pub fn with_cost_model(mut self, cost_model: Arc<dyn CostModel>) -> Self
    {   self.monitor = self.monitor.with_cost_model(cost_model);
        self
    }

    pub fn config(&self) -> &RellmConfig
    {   &self.config
    }

    /// Process one prompt. Only a malformed request is an error;
    /// every other failure ends in a (possibly degraded) response.
    pub async fn process_request(
      &self
    , prompt: impl Into<String>
    , options: RequestOptions
    ) -> Result<Response, ValidationError>
    {   let ctx = RequestContext::generate();
        let request = Request::new(
            prompt,
            options,
            &self.config.defaults,
            &self.config.models.primary,
            ctx.request_id.clone()
          )
          .map_err(|e| {
            warn!("{} rejected request: {}", ctx, e);
            e
          })?;
        info!("{} processing request for model {}", ctx, request.model());

        let call = ModelCall
        {   prompt: request.prompt().to_string()
          , model: request.model().to_string()
          , max_tokens: request.max_tokens()
          , temperature: request.temperature()
        };
        let started = Instant::now();
        let outcome = self.breaker
          .execute(
            &ctx,
            || self.run_model_tier(&ctx, &request, &call),
            |reason| {
              let response = self.terminal(&ctx, &request, &call, &reason);
              async move { Ok(response) }
            }
          )
          .await;

        let mut response = match outcome
        {   Ok(outcome) => outcome.into_value()
          , Err(e) => {
              error!("{} unrecovered error, using terminal: {}", ctx, e);
              terminal_response(request.prompt(), request.request_id())
            }
        };
        if response.fallback_level == FallbackLevel::Terminal
        {   response.latency_ms = started.elapsed().as_millis() as u64;
        }

        self.record_usage(request.model(), &response);
        let metrics = self.monitor.monitor(&ctx, &request, &response);
        info!(
          "{} served by {} (level {}) in {}ms, anomaly {:.2}",
          ctx,
          response.model_used,
          response.fallback_level.as_u8(),
          response.latency_ms,
          metrics.anomaly_score
        );
        Ok(response)
    }

    /// Requested model first, then the generator chain minus the
    /// requested model. Errs only when every model failed.
    async fn run_model_tier(
      &self
    , ctx: &RequestContext
    , request: &Request
    , call: &ModelCall
    ) -> Result<Response, Error>
    {   let flags = request.test_flags();

        let primary = if flags.force_all_models_fail
        {   Err(Error::SimulatedFailure(format!("forced: {}", call.model)))
        } else if flags.simulate_high_load
        {   Err(Error::Timeout)
        } else if self.simulator.should_fail(&call.model)
        {   Err(Error::SimulatedFailure(call.model.clone()))
        } else
        {   tokio::time::timeout(
                self.config.models.call_timeout(),
                self.invoker.invoke(call)
              )
              .await
              .map_err(Error::from)
              .and_then(|r| r)
        };

        let error = match primary
        {   Ok(reply) => {
              return Ok(Response::from_model(
                reply.text,
                call.model.clone(),
                reply.tokens_used,
                reply.latency_ms,
                FallbackLevel::Primary,
                request.request_id().to_string()
              ));
            }
          , Err(e) => e
        };
        warn!("{} primary model {} failed: {}", ctx, call.model, error);

        let forced = Forced
        {   all: flags.force_all_models_fail
          , first: flags.force_first_fallback_fail
        };

        match self.strategy
          .execute(ctx, Category::Generator, call, forced, Some(call.model.as_str()))
          .await
        {   Ok(served) => Ok(Response::from_model(
              served.value.text,
              served.operation,
              served.value.tokens_used,
              served.value.latency_ms,
              FallbackLevel::Alternate,
              request.request_id().to_string()
            ))
          , Err(failures) => Err(Error::ExhaustedFallback
            {   attempts: failures.len() + 1
            })
        }
    }

    /// Serve the generator chain's floor
    fn terminal(
      &self
    , ctx: &RequestContext
    , request: &Request
    , call: &ModelCall
    , reason: &FallbackReason
    ) -> Response
    {   match reason
        {   FallbackReason::CircuitOpen => {
              let e = Error::CircuitOpen(self.breaker.name().to_string());
              warn!("{} {}, serving terminal fallback", ctx, e);
            }
          , FallbackReason::PrimaryFailed(e) if e.is_transient() => {
              warn!("{} model tier failed ({}), serving terminal fallback", ctx, e);
            }
          , FallbackReason::PrimaryFailed(e) => {
              error!("{} {}, serving terminal fallback", ctx, e);
            }
        }
        let reply = self.strategy.terminal(call);
        Response::from_model(
          reply.text,
          reply.model,
          reply.tokens_used,
          reply.latency_ms,
          FallbackLevel::Terminal,
          request.request_id().to_string()
        )
    }

    /// Usage is keyed by the requested model, so the fallback rate
    /// shows how often requests for it were degraded.
    fn record_usage(&self, requested_model: &str, response: &Response)
    {   let mut usage = self.usage.lock();
        let counts = usage.entry(requested_model.to_string()).or_default();
        counts.invocations += 1;
        if response.fallback_used
        {   counts.fallback_invocations += 1;
        }
    }

    /// Aggregates over the rolling window
    pub fn recent_performance(&self) -> PerformanceSummary
    {   self.monitor.summary()
    }

    /// Invocation count and fallback rate per requested model
    pub fn model_usage_stats(&self) -> BTreeMap<String, ModelUsage>
    {   self.usage
          .lock()
          .iter()
          .map(|(model, counts)| {
            let fallback_rate = if counts.invocations == 0
            {   0.0
            } else
            {   counts.fallback_invocations as f64 / counts.invocations as f64
            };
            (model.clone(), ModelUsage
            {   invocations: counts.invocations
              , fallback_invocations: counts.fallback_invocations
              , fallback_rate
            })
          })
          .collect()
    }

    pub fn circuit_state(&self) -> CircuitState
    {   self.breaker.state()
    }

    pub fn circuit_snapshot(&self) -> CircuitSnapshot
    {   self.breaker.snapshot()
    }
}
