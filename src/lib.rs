pub mod error;
pub mod config;
pub mod logging;
pub mod request;
pub mod status;
pub mod breaker;
pub mod fallback;
pub mod terminal;
pub mod monitor;
pub mod providers;
pub mod middleware;
pub mod client;

use std::collections::BTreeMap;

pub use breaker::{CircuitBreaker, CircuitSnapshot, CircuitState, FallbackReason, Outcome};
pub use client::RellmBackend;
pub use config::{BreakerConfig, ModelsConfig, MonitorConfig, RellmConfig, TripPolicy};
pub use error::{Error, ValidationError};
pub use fallback::{Category, FailureSimulator, FallbackStrategy, NoFailures, Operation};
pub use middleware::{ModelUsage, RequestMiddleware};
pub use monitor::{PerformanceMetrics, PerformanceSummary};
pub use request::{FallbackLevel, RequestOptions, Response, TestFlags};

/*

rellm (resilient LLM) puts a circuit breaker, an ordered chain of
alternate models and a rule-based floor in front of a locally hosted
model server, and keeps rolling latency/token statistics for
anomaly scoring.

rellm/
├── Cargo.toml
├── src/
│   ├── lib.rs          # Re-exports and the channel API
│   ├── error.rs        # Error taxonomy
│   ├── config.rs       # Models, breaker, monitor configuration
│   ├── logging.rs      # env_logger setup
│   ├── request.rs      # Request/response types
│   ├── status.rs       # Per-component counters
│   ├── breaker.rs      # Circuit breaker state machine
│   ├── fallback.rs     # Fallback chains and strategy
│   ├── terminal.rs     # Rule-based terminal fallback
│   ├── monitor.rs      # Metrics, history, anomaly detection
│   ├── middleware.rs   # Request middleware facade
│   ├── client.rs       # Actor backend owning the middleware
│   └── providers/      # Model backends
│       ├── mod.rs
│       └── ollama.rs
└── tests/

*/

/// RELLM API INTERFACE:

// ===== ProcessRequest =====

pub type ProcessRequestReply = Result<Response, ValidationError>;
pub type ProcessRequestReplySender
  = tokio::sync::mpsc::UnboundedSender<ProcessRequestReply>;

pub struct ProcessRequestArgs
{   pub prompt: String
  , pub options: RequestOptions
  , pub reply: ProcessRequestReplySender
}

// ===== GetRecentPerformance =====

pub type GetRecentPerformanceReply = PerformanceSummary;
pub type GetRecentPerformanceReplySender
  = tokio::sync::mpsc::UnboundedSender<GetRecentPerformanceReply>;

pub struct GetRecentPerformanceArgs
{   pub reply: GetRecentPerformanceReplySender
}

// ===== GetModelUsageStats =====

pub type GetModelUsageStatsReply = BTreeMap<String, ModelUsage>;
pub type GetModelUsageStatsReplySender
  = tokio::sync::mpsc::UnboundedSender<GetModelUsageStatsReply>;

pub struct GetModelUsageStatsArgs
{   pub reply: GetModelUsageStatsReplySender
}

// ===== KillProcess =====

pub type KillProcessReply = Result<(), Error>;
pub type KillProcessReplySender
  = tokio::sync::mpsc::UnboundedSender<KillProcessReply>;

pub struct KillProcessArgs
{   pub reply: KillProcessReplySender
}

// ===== RellmHand (sender side) =====

pub struct RellmHand
{   pub process_request_tx
      : tokio::sync::mpsc::UnboundedSender<ProcessRequestArgs>
  , pub get_recent_performance_tx
      : tokio::sync::mpsc::UnboundedSender<GetRecentPerformanceArgs>
  , pub get_model_usage_stats_tx
      : tokio::sync::mpsc::UnboundedSender<GetModelUsageStatsArgs>
  , pub kill_process_tx
      : tokio::sync::mpsc::UnboundedSender<KillProcessArgs>
}

// ===== RellmFoot (receiver side) =====

pub struct RellmFoot
{   pub process_request_rx
      : tokio::sync::mpsc::UnboundedReceiver<ProcessRequestArgs>
  , pub get_recent_performance_rx
      : tokio::sync::mpsc::UnboundedReceiver<GetRecentPerformanceArgs>
  , pub get_model_usage_stats_rx
      : tokio::sync::mpsc::UnboundedReceiver<GetModelUsageStatsArgs>
  , pub kill_process_rx
      : tokio::sync::mpsc::UnboundedReceiver<KillProcessArgs>
}
