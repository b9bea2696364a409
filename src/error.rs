//! Error taxonomy for rellm operations

use thiserror::Error;

/// Why a request was rejected before reaching any model.
/// Surfaced to the caller as-is, never converted into a fallback.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError
{   /// Prompt is empty after trimming
    #[error("prompt must not be empty")]
    EmptyPrompt
  , /// max_tokens outside [1, 4096]
    #[error("max_tokens must be in [1, 4096], got {0}")]
    MaxTokensOutOfRange(u32)
  , /// temperature outside [0, 2.0]
    #[error("temperature must be in [0, 2.0], got {0}")]
    TemperatureOutOfRange(f32)
  , /// Model identifier is blank
    #[error("model identifier must not be empty")]
    EmptyModel
}

/// Custom error type for rellm operations
/// Implements Clone for sending through channels
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error
{   /// Malformed request
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError)
  , /// Outbound call exceeded its deadline
    #[error("request timed out")]
    Timeout
  , /// Transport-level failure
    #[error("HTTP error: {0}")]
    Http(String)
  , /// Backend answered with a non-success status
    #[error("API error: {0}")]
    Api(String)
  , /// Backend answered with something we could not read
    #[error("parse error: {0}")]
    Parse(String)
  , /// Backend does not serve the requested model
    #[error("model unavailable: {0}")]
    ModelUnavailable(String)
  , /// Failure injected by a simulator or a test flag
    #[error("simulated failure: {0}")]
    SimulatedFailure(String)
  , /// Breaker refused to attempt the guarded operation
    #[error("circuit open for: {0}")]
    CircuitOpen(String)
  , /// Every operation in a fallback chain failed
    #[error("fallback chain exhausted after {attempts} attempts")]
    ExhaustedFallback
    {   attempts: usize
    }
  , /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String)
  , /// Backend task is gone
    #[error("backend error: {0}")]
    Backend(String)
  , /// Generic error
    #[error("error: {0}")]
    Other(String)
}

impl Error
{   /// True for failures of a downstream service call, the kind
    /// recorded against a breaker and recovered by fallback.
    pub fn is_transient(&self) -> bool
    {   matches!(
          self,
          Error::Timeout
            | Error::Http(_)
            | Error::Api(_)
            | Error::Parse(_)
            | Error::ModelUnavailable(_)
            | Error::SimulatedFailure(_)
        )
    }
}

impl From<String> for Error
{   fn from(s: String) -> Self
    {   Error::Other(s)
    }
}

impl From<&str> for Error
{   fn from(s: &str) -> Self
    {   Error::Other(s.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error
{   fn from(_: tokio::time::error::Elapsed) -> Self
    {   Error::Timeout
    }
}
