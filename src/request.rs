//! Request and response types shared by every layer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RequestDefaults;
use crate::error::ValidationError;

pub const MIN_MAX_TOKENS: u32 = 1;
pub const MAX_MAX_TOKENS: u32 = 4096;
pub const MAX_TEMPERATURE: f32 = 2.0;

/// Flags that force failure paths deterministically.
/// Never set by production callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestFlags
{   /// Fail the first alternate model in the chain
    pub force_first_fallback_fail: bool
  , /// Fail every model attempt, primary and alternates
    pub force_all_models_fail: bool
  , /// Fail the primary model attempt as if it timed out under load
    pub simulate_high_load: bool
}

/// Caller-supplied knobs, all optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestOptions
{   pub max_tokens: Option<u32>
  , pub temperature: Option<f32>
  , pub model: Option<String>
  , pub test_flags: TestFlags
}

impl RequestOptions
{   pub fn with_model(mut self, model: impl Into<String>) -> Self
    {   self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self
    {   self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self
    {   self.temperature = Some(temperature);
        self
    }

    pub fn with_test_flags(mut self, test_flags: TestFlags) -> Self
    {   self.test_flags = test_flags;
        self
    }
}

/// A validated inbound call. Fields are private so a Request can
/// only exist in a valid state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request
{   prompt: String
  , max_tokens: u32
  , temperature: f32
  , model: String
  , request_id: String
  , test_flags: TestFlags
}

impl Request
{   /// Build a request, applying defaults for unset options.
    pub fn new(
      prompt: impl Into<String>
    , options: RequestOptions
    , defaults: &RequestDefaults
    , default_model: &str
    , request_id: impl Into<String>
    ) -> Result<Self, ValidationError>
    {   let prompt = prompt.into();
        if prompt.trim().is_empty()
        {   return Err(ValidationError::EmptyPrompt);
        }

        let max_tokens = options.max_tokens
          .unwrap_or(defaults.max_tokens);
        if !(MIN_MAX_TOKENS..=MAX_MAX_TOKENS).contains(&max_tokens)
        {   return Err(ValidationError::MaxTokensOutOfRange(max_tokens));
        }

        let temperature = options.temperature
          .unwrap_or(defaults.temperature);
        if !(0.0..=MAX_TEMPERATURE).contains(&temperature)
        {   return Err(ValidationError::TemperatureOutOfRange(
              temperature
            ));
        }

        let model = options.model
          .unwrap_or_else(|| default_model.to_string());
        if model.trim().is_empty()
        {   return Err(ValidationError::EmptyModel);
        }

        Ok(Request
        {   prompt
          , max_tokens
          , temperature
          , model
          , request_id: request_id.into()
          , test_flags: options.test_flags
        })
    }

    pub fn prompt(&self) -> &str
    {   &self.prompt
    }

    pub fn max_tokens(&self) -> u32
    {   self.max_tokens
    }

    pub fn temperature(&self) -> f32
    {   self.temperature
    }

    pub fn model(&self) -> &str
    {   &self.model
    }

    pub fn request_id(&self) -> &str
    {   &self.request_id
    }

    pub fn test_flags(&self) -> TestFlags
    {   self.test_flags
    }
}

/// How degraded a response is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum FallbackLevel
{   /// The requested model answered
    Primary
  , /// An alternate model answered
    Alternate
  , /// The rule-based terminal fallback answered
    Terminal
}

impl FallbackLevel
{   pub fn as_u8(self) -> u8
    {   match self
        {   FallbackLevel::Primary => 0
          , FallbackLevel::Alternate => 1
          , FallbackLevel::Terminal => 2
        }
    }
}

impl From<FallbackLevel> for u8
{   fn from(level: FallbackLevel) -> u8
    {   level.as_u8()
    }
}

impl TryFrom<u8> for FallbackLevel
{   type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error>
    {   match value
        {   0 => Ok(FallbackLevel::Primary)
          , 1 => Ok(FallbackLevel::Alternate)
          , 2 => Ok(FallbackLevel::Terminal)
          , other => Err(format!("unknown fallback level {}", other))
        }
    }
}

/// Result returned to callers for every accepted request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response
{   pub text: String
  , pub model_used: String
  , pub tokens_used: u32
  , pub latency_ms: u64
  , pub fallback_used: bool
  , pub fallback_level: FallbackLevel
  , pub request_id: String
  , pub timestamp: DateTime<Utc>
}

impl Response
{   /// A response produced by a model. `fallback_used` is derived
    /// from the level so the two can never disagree.
    pub fn from_model(
      text: String
    , model_used: String
    , tokens_used: u32
    , latency_ms: u64
    , fallback_level: FallbackLevel
    , request_id: String
    ) -> Self
    {   Response
        {   text
          , model_used
          , tokens_used
          , latency_ms
          , fallback_used: fallback_level != FallbackLevel::Primary
          , fallback_level
          , request_id
          , timestamp: Utc::now()
        }
    }

    /// Plain JSON view handed to UI layers
    pub fn to_json(&self) -> serde_json::Value
    {   serde_json::to_value(self)
          .unwrap_or_else(|_| serde_json::json!({
            "text": self.text,
            "model_used": self.model_used,
            "fallback_used": self.fallback_used,
            "fallback_level": self.fallback_level.as_u8(),
            "request_id": self.request_id,
          }))
    }
}

/// Per-request correlation carried explicitly through the call chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext
{   pub request_id: String
}

impl RequestContext
{   pub fn new(request_id: impl Into<String>) -> Self
    {   RequestContext
        {   request_id: request_id.into()
        }
    }

    /// Generate a fresh, unique correlation id
    pub fn generate() -> Self
    {   Self::new(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for RequestContext
{   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {   write!(f, "[{}]", self.request_id)
    }
}

#[cfg(test)]
mod tests
{   use super::*;

    fn build(options: RequestOptions)
      -> Result<Request, ValidationError>
    {   Request::new(
          "What is the capital of France?",
          options,
          &RequestDefaults::default(),
          "gemma:2b",
          "req-1"
        )
    }

    #[test]
    fn applies_defaults()
    {   let request = build(RequestOptions::default()).unwrap();
        assert_eq!(request.max_tokens(), 100);
        assert_eq!(request.temperature(), 0.7);
        assert_eq!(request.model(), "gemma:2b");
        assert_eq!(request.test_flags(), TestFlags::default());
    }

    #[test]
    fn max_tokens_bounds()
    {   assert_eq!(
          build(RequestOptions::default().with_max_tokens(0)),
          Err(ValidationError::MaxTokensOutOfRange(0))
        );
        assert_eq!(
          build(RequestOptions::default().with_max_tokens(4097)),
          Err(ValidationError::MaxTokensOutOfRange(4097))
        );
        assert!(build(RequestOptions::default().with_max_tokens(1)).is_ok());
        assert!(build(RequestOptions::default().with_max_tokens(4096)).is_ok());
    }

    #[test]
    fn temperature_bounds()
    {   assert!(build(RequestOptions::default().with_temperature(0.0)).is_ok());
        assert!(build(RequestOptions::default().with_temperature(2.0)).is_ok());
        assert!(matches!(
          build(RequestOptions::default().with_temperature(2.1)),
          Err(ValidationError::TemperatureOutOfRange(_))
        ));
        assert!(matches!(
          build(RequestOptions::default().with_temperature(f32::NAN)),
          Err(ValidationError::TemperatureOutOfRange(_))
        ));
    }

    #[test]
    fn whitespace_prompt_is_empty()
    {   let result = Request::new(
          "   \n\t",
          RequestOptions::default(),
          &RequestDefaults::default(),
          "gemma:2b",
          "req-2"
        );
        assert_eq!(result, Err(ValidationError::EmptyPrompt));
    }

    #[test]
    fn fallback_level_serializes_as_integer()
    {   let response = Response::from_model(
          "hi".to_string(),
          "phi3:mini".to_string(),
          2,
          10,
          FallbackLevel::Alternate,
          "req-3".to_string()
        );
        let json = response.to_json();
        assert_eq!(json["fallback_level"], 1);
        assert_eq!(json["fallback_used"], true);
        assert_eq!(json["model_used"], "phi3:mini");
    }
}
