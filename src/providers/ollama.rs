use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, error, trace};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::providers::{ModelCall, ModelInvoker, ModelReply};

pub const OLLAMA_API_BASE: &str
  = "http://localhost:11434";

// ===== Message Types =====

#[derive(Debug, Clone, Serialize)]
pub struct GenerateOptions
{   pub num_predict: u32
  , pub temperature: f32
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerateRequest
{   pub model: String
  , pub prompt: String
  , pub stream: bool
  , pub options: GenerateOptions
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateResponse
{   pub model: String
  , pub response: String
  , #[serde(default)]
    pub prompt_eval_count: Option<u32>
  , #[serde(default)]
    pub eval_count: Option<u32>
}

#[derive(Debug, Clone, Deserialize)]
pub struct TagsResponse
{   pub models: Vec<TagData>
}

#[derive(Debug, Clone, Deserialize)]
pub struct TagData
{   pub name: String
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorBody
{   error: String
}

// ===== Client =====

/// HTTP client for a locally hosted Ollama server.
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct OllamaClient
{   api_base: String
  , http_client: reqwest::Client
}

impl OllamaClient
{   pub fn new(api_base: Option<String>) -> Self
    {   let api_base = api_base
          .unwrap_or_else(|| OLLAMA_API_BASE.to_string())
          .trim_end_matches('/')
          .to_string();
        debug!("Creating OllamaClient for {}", api_base);
        OllamaClient
        {   api_base
          , http_client: reqwest::Client::new()
        }
    }

    /// Client whose requests give up after `timeout`
    pub fn with_timeout(
      api_base: Option<String>
    , timeout: Duration
    ) -> Result<Self, Error>
    {   let mut client = Self::new(api_base);
        client.http_client = reqwest::Client::builder()
          .timeout(timeout)
          .build()
          .map_err(|e| {
            error!("Failed to build HTTP client: {}", e);
            Error::InvalidConfiguration(e.to_string())
          })?;
        Ok(client)
    }

    pub fn api_base(&self) -> &str
    {   &self.api_base
    }

    /// Names of the models the server has pulled
    pub async fn list_models(&self) -> Result<Vec<String>, Error>
    {   debug!("Handling list_models");

        let response = self.http_client
          .get(format!("{}/api/tags", self.api_base))
          .send()
          .await
          .map_err(map_transport_error)?;

        let status = response.status();
        trace!("Tags response status: {}", status);

        if !status.is_success()
        {   let error_text = response.text().await
              .unwrap_or_else(|_|
                "Unknown error".to_string()
              );
            error!("Failed to list models: {}", error_text);
            return Err(Error::Api(error_text));
        }

        let tags: TagsResponse
          = response.json().await.map_err(|e| {
            error!("Parse error: {}", e);
            Error::Parse(e.to_string())
          })?;

        let model_names: Vec<String>
          = tags.models
            .into_iter()
            .map(|m| m.name)
            .collect();

        debug!("Retrieved {} models", model_names.len());
        Ok(model_names)
    }
}

#[async_trait]
impl ModelInvoker for OllamaClient
{   async fn invoke(&self, call: &ModelCall) -> Result<ModelReply, Error>
    {   debug!("Handling generate for: {}", call.model);

        let request = GenerateRequest
        {   model: call.model.clone()
          , prompt: call.prompt.clone()
          , stream: false
          , options: GenerateOptions
            {   num_predict: call.max_tokens
              , temperature: call.temperature
            }
        };

        trace!("Ollama request: {:?}", request);

        let started = Instant::now();
        let response = self.http_client
          .post(format!("{}/api/generate", self.api_base))
          .json(&request)
          .send()
          .await
          .map_err(map_transport_error)?;

        let status = response.status();
        trace!("Ollama response status: {}", status);

        if !status.is_success()
        {   let error_text = response.text().await
              .unwrap_or_else(|_|
                "Unknown error".to_string()
              );
            let message = serde_json::from_str::<ErrorBody>(&error_text)
              .map(|body| body.error)
              .unwrap_or(error_text);
            error!("Ollama API error ({}): {}", status, message);
            if status == StatusCode::NOT_FOUND
            {   return Err(Error::ModelUnavailable(call.model.clone()));
            }
            return Err(Error::Api(
              format!("Ollama error {}: {}", status, message)
            ));
        }

        let generated: GenerateResponse
          = response.json().await.map_err(|e| {
            error!("Parse error: {}", e);
            Error::Parse(e.to_string())
          })?;

        if generated.response.trim().is_empty()
        {   error!("Empty completion from {}", call.model);
            return Err(Error::Parse(
              format!("empty completion from {}", call.model)
            ));
        }

        let tokens_used = generated.prompt_eval_count.unwrap_or(0)
          + generated.eval_count.unwrap_or(0);

        Ok(ModelReply
        {   text: generated.response
          , model: generated.model
          , tokens_used
          , latency_ms: started.elapsed().as_millis() as u64
        })
    }
}

fn map_transport_error(e: reqwest::Error) -> Error
{   error!("HTTP error: {}", e);
    if e.is_timeout()
    {   Error::Timeout
    } else
    {   Error::Http(e.to_string())
    }
}

#[cfg(test)]
mod tests
{   use super::*;

    #[test]
    fn trims_trailing_slash()
    {   let client = OllamaClient::new(
          Some("http://example:11434/".to_string())
        );
        assert_eq!(client.api_base(), "http://example:11434");
    }

    #[test]
    fn request_body_shape()
    {   let request = GenerateRequest
        {   model: "gemma:2b".to_string()
          , prompt: "hi".to_string()
          , stream: false
          , options: GenerateOptions
            {   num_predict: 100
              , temperature: 0.5
            }
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["stream"], false);
        assert_eq!(json["options"]["num_predict"], 100);
    }

    #[test]
    fn response_counts_are_optional()
    {   let parsed: GenerateResponse = serde_json::from_str(
          r#"{ "model": "gemma:2b", "response": "Paris", "done": true }"#
        ).unwrap();
        assert_eq!(parsed.response, "Paris");
        assert_eq!(parsed.eval_count, None);
    }
}
