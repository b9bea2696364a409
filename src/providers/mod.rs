//! Model backends and the adapter that puts them in a fallback chain

pub mod ollama;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Error;
use crate::fallback::Operation;

// Re-export for convenience
pub use ollama::OllamaClient;

/// One outbound model call
#[derive(Debug, Clone, PartialEq)]
pub struct ModelCall
{   pub prompt: String
  , pub model: String
  , pub max_tokens: u32
  , pub temperature: f32
}

impl ModelCall
{   /// Same call, aimed at a different model
    pub fn for_model(&self, model: &str) -> ModelCall
    {   ModelCall
        {   model: model.to_string()
          , ..self.clone()
        }
    }
}

/// What a model returned
#[derive(Debug, Clone, PartialEq)]
pub struct ModelReply
{   pub text: String
  , pub model: String
  , pub tokens_used: u32
  , pub latency_ms: u64
}

/// Anything that can run a prompt against a named model.
#[async_trait]
pub trait ModelInvoker: Send + Sync
{   async fn invoke(&self, call: &ModelCall) -> Result<ModelReply, Error>;
}

/// A single model as a chain entry
pub struct ModelOperation
{   invoker: Arc<dyn ModelInvoker>
  , model: String
}

impl ModelOperation
{   pub fn new(invoker: Arc<dyn ModelInvoker>, model: impl Into<String>) -> Self
    {   ModelOperation
        {   invoker
          , model: model.into()
        }
    }
}

#[async_trait]
impl Operation<ModelCall, ModelReply> for ModelOperation
{   fn name(&self) -> &str
    {   &self.model
    }

    async fn run(&self, input: &ModelCall) -> Result<ModelReply, Error>
    {   self.invoker.invoke(&input.for_model(&self.model)).await
    }
}
