//! Ordered fallback chains with a terminal floor

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::request::RequestContext;

/// Component families that carry their own chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category
{   Embedder
  , Retriever
  , Generator
}

/// One alternative in a chain. Implementations are opaque services;
/// only success, failure and latency matter here.
#[async_trait]
pub trait Operation<I, O>: Send + Sync
where
  I: Sync,
  O: Send,
{   fn name(&self) -> &str;

    async fn run(&self, input: &I) -> Result<O, Error>;
}

/// Decides whether an operation should fail on purpose.
/// Only tests install anything other than [`NoFailures`].
pub trait FailureSimulator: Send + Sync
{   fn should_fail(&self, operation: &str) -> bool;
}

/// Production simulator
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFailures;

impl FailureSimulator for NoFailures
{   fn should_fail(&self, _operation: &str) -> bool
    {   false
    }
}

/// Per-call forced failures, driven by request test flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Forced
{   pub all: bool
  , pub first: bool
}

/// Settings shared by every run of a chain
#[derive(Clone)]
pub struct ChainOptions
{   pub call_timeout: Duration
  , pub simulator: Arc<dyn FailureSimulator>
}

impl Default for ChainOptions
{   fn default() -> Self
    {   ChainOptions
        {   call_timeout: Duration::from_secs(30)
          , simulator: Arc::new(NoFailures)
        }
    }
}

/// A failed chain entry, kept for observability
#[derive(Debug, Clone, PartialEq)]
pub struct FailedAttempt
{   pub operation: String
  , pub error: Error
}

/// A chain entry that succeeded
#[derive(Debug, Clone, PartialEq)]
pub struct Served<O>
{   pub value: O
  , pub operation: String
  , pub index: usize
  , pub failures: Vec<FailedAttempt>
}

/// Try `chain` in order. Returns the first success, or every
/// failure when the chain is exhausted (or empty).
pub async fn execute_chain<I, O>(
  ctx: &RequestContext
, chain: &[Arc<dyn Operation<I, O>>]
, input: &I
, options: &ChainOptions
, forced: Forced
) -> Result<Served<O>, Vec<FailedAttempt>>
where
  I: Sync,
  O: Send,
{   let mut failures = Vec::new();

    for (index, operation) in chain.iter().enumerate()
    {   let name = operation.name();
        debug!("{} trying fallback {} ({})", ctx, index, name);

        let result = if forced.all || (forced.first && index == 0)
        {   Err(Error::SimulatedFailure(format!("forced: {}", name)))
        } else if options.simulator.should_fail(name)
        {   Err(Error::SimulatedFailure(name.to_string()))
        } else
        {   tokio::time::timeout(options.call_timeout, operation.run(input))
              .await
              .map_err(Error::from)
              .and_then(|r| r)
        };

        match result
        {   Ok(value) => {
              debug!("{} fallback {} ({}) succeeded", ctx, index, name);
              return Ok(Served
              {   value
                , operation: name.to_string()
                , index
                , failures
              });
            }
          , Err(e) => {
              warn!("{} fallback {} ({}) failed: {}", ctx, index, name, e);
              failures.push(FailedAttempt
              {   operation: name.to_string()
                , error: e
              });
            }
        }
    }

    Err(failures)
}

type TerminalFn<I, O> = Arc<dyn Fn(&I) -> O + Send + Sync>;

/// Chains of alternates per [`Category`], all ending in the same
/// infallible terminal function.
pub struct FallbackStrategy<I, O>
where
  I: Sync,
  O: Send,
{   chains: HashMap<Category, Vec<Arc<dyn Operation<I, O>>>>
  , terminal: TerminalFn<I, O>
  , options: ChainOptions
}

impl<I, O> FallbackStrategy<I, O>
where
  I: Sync,
  O: Send,
{   pub fn new<F>(terminal: F) -> Self
    where
      F: Fn(&I) -> O + Send + Sync + 'static,
    {   FallbackStrategy
        {   chains: HashMap::new()
          , terminal: Arc::new(terminal)
          , options: ChainOptions::default()
        }
    }

    pub fn with_options(mut self, options: ChainOptions) -> Self
    {   self.options = options;
        self
    }

    /// Append `operation` to the end of `category`'s chain. An
    /// operation already registered under the same name is ignored.
    pub fn register(
      &mut self
    , category: Category
    , operation: Arc<dyn Operation<I, O>>
    )
    {   let chain = self.chains.entry(category).or_default();
        if chain.iter().any(|op| op.name() == operation.name())
        {   debug!("{:?} chain already holds {}", category, operation.name());
            return;
        }
        chain.push(operation);
    }

    /// Ordered alternates for `category`; empty when none registered
    pub fn chain(&self, category: Category)
      -> &[Arc<dyn Operation<I, O>>]
    {   self.chains
          .get(&category)
          .map(Vec::as_slice)
          .unwrap_or(&[])
    }

    pub fn options(&self) -> &ChainOptions
    {   &self.options
    }

    /// Run `category`'s chain in order, skipping the entry named
    /// `exclude`. On `Err` the caller serves [`Self::terminal`].
    pub async fn execute(
      &self
    , ctx: &RequestContext
    , category: Category
    , input: &I
    , forced: Forced
    , exclude: Option<&str>
    ) -> Result<Served<O>, Vec<FailedAttempt>>
    {   let chain: Vec<Arc<dyn Operation<I, O>>> = self
          .chain(category)
          .iter()
          .filter(|op| Some(op.name()) != exclude)
          .cloned()
          .collect();

        let result = execute_chain(ctx, &chain, input, &self.options, forced).await;
        if let Err(failures) = &result
        {   if failures.is_empty()
            {   debug!("{} no {:?} alternates to try", ctx, category);
            } else
            {   error!(
                  "{} {}",
                  ctx,
                  Error::ExhaustedFallback { attempts: failures.len() }
                );
            }
        }
        result
    }

    /// The floor under every chain. Cannot fail.
    pub fn terminal(&self, input: &I) -> O
    {   (self.terminal)(input)
    }
}

#[cfg(test)]
mod tests
{   use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed
    {   name: String
      , ok: bool
      , calls: AtomicUsize
    }

    impl Fixed
    {   fn new(name: &str, ok: bool) -> Arc<Self>
        {   Arc::new(Fixed
            {   name: name.to_string()
              , ok
              , calls: AtomicUsize::new(0)
            })
        }
    }

    #[async_trait]
    impl Operation<String, String> for Fixed
    {   fn name(&self) -> &str
        {   &self.name
        }

        async fn run(&self, input: &String) -> Result<String, Error>
        {   self.calls.fetch_add(1, Ordering::SeqCst);
            if self.ok
            {   Ok(format!("{}:{}", self.name, input))
            } else
            {   Err(Error::Api(format!("{} down", self.name)))
            }
        }
    }

    fn strategy() -> FallbackStrategy<String, String>
    {   FallbackStrategy::new(|input: &String| format!("terminal:{}", input))
    }

    #[tokio::test]
    async fn first_success_wins()
    {   let mut strategy = strategy();
        let down = Fixed::new("down", false);
        let up = Fixed::new("up", true);
        let never = Fixed::new("never", true);
        strategy.register(Category::Retriever, down.clone());
        strategy.register(Category::Retriever, up.clone());
        strategy.register(Category::Retriever, never.clone());

        let ctx = RequestContext::new("t");
        let served = strategy
          .execute(&ctx, Category::Retriever, &"q".to_string(), Forced::default(), None)
          .await
          .unwrap();
        assert_eq!(served.value, "up:q");
        assert_eq!(served.operation, "up");
        assert_eq!(served.index, 1);
        assert_eq!(served.failures.len(), 1);
        assert_eq!(never.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_chain_leaves_terminal()
    {   let strategy = strategy();
        let ctx = RequestContext::new("t");
        let failures = strategy
          .execute(&ctx, Category::Embedder, &"q".to_string(), Forced::default(), None)
          .await
          .unwrap_err();
        assert!(failures.is_empty());
        assert_eq!(strategy.terminal(&"q".to_string()), "terminal:q");
    }

    #[tokio::test]
    async fn forced_all_makes_no_calls()
    {   let mut strategy = strategy();
        let a = Fixed::new("a", true);
        let b = Fixed::new("b", true);
        strategy.register(Category::Generator, a.clone());
        strategy.register(Category::Generator, b.clone());

        let ctx = RequestContext::new("t");
        let forced = Forced { all: true, first: false };
        let failures = strategy
          .execute(&ctx, Category::Generator, &"q".to_string(), forced, None)
          .await
          .unwrap_err();
        assert_eq!(failures.len(), 2);
        assert_eq!(a.calls.load(Ordering::SeqCst), 0);
        assert_eq!(b.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn excluded_entry_is_skipped()
    {   let mut strategy = strategy();
        let a = Fixed::new("a", true);
        strategy.register(Category::Generator, a.clone());
        strategy.register(Category::Generator, Fixed::new("b", true));

        let ctx = RequestContext::new("t");
        let served = strategy
          .execute(&ctx, Category::Generator, &"q".to_string(), Forced::default(), Some("a"))
          .await
          .unwrap();
        assert_eq!(served.operation, "b");
        assert_eq!(served.index, 0);
        assert_eq!(a.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn duplicate_names_register_once()
    {   let mut strategy = strategy();
        strategy.register(Category::Generator, Fixed::new("a", true));
        strategy.register(Category::Generator, Fixed::new("a", false));
        strategy.register(Category::Generator, Fixed::new("b", true));
        let names: Vec<&str> = strategy
          .chain(Category::Generator)
          .iter()
          .map(|op| op.name())
          .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn simulator_skips_named_operation()
    {   struct FailNamed(&'static str);
        impl FailureSimulator for FailNamed
        {   fn should_fail(&self, operation: &str) -> bool
            {   operation == self.0
            }
        }

        let options = ChainOptions
        {   simulator: Arc::new(FailNamed("a"))
          , ..ChainOptions::default()
        };
        let mut strategy = strategy().with_options(options);
        let a = Fixed::new("a", true);
        strategy.register(Category::Generator, a.clone());
        strategy.register(Category::Generator, Fixed::new("b", true));

        let ctx = RequestContext::new("t");
        let served = strategy
          .execute(&ctx, Category::Generator, &"q".to_string(), Forced::default(), None)
          .await
          .unwrap();
        assert_eq!(served.value, "b:q");
        assert_eq!(a.calls.load(Ordering::SeqCst), 0);
    }
}
