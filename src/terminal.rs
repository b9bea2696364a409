//! Rule-based terminal fallback. Pure, no I/O, cannot fail.

use crate::providers::ModelReply;
use crate::request::{FallbackLevel, Response};

/// `model_used` of every terminal response
pub const TERMINAL_MODEL: &str = "rule-based-fallback";

const DEGRADED_NOTICE: &str
  = "The service is running in degraded mode and no language model is available right now. Please try again shortly.";

const MAX_ECHO_CHARS: usize = 120;

const GREETINGS: [&str; 5] = ["hi", "hello", "hey", "good morning", "good evening"];
const SUMMARY_KEYWORDS: [&str; 4] = ["summarize", "summarise", "summary", "tl;dr"];

/// The rule-based reply for `prompt`, shaped like a model reply so it
/// can close a generator chain.
pub fn terminal_reply(prompt: &str) -> ModelReply
{   let text = rule_based_text(prompt);
    ModelReply
    {   tokens_used: text.split_whitespace().count() as u32
      , text
      , model: TERMINAL_MODEL.to_string()
      , latency_ms: 0
    }
}

/// Build the terminal response for `prompt`.
pub fn terminal_response(prompt: &str, request_id: &str) -> Response
{   let reply = terminal_reply(prompt);
    Response::from_model(
      reply.text,
      reply.model,
      reply.tokens_used,
      reply.latency_ms,
      FallbackLevel::Terminal,
      request_id.to_string()
    )
}

/// Deterministic text for a prompt, chosen by simple rules.
pub fn rule_based_text(prompt: &str) -> String
{   let trimmed = prompt.trim();
    let lower = trimmed.to_lowercase();

    if GREETINGS.iter().any(|g| starts_with_word(&lower, g))
    {   return format!("Hello! {}", DEGRADED_NOTICE);
    }

    if SUMMARY_KEYWORDS.iter().any(|k| lower.contains(k))
    {   let body = trimmed
          .split_once(':')
          .map(|(_, rest)| rest.trim())
          .unwrap_or(trimmed);
        if let Some(sentence) = first_sentence(body)
        {   return format!(
              "Summary (extractive, degraded mode): {}",
              truncate(sentence, MAX_ECHO_CHARS)
            );
        }
    }

    if trimmed.ends_with('?')
    {   return format!(
          "I can't answer \"{}\" at the moment. {}",
          truncate(trimmed, MAX_ECHO_CHARS),
          DEGRADED_NOTICE
        );
    }

    DEGRADED_NOTICE.to_string()
}

fn starts_with_word(text: &str, word: &str) -> bool
{   text.strip_prefix(word)
      .map(|rest| rest.is_empty() || !rest.starts_with(char::is_alphanumeric))
      .unwrap_or(false)
}

fn first_sentence(text: &str) -> Option<&str>
{   let end = text
      .find(&['.', '!', '?'][..])
      .map(|i| i + 1)
      .unwrap_or(text.len());
    let sentence = text[..end].trim();
    if sentence.is_empty()
    {   None
    } else
    {   Some(sentence)
    }
}

fn truncate(text: &str, max_chars: usize) -> String
{   if text.chars().count() <= max_chars
    {   return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}...", cut)
}
