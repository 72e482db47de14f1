//! The model backend seam.
//!
//! A [`Provider`] turns a prompt (a list of turns plus tool declarations) into
//! a [`Response`]. Concrete wire formats live in adapters such as
//! [`openrouter::OpenRouterProvider`].

pub mod openrouter;
pub mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::extension::ToolSpec;
use crate::memory::{Part, ToolCall, Turn};

pub use retry::{RetryConfig, retry_provider_call};

/// Everything a provider needs for one generation.
#[derive(Debug, Clone, Default)]
pub struct ProviderRequest {
    pub turns: Vec<Turn>,
    pub tools: Vec<ToolSpec>,
    pub stop_sequences: Vec<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub model: Option<String>,
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
}

impl Usage {
    /// Total tokens the prompt occupied, cached or not.
    pub fn prompt_tokens(&self) -> u64 {
        self.input_tokens + self.cache_read_tokens + self.cache_write_tokens
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
    Other,
}

impl StopReason {
    /// Map an OpenAI-style `finish_reason`.
    pub fn from_finish_reason(reason: Option<&str>) -> Self {
        match reason {
            Some("stop") | None => StopReason::EndTurn,
            Some("length") => StopReason::MaxTokens,
            Some("tool_calls") | Some("function_call") => StopReason::ToolUse,
            Some("stop_sequence") => StopReason::StopSequence,
            Some(_) => StopReason::Other,
        }
    }
}

/// One generation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    pub content: Vec<Part>,
    pub usage: Usage,
    pub stop_reason: StopReason,
}

impl Response {
    /// Concatenated text parts.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.content
            .iter()
            .filter_map(|p| match p {
                Part::ToolCall(call) => Some(call.clone()),
                _ => None,
            })
            .collect()
    }

    /// Thinking and redacted-thinking parts, in order.
    pub fn thinking(&self) -> Vec<Part> {
        self.content
            .iter()
            .filter(|p| matches!(p, Part::Thinking { .. } | Part::RedactedThinking { .. }))
            .cloned()
            .collect()
    }
}

/// Provider failures, split by whether a retry may help.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("retryable provider error: {0}")]
    Retryable(String),
    #[error("provider error: {0}")]
    Permanent(String),
}

impl ProviderError {
    /// Classify a raw error string with the transient/permanent heuristics.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        if retry::is_transient_error(&message) && !retry::is_permanent_error(&message) {
            ProviderError::Retryable(message)
        } else {
            ProviderError::Permanent(message)
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Retryable(_))
    }
}

/// A language-model backend.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Whether the backend returns structured tool calls. When false the
    /// orchestrator parses tags out of the text instead.
    fn supports_tool_use(&self) -> bool {
        true
    }

    async fn generate(&self, request: &ProviderRequest) -> Result<Response, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classify_uses_http_status() {
        assert!(ProviderError::classify("OpenRouter API HTTP 503: overloaded").is_retryable());
        assert!(!ProviderError::classify("OpenRouter API HTTP 401: unauthorized").is_retryable());
        assert!(!ProviderError::classify("something odd").is_retryable());
    }

    #[test]
    fn prompt_tokens_include_cache() {
        let usage = Usage {
            input_tokens: 100,
            output_tokens: 7,
            cache_read_tokens: 900,
            cache_write_tokens: 50,
        };
        assert_eq!(usage.prompt_tokens(), 1050);
    }

    #[test]
    fn response_accessors_split_parts() {
        let response = Response {
            content: vec![
                Part::Thinking {
                    thinking: "plan".into(),
                    signature: None,
                },
                Part::text("hello "),
                Part::ToolCall(ToolCall::new("c1", "bash", json!({"command": "ls"}))),
                Part::text("world"),
            ],
            ..Default::default()
        };
        assert_eq!(response.text(), "hello world");
        assert_eq!(response.tool_calls().len(), 1);
        assert_eq!(response.thinking().len(), 1);
    }

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(StopReason::from_finish_reason(Some("length")), StopReason::MaxTokens);
        assert_eq!(StopReason::from_finish_reason(Some("tool_calls")), StopReason::ToolUse);
        assert_eq!(StopReason::from_finish_reason(None), StopReason::EndTurn);
    }
}
