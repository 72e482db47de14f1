//! Configuration for the [`Orchestrator`](super::Orchestrator).
//!
//! ```ignore
//! let config = OrchestratorConfig::new()
//!     .with_max_iterations(50)
//!     .with_system_prompt("You are a careful operator.")
//!     .with_parse_mode(ParseMode::TagTree);
//! ```
//!
//! In TOML the same settings live under `[orchestrator]`; the retry policy has
//! its own `[retry]` table and is merged in by the CLI.

use serde::{Deserialize, Serialize};

use crate::memory::Visibility;
use crate::provider::RetryConfig;

/// Default cap on loop re-entries per session.
pub const DEFAULT_MAX_ITERATIONS: u32 = 1000;

/// How model output is turned into work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseMode {
    /// Structured tool calls when the provider supports them, tags otherwise.
    #[default]
    Auto,
    /// Parse the response text as a tag tree and fan it out to `on_tag`.
    TagTree,
    /// Queue the structured tool calls and dispatch them to capabilities.
    ToolUse,
}

impl ParseMode {
    /// Resolve `Auto` against what the provider can do.
    pub fn resolve(self, supports_tool_use: bool) -> ParseMode {
        match self {
            ParseMode::Auto if supports_tool_use => ParseMode::ToolUse,
            ParseMode::Auto => ParseMode::TagTree,
            mode => mode,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum loop re-entries before the session fails.
    pub max_iterations: u32,
    pub parse_mode: ParseMode,
    /// Projection used to build each prompt.
    pub visibility: Visibility,
    /// Whether the projection keeps turns produced in child scopes.
    pub include_children: bool,
    #[serde(skip)]
    pub retry: RetryConfig,
    /// Prepended to every prompt as a SYSTEM turn. Never stored in the scope.
    pub system_prompt: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub model: Option<String>,
    /// Stop sequences added to those the extensions declare.
    pub extra_stop_sequences: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            parse_mode: ParseMode::default(),
            visibility: Visibility::Session,
            include_children: true,
            retry: RetryConfig::default(),
            system_prompt: None,
            max_tokens: None,
            temperature: None,
            model: None,
            extra_stop_sequences: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_parse_mode(mut self, mode: ParseMode) -> Self {
        self.parse_mode = mode;
        self
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_include_children(mut self, include: bool) -> Self {
        self.include_children = include;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_stop_sequence(mut self, stop: impl Into<String>) -> Self {
        self.extra_stop_sequences.push(stop.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_iterations, 1000);
        assert_eq!(config.parse_mode, ParseMode::Auto);
        assert_eq!(config.visibility, Visibility::Session);
        assert!(config.include_children);
        assert!(config.system_prompt.is_none());
    }

    #[test]
    fn auto_mode_follows_provider() {
        assert_eq!(ParseMode::Auto.resolve(true), ParseMode::ToolUse);
        assert_eq!(ParseMode::Auto.resolve(false), ParseMode::TagTree);
        assert_eq!(ParseMode::TagTree.resolve(true), ParseMode::TagTree);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: OrchestratorConfig = toml::from_str(
            r#"
            max_iterations = 25
            parse_mode = "tag_tree"
            visibility = "scope"
            "#,
        )
        .unwrap();
        assert_eq!(config.max_iterations, 25);
        assert_eq!(config.parse_mode, ParseMode::TagTree);
        assert_eq!(config.visibility, Visibility::Scope);
        assert!(config.include_children);
    }

    #[test]
    fn builders_chain() {
        let config = OrchestratorConfig::new()
            .with_max_iterations(3)
            .with_system_prompt("be brief")
            .with_stop_sequence("</done>")
            .with_temperature(0.2);
        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.system_prompt.as_deref(), Some("be brief"));
        assert_eq!(config.extra_stop_sequences, vec!["</done>"]);
        assert_eq!(config.temperature, Some(0.2));
    }
}
