//! Error types shared across the engine.
//!
//! Control outcomes (interruption, termination) are not errors and live in
//! [`crate::extension::Halt`]. Everything here is a genuine failure that
//! either ends the session or is converted into an error turn.

use thiserror::Error;

use crate::provider::ProviderError;

/// Fatal failures surfaced by [`Orchestrator::run`](crate::orchestrator::Orchestrator::run).
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// The loop re-entered more times than `max_iterations` allows.
    #[error(
        "Maximum number of iterations reached: {max}, Please start a new session with updated context."
    )]
    IterationLimitExceeded { max: u32 },

    /// The provider failed permanently or exhausted its retries.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// A capability failed with an error it does not consider retryable.
    #[error("tool use `{name}` (id: {id}) failed: {source}")]
    Tool {
        name: String,
        id: String,
        #[source]
        source: ToolError,
    },

    /// An extension hook failed outside of the tool-dispatch path.
    #[error("hook `{hook}` in `{extension}` failed: {message}")]
    Hook {
        extension: String,
        hook: &'static str,
        message: String,
    },

    /// The session was cancelled somewhere other than the run entry point.
    #[error("session cancelled")]
    Cancelled,

    /// Invalid configuration (e.g. compactor thresholds out of order).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Saving or loading conversation state failed.
    #[error("persistence error: {0}")]
    Persistence(String),
}

/// Errors raised while dispatching a single tool call.
///
/// The `Display` form is `"{Kind}: {message}"` so it can be embedded
/// verbatim in the tool-failure texts the model sees.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    /// The arguments did not deserialize or violated the declared schema.
    #[error("InvalidInput: {0}")]
    InvalidInput(String),

    /// A policy check (e.g. the command sandbox) rejected the call.
    #[error("ValidationError: {0}")]
    Validation(String),

    /// The tool ran and failed.
    #[error("ExecutionError: {0}")]
    Execution(String),

    /// The tool exceeded its time budget.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The session was cancelled while the tool was running.
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl ToolError {
    /// Short kind label, matching the prefix of the `Display` form.
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::InvalidInput(_) => "InvalidInput",
            ToolError::Validation(_) => "ValidationError",
            ToolError::Execution(_) => "ExecutionError",
            ToolError::Timeout(_) => "Timeout",
            ToolError::Cancelled(_) => "Cancelled",
        }
    }
}

/// Sandbox rejections. Every variant renders as the text shown to the model.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SandboxError {
    #[error("`{command}` could not be parsed: {message}")]
    Parse { command: String, message: String },

    #[error("`{command}` uses command that is explicitly disallowed: `{entry}`. Reason: {reason}")]
    ExplicitlyDisallowed {
        command: String,
        entry: String,
        reason: String,
    },

    #[error(
        "`{command}` uses commands that aren't allowed: `{}`. Please use only allowed commands: {}",
        .commands.join("`,`"),
        .allowed.join(",")
    )]
    NotAllowed {
        command: String,
        commands: Vec<String>,
        allowed: Vec<String>,
    },

    #[error("{message}")]
    Arguments { program: String, message: String },
}

impl From<SandboxError> for ToolError {
    fn from(err: SandboxError) -> Self {
        ToolError::Validation(err.to_string())
    }
}
