//! Capabilities: extensions that own tools.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Extension, HookContext};
use crate::error::ToolError;
use crate::memory::{ToolCall, ToolResult};

/// A tool declaration sent to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's input object.
    pub input_schema: serde_json::Value,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// An extension that declares tools and executes calls to them.
#[async_trait]
pub trait Capability: Extension {
    /// Tools this capability answers for.
    fn tools(&self) -> Vec<ToolSpec>;

    /// Execute one call. Only called for names listed in [`tools`](Self::tools).
    async fn dispatch(
        &self,
        ctx: &HookContext<'_>,
        call: &ToolCall,
    ) -> Result<ToolResult, ToolError>;

    /// Whether the session may continue after `call` failed with `err`.
    ///
    /// Retryable failures become an error result the model can react to.
    /// Anything else ends the session.
    fn is_retryable(&self, _call: &ToolCall, _err: &ToolError) -> bool {
        true
    }

    fn handles(&self, name: &str) -> bool {
        self.tools().iter().any(|t| t.name == name)
    }
}
