//! Observers: side-channel hooks around every tool call.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{Extension, HookContext, HookResult};
use crate::memory::{ToolCall, ToolResult};

/// Before/after hooks around tool dispatch. Runs for every call, including
/// calls to unknown tools.
#[async_trait]
pub trait Observer: Extension {
    async fn before_tool_use(&self, _ctx: &HookContext<'_>, _call: &ToolCall) -> HookResult<()> {
        Ok(())
    }

    async fn after_tool_use(
        &self,
        _ctx: &HookContext<'_>,
        _call: &ToolCall,
        _result: &ToolResult,
    ) -> HookResult<()> {
        Ok(())
    }
}

/// Logs every tool call and its result through `tracing`.
#[derive(Debug, Default, Clone)]
pub struct LoggingObserver {
    /// Maximum characters of arguments/results to include in log lines.
    pub preview_chars: usize,
}

impl LoggingObserver {
    pub fn new() -> Self {
        Self { preview_chars: 200 }
    }

    fn preview(&self, s: &str) -> String {
        if s.chars().count() <= self.preview_chars {
            s.to_string()
        } else {
            let head: String = s.chars().take(self.preview_chars).collect();
            format!("{head}...")
        }
    }
}

impl Extension for LoggingObserver {
    fn name(&self) -> &str {
        "logging"
    }
}

#[async_trait]
impl Observer for LoggingObserver {
    async fn before_tool_use(&self, ctx: &HookContext<'_>, call: &ToolCall) -> HookResult<()> {
        info!(
            "[iteration {}] Tool call: {}({})",
            ctx.iteration,
            call.name,
            self.preview(&call.input.to_string())
        );
        Ok(())
    }

    async fn after_tool_use(
        &self,
        ctx: &HookContext<'_>,
        call: &ToolCall,
        result: &ToolResult,
    ) -> HookResult<()> {
        if result.is_error {
            warn!(
                "[iteration {}] Tool {} failed: {}",
                ctx.iteration,
                call.name,
                self.preview(&result.content)
            );
        } else {
            debug!(
                "[iteration {}] Tool {} returned {} chars: {}",
                ctx.iteration,
                call.name,
                result.content.len(),
                self.preview(&result.content)
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_truncates_by_chars() {
        let obs = LoggingObserver { preview_chars: 3 };
        assert_eq!(obs.preview("abcdef"), "abc...");
        assert_eq!(obs.preview("ab"), "ab");
        assert_eq!(obs.preview("äöüß"), "äöü...");
    }
}
