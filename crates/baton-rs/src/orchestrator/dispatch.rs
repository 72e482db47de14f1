//! Structured tool-call dispatch.
//!
//! Calls are drained strictly in the order the model emitted them. Each call
//! is bracketed by the observers' before/after hooks and recorded as a call
//! turn followed by its result turn.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::Orchestrator;
use crate::error::{OrchestratorError, ToolError};
use crate::extension::{Capability, Halt, HookContext, HookResult};
use crate::memory::{ToolCall, ToolResult, Turn};

/// Longest tool name providers accept.
pub const MAX_TOOL_NAME_LEN: usize = 64;

/// Make `name` match `^[a-zA-Z0-9_-]{1,64}$`.
///
/// Invalid characters become `_`, the result is cut at 64 characters, and an
/// empty name becomes `_`.
pub fn sanitize_tool_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_TOOL_NAME_LEN)
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

pub(crate) fn unsupported_tool_message(name: &str) -> String {
    format!("Tool `{name}` is not supported, please try another tool")
}

pub(crate) fn retryable_failure_message(name: &str, err: &ToolError) -> String {
    format!("tool use `{name}` failed due to: {err}")
}

pub(crate) fn unexpected_failure_message(id: &str, err: &ToolError) -> String {
    format!("Unexpected error when processing tool use (id: {id}): {err}")
}

pub(crate) fn cancelled_message(id: &str) -> String {
    format!("tool_use (id: {id}) was cancelled by user")
}

impl Orchestrator {
    /// First capability that declares `name`.
    fn owner_of(&self, name: &str) -> Option<&Arc<dyn Capability>> {
        self.capabilities.iter().find(|c| c.handles(name))
    }

    /// Drain `queue` in order.
    ///
    /// A halt raised by an observer abandons the calls still queued.
    pub(super) async fn drain_tool_queue(
        &self,
        ctx: &HookContext<'_>,
        queue: Vec<ToolCall>,
    ) -> HookResult<()> {
        let total = queue.len();
        for (index, call) in queue.into_iter().enumerate() {
            if let Err(halt) = self.process_tool_call(ctx, &call).await {
                let remaining = total - index - 1;
                if remaining > 0 {
                    debug!("Dropping {remaining} queued tool call(s) after halt");
                }
                return Err(halt);
            }
        }
        Ok(())
    }

    async fn process_tool_call(&self, ctx: &HookContext<'_>, call: &ToolCall) -> HookResult<()> {
        for observer in &self.observers {
            observer.before_tool_use(ctx, call).await?;
        }
        self.add_messages(ctx, vec![Turn::tool_call(call.clone())]).await?;

        let result = match self.owner_of(&call.name) {
            None => {
                warn!("Model requested unknown tool `{}`", call.name);
                ToolResult::error(&call.id, unsupported_tool_message(&call.name))
            }
            Some(capability) => self.invoke_capability(ctx, capability, call).await?,
        };

        self.add_messages(ctx, vec![Turn::tool_result(result.clone())]).await?;
        for observer in &self.observers {
            observer.after_tool_use(ctx, call, &result).await?;
        }
        Ok(())
    }

    /// Run one call on its capability and turn failures into results.
    ///
    /// Cancellation and non-retryable failures record their result turn and
    /// then end the session.
    async fn invoke_capability(
        &self,
        ctx: &HookContext<'_>,
        capability: &Arc<dyn Capability>,
        call: &ToolCall,
    ) -> HookResult<ToolResult> {
        info!(
            "[iteration {}] Dispatching `{}` (id: {}) to {}",
            ctx.iteration,
            call.name,
            call.id,
            capability.name()
        );
        let outcome = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(ToolError::Cancelled("session cancelled".into())),
            r = capability.dispatch(ctx, call) => r,
        };

        match outcome {
            Ok(result) => Ok(result),
            Err(ToolError::Cancelled(_)) => {
                info!("Tool call {} cancelled", call.id);
                let result = ToolResult::error(&call.id, cancelled_message(&call.id));
                ctx.scope.add_turn(Turn::tool_result(result));
                Err(Halt::Fatal(OrchestratorError::Cancelled))
            }
            Err(err) if capability.is_retryable(call, &err) => {
                warn!(kind = err.kind(), "Tool `{}` failed, reporting to model: {err}", call.name);
                Ok(ToolResult::error(
                    &call.id,
                    retryable_failure_message(&call.name, &err),
                ))
            }
            Err(err) => {
                warn!(kind = err.kind(), "Tool `{}` failed fatally: {err}", call.name);
                let result = ToolResult::error(&call.id, unexpected_failure_message(&call.id, &err));
                self.add_messages(ctx, vec![Turn::tool_result(result)]).await?;
                Err(Halt::Fatal(OrchestratorError::Tool {
                    name: call.name.clone(),
                    id: call.id.clone(),
                    source: err,
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names_pass_through() {
        assert_eq!(sanitize_tool_name("read_file"), "read_file");
        assert_eq!(sanitize_tool_name("web-search2"), "web-search2");
    }

    #[test]
    fn invalid_characters_are_replaced() {
        assert_eq!(sanitize_tool_name("fs.read file"), "fs_read_file");
        assert_eq!(sanitize_tool_name("héllo"), "h_llo");
        assert_eq!(sanitize_tool_name(""), "_");
    }

    #[test]
    fn long_names_are_truncated() {
        let long = "a".repeat(100);
        assert_eq!(sanitize_tool_name(&long).len(), MAX_TOOL_NAME_LEN);
    }

    #[test]
    fn failure_texts() {
        assert_eq!(
            unsupported_tool_message("fly"),
            "Tool `fly` is not supported, please try another tool"
        );
        let err = ToolError::Execution("exit status 1".into());
        assert_eq!(
            retryable_failure_message("bash", &err),
            "tool use `bash` failed due to: ExecutionError: exit status 1"
        );
        assert_eq!(
            unexpected_failure_message("c7", &err),
            "Unexpected error when processing tool use (id: c7): ExecutionError: exit status 1"
        );
        assert_eq!(cancelled_message("c7"), "tool_use (id: c7) was cancelled by user");
    }
}
