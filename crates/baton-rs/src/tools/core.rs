//! Tool abstraction for structured tool-use sessions.
//!
//! The [`Tool`] trait defines the interface that every tool must implement:
//! a static [`ToolSpec`] (name, description, JSON schema) and an async
//! `execute` method. Tools are collected into a [`ToolSet`], a
//! [`Capability`] which handles dispatch, argument validation, timeouts and
//! result truncation.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use schemars::JsonSchema;
use tracing::{debug, info, trace};

use crate::error::ToolError;
use crate::extension::{Capability, Extension, HookContext, ToolSpec};
use crate::memory::{ToolCall, ToolResult};

/// Maximum size (in bytes) for tool output before truncation.
pub const DEFAULT_MAX_RESULT_BYTES: usize = 30_000;

/// Default timeout for tool execution (60 seconds).
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Boxed future returned by [`Tool::execute`].
pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = Result<String, ToolError>> + Send + 'a>>;

/// JSON schema for a typed argument struct.
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Tool trait ─────────────────────────────────────────────────────

/// A tool the model can invoke.
///
/// Implementors provide a [`ToolSpec`] and an async [`Tool::execute`] that
/// receives the already-validated JSON input.
///
/// ```ignore
/// struct Echo;
///
/// impl Tool for Echo {
///     fn spec(&self) -> ToolSpec {
///         ToolSpec::new("echo", "Echo the input", json_schema_for::<EchoArgs>())
///     }
///
///     fn execute(&self, input: &serde_json::Value) -> ToolFuture<'_> {
///         let input = input.clone();
///         Box::pin(async move { Ok(input.to_string()) })
///     }
/// }
/// ```
pub trait Tool: Send + Sync {
    /// The declaration sent to the provider.
    fn spec(&self) -> ToolSpec;

    /// Execute the tool with the given JSON input.
    ///
    /// Uses a boxed future so that the trait is dyn-compatible.
    fn execute(&self, input: &serde_json::Value) -> ToolFuture<'_>;

    /// The tool's name (convenience, delegates to spec).
    fn name(&self) -> String {
        self.spec().name
    }

    /// Whether the session may continue after `err`. Defaults to `true`.
    fn is_retryable(&self, _err: &ToolError) -> bool {
        true
    }
}

// ── ToolSet ────────────────────────────────────────────────────────

/// A collection of tools dispatched by name.
///
/// ```ignore
/// let tools = ToolSet::new()
///     .with_max_result_bytes(15_000)
///     .with_default_timeout(Some(Duration::from_secs(30)))
///     .with(MyTool::new());
///
/// let orchestrator = Orchestrator::new(provider, config).with_capability(tools);
/// ```
pub struct ToolSet {
    name: String,
    tools: HashMap<String, Box<dyn Tool>>,
    max_result_bytes: usize,
    /// Whether to validate tool arguments against JSON Schema before execution.
    validate_args: bool,
    /// Timeout for tool execution. `None` disables timeouts.
    default_timeout: Option<Duration>,
}

impl fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolSet")
            .field("name", &self.name)
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .field("max_result_bytes", &self.max_result_bytes)
            .finish()
    }
}

impl ToolSet {
    /// Create an empty tool set. Argument validation is on.
    pub fn new() -> Self {
        Self {
            name: "tools".into(),
            tools: HashMap::new(),
            max_result_bytes: DEFAULT_MAX_RESULT_BYTES,
            validate_args: true,
            default_timeout: Some(DEFAULT_TOOL_TIMEOUT),
        }
    }

    /// Name reported as the capability name in logs.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the maximum result size in bytes before truncation.
    pub fn with_max_result_bytes(mut self, max: usize) -> Self {
        self.max_result_bytes = max;
        self
    }

    /// Enable or disable JSON Schema argument validation.
    pub fn with_arg_validation(mut self, enabled: bool) -> Self {
        self.validate_args = enabled;
        self
    }

    /// Set the timeout for tool execution. Pass `None` to disable timeouts.
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name(), Box::new(tool));
    }

    /// Register a tool (builder pattern).
    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    /// Conditionally register a tool (builder pattern).
    pub fn with_if(self, condition: bool, tool: impl Tool + 'static) -> Self {
        if condition { self.with(tool) } else { self }
    }

    /// All tool specs, sorted by name.
    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self.tools.values().map(|t| t.spec()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Execute a tool by name with validation, timing, timeout and truncation.
    pub async fn execute(
        &self,
        name: &str,
        input: &serde_json::Value,
    ) -> Result<String, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::InvalidInput(format!("unknown tool '{name}'")))?;

        if self.validate_args {
            validate_tool_input(tool.as_ref(), input)?;
        }

        log_tool_call(name, input);
        let start = Instant::now();

        let result = match self.default_timeout {
            Some(limit) => match tokio::time::timeout(limit, tool.execute(input)).await {
                Ok(r) => r,
                Err(_) => {
                    info!(
                        "Tool {name} timed out after {:.1}s (limit: {:.0}s)",
                        start.elapsed().as_secs_f64(),
                        limit.as_secs_f64(),
                    );
                    Err(ToolError::Timeout(format!(
                        "tool '{name}' timed out after {:.0} seconds",
                        limit.as_secs_f64()
                    )))
                }
            },
            None => tool.execute(input).await,
        };

        let output = result?;
        debug!(
            "Tool {name} completed in {:.0}ms ({} bytes)",
            start.elapsed().as_secs_f64() * 1000.0,
            output.len()
        );
        trace!(
            "Tool {name} result preview: {}",
            output.chars().take(300).collect::<String>()
        );
        Ok(truncate_result(output, self.max_result_bytes))
    }
}

impl Default for ToolSet {
    fn default() -> Self {
        Self::new()
    }
}

impl Extension for ToolSet {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Capability for ToolSet {
    fn tools(&self) -> Vec<ToolSpec> {
        self.specs()
    }

    fn handles(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    async fn dispatch(
        &self,
        ctx: &HookContext<'_>,
        call: &ToolCall,
    ) -> Result<ToolResult, ToolError> {
        let content = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                return Err(ToolError::Cancelled(format!("tool '{}' cancelled", call.name)));
            }
            result = self.execute(&call.name, &call.input) => result?,
        };
        Ok(ToolResult::ok(&call.id, content))
    }

    fn is_retryable(&self, call: &ToolCall, err: &ToolError) -> bool {
        if matches!(err, ToolError::Cancelled(_)) {
            return false;
        }
        self.tools
            .get(&call.name)
            .is_none_or(|tool| tool.is_retryable(err))
    }
}

// ── FnTool ────────────────────────────────────────────────────────

/// Type-erased async handler for [`FnTool`].
type ErasedToolHandler = Box<
    dyn Fn(serde_json::Value) -> Pin<Box<dyn Future<Output = Result<String, ToolError>> + Send>>
        + Send
        + Sync,
>;

/// A closure-based tool that parses its input into `A` and delegates to a
/// handler.
///
/// ```ignore
/// #[derive(Deserialize, JsonSchema)]
/// struct AddArgs { a: i64, b: i64 }
///
/// let tool = FnTool::new(
///     ToolSpec::new("add", "Add two numbers", json_schema_for::<AddArgs>()),
///     |args: AddArgs| async move { Ok((args.a + args.b).to_string()) },
/// );
/// ```
pub struct FnTool {
    spec: ToolSpec,
    handler: ErasedToolHandler,
    fatal_on_error: bool,
}

impl FnTool {
    pub fn new<A, F, Fut>(spec: ToolSpec, handler: F) -> Self
    where
        A: serde::de::DeserializeOwned + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, ToolError>> + Send + 'static,
    {
        let erased = move |raw: serde_json::Value| -> Pin<
            Box<dyn Future<Output = Result<String, ToolError>> + Send>,
        > {
            match serde_json::from_value::<A>(raw) {
                Ok(args) => Box::pin(handler(args)),
                Err(e) => Box::pin(async move {
                    Err(ToolError::InvalidInput(format!(
                        "invalid tool arguments: {e}. \
                         Please provide valid JSON matching the tool's parameter schema."
                    )))
                }),
            }
        };

        Self {
            spec,
            handler: Box::new(erased),
            fatal_on_error: false,
        }
    }

    /// Make execution failures of this tool end the session.
    pub fn fatal_on_error(mut self, fatal: bool) -> Self {
        self.fatal_on_error = fatal;
        self
    }
}

impl Tool for FnTool {
    fn spec(&self) -> ToolSpec {
        self.spec.clone()
    }

    fn execute(&self, input: &serde_json::Value) -> ToolFuture<'_> {
        (self.handler)(input.clone())
    }

    fn is_retryable(&self, err: &ToolError) -> bool {
        !(self.fatal_on_error && matches!(err, ToolError::Execution(_)))
    }
}

impl fmt::Debug for FnTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.spec.name)
            .field("fatal_on_error", &self.fatal_on_error)
            .finish()
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Validate tool input against the tool's declared JSON Schema.
///
/// The error lists every violation so the model can self-correct.
pub fn validate_tool_input(tool: &dyn Tool, input: &serde_json::Value) -> Result<(), ToolError> {
    let schema = tool.spec().input_schema;

    // An invalid schema skips validation.
    let Ok(validator) = jsonschema::validator_for(&schema) else {
        return Ok(());
    };

    let errors: Vec<String> = validator
        .iter_errors(input)
        .map(|e| format!("  - {}: {e}", e.instance_path()))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ToolError::Validation(format!(
            "argument validation failed for tool '{}':\n{}\n\
             Please fix the arguments and try again.",
            tool.name(),
            errors.join("\n")
        )))
    }
}

/// Log a tool call at INFO level with a truncated preview of its input.
pub fn log_tool_call(name: &str, input: &serde_json::Value) {
    let raw = input.to_string();
    let preview: String = raw.chars().take(120).collect();
    info!(
        "[tool] {}({preview}{})",
        name,
        if raw.chars().count() > 120 { "..." } else { "" }
    );
    trace!("[tool] {name} input: {raw}");
}

/// Truncate a string to at most `max` bytes on a char boundary, appending a
/// notice if trimmed.
pub fn truncate_result(mut s: String, max: usize) -> String {
    if s.len() <= max {
        return s;
    }
    let total = s.len();
    let cut = s.floor_char_boundary(max);
    s.truncate(cut);
    format!("{s}...\n[truncated: {total} bytes total]")
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize, JsonSchema)]
    struct EchoArgs {
        text: String,
    }

    fn echo() -> FnTool {
        FnTool::new(
            ToolSpec::new("echo", "Echo text", json_schema_for::<EchoArgs>()),
            |args: EchoArgs| async move { Ok(args.text) },
        )
    }

    struct Slow;

    impl Tool for Slow {
        fn spec(&self) -> ToolSpec {
            ToolSpec::new("slow", "Never finishes quickly", json!({"type": "object"}))
        }

        fn execute(&self, _input: &serde_json::Value) -> ToolFuture<'_> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok("late".to_string())
            })
        }
    }

    #[test]
    fn specs_sorted_by_name() {
        let tools = ToolSet::new().with(Slow).with(echo());
        let names: Vec<String> = tools.specs().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["echo", "slow"]);
        assert!(tools.handles("echo"));
        assert!(!tools.handles("missing"));
    }

    #[tokio::test]
    async fn execute_known_tool() {
        let tools = ToolSet::new().with(echo());
        let out = tools.execute("echo", &json!({"text": "hi"})).await.unwrap();
        assert_eq!(out, "hi");
    }

    #[tokio::test]
    async fn schema_violation_is_validation_error() {
        let tools = ToolSet::new().with(echo());
        let err = tools.execute("echo", &json!({"text": 5})).await.unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
        assert!(err.to_string().contains("tool 'echo'"));
    }

    #[tokio::test]
    async fn unvalidated_bad_input_is_invalid_input() {
        let tools = ToolSet::new().with(echo()).with_arg_validation(false);
        let err = tools.execute("echo", &json!({})).await.unwrap_err();
        assert_eq!(err.kind(), "InvalidInput");
    }

    #[tokio::test]
    async fn timeout_becomes_timeout_error() {
        let tools = ToolSet::new()
            .with(Slow)
            .with_default_timeout(Some(Duration::from_millis(10)));
        let err = tools.execute("slow", &json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::Timeout(_)));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_result("short".into(), 10), "short");
        let cut = truncate_result("ééé".into(), 3);
        assert!(cut.starts_with("é..."));
        assert!(cut.ends_with("[truncated: 6 bytes total]"));
    }

    #[test]
    fn fatal_fn_tool_marks_execution_errors_non_retryable() {
        let tools = ToolSet::new().with(echo().fatal_on_error(true));
        let call = ToolCall::new("t1", "echo", json!({"text": "x"}));
        assert!(!tools.is_retryable(&call, &ToolError::Execution("boom".into())));
        assert!(tools.is_retryable(&call, &ToolError::Validation("bad".into())));
    }
}
