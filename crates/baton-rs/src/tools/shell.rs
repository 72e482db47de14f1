//! Sandboxed shell capability.
//!
//! Exposes a `bash` tool in structured tool-use mode and handles `<bash>`
//! tags in tag-tree mode. Every command is checked by the [`Sandbox`] before
//! it runs; tag invocations interrupt the loop with the command output.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::core::json_schema_for;
use crate::error::{OrchestratorError, ToolError};
use crate::extension::tag::Node;
use crate::extension::{Capability, Element, Extension, Halt, HookContext, HookResult, ToolSpec};
use crate::memory::{ToolCall, ToolResult};
use crate::provider::retry::duration_ms;
use crate::sandbox::{Sandbox, SandboxPolicy};

/// Approximate characters per line for the default output length cap.
const CHARS_PER_LINE: usize = 80;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Working directory. Defaults to the process's.
    pub workdir: Option<PathBuf>,
    /// Extra environment variables, layered over the inherited environment.
    pub env: BTreeMap<String, String>,
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    pub max_output_lines: usize,
    /// Character cap per stream. Defaults to `max_output_lines * 80`.
    pub max_output_chars: Option<usize>,
    pub tag_name: String,
    /// Declare the `bash` tool in structured mode.
    pub enable_tool_use: bool,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            workdir: None,
            env: BTreeMap::new(),
            timeout: Duration::from_secs(120),
            max_output_lines: 100,
            max_output_chars: None,
            tag_name: "bash".into(),
            enable_tool_use: true,
        }
    }
}

/// Typed arguments for `bash`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ShellArgs {
    /// Shell command to execute (e.g. 'ls -la', 'grep -rn TODO src').
    #[serde(default)]
    pub command: Option<String>,
    /// Re-run the previous command instead of `command`.
    #[serde(default)]
    pub restart: bool,
}

/// Captured result of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub identifier: String,
    pub cwd: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub returncode: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.returncode == Some(0)
    }

    /// `<command_line_output identifier=".." returncode=".." cwd="..">` with
    /// `<stderr>` and `<stdout>` children.
    pub fn to_element(&self) -> Element {
        let mut el = Element::new("command_line_output");
        el.attrs.push(("identifier".into(), self.identifier.clone()));
        if let Some(code) = self.returncode {
            el.attrs.push(("returncode".into(), code.to_string()));
        }
        if let Some(cwd) = &self.cwd {
            el.attrs.push(("cwd".into(), cwd.clone()));
        }
        for (name, body) in [("stderr", &self.stderr), ("stdout", &self.stdout)] {
            if !body.is_empty() {
                let mut child = Element::new(name);
                child.children.push(Node::Text(body.clone()));
                el.children.push(Node::Element(child));
            }
        }
        el
    }

    pub fn to_markup(&self) -> String {
        self.to_element().to_markup()
    }
}

/// Keep the head of `s`: at most `max_chars` characters, then at most
/// `max_lines` lines, with a note of what was cut.
pub fn truncate_output(s: &str, max_lines: usize, max_chars: usize) -> String {
    let total_chars = s.chars().count();
    if total_chars > max_chars {
        let head: String = s.chars().take(max_chars).collect();
        return format!(
            "{head}\n... (truncated {} more characters)",
            total_chars - max_chars
        );
    }
    let lines: Vec<&str> = s.lines().collect();
    if lines.len() > max_lines {
        return format!(
            "{}\n... (truncated {} more lines)",
            lines[..max_lines].join("\n"),
            lines.len() - max_lines
        );
    }
    s.to_string()
}

/// Shell commands behind a sandbox.
pub struct ShellCapability {
    sandbox: Sandbox,
    config: ShellConfig,
    last_command: Mutex<Option<String>>,
}

impl std::fmt::Debug for ShellCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellCapability")
            .field("sandbox", &self.sandbox)
            .field("config", &self.config)
            .finish()
    }
}

impl ShellCapability {
    pub fn new(policy: SandboxPolicy, config: ShellConfig) -> Self {
        Self::with_sandbox(Sandbox::new(policy), config)
    }

    /// Use a sandbox with custom validators.
    pub fn with_sandbox(sandbox: Sandbox, config: ShellConfig) -> Self {
        Self {
            sandbox,
            config,
            last_command: Mutex::new(None),
        }
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn last_command(&self) -> Option<String> {
        self.last_command
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn bash_spec(&self) -> ToolSpec {
        let allowed = self.sandbox.policy().describe_allowed();
        ToolSpec::new(
            "bash",
            format!(
                "Run a shell command and return its output as <command_line_output>. \
                 Set `restart` to re-run the previous command. Only these commands are \
                 allowed:\n{allowed}"
            ),
            json_schema_for::<ShellArgs>(),
        )
    }

    /// Resolve the command line for a tool call.
    fn resolve(&self, args: ShellArgs) -> Result<String, ToolError> {
        if args.restart {
            return self.last_command().ok_or_else(|| {
                ToolError::InvalidInput(
                    "Cannot restart bash when there is no previous command".into(),
                )
            });
        }
        args.command.ok_or_else(|| {
            ToolError::InvalidInput("`command` is required when `restart` is not true".into())
        })
    }

    /// Validate and run `command`.
    pub async fn run(
        &self,
        identifier: &str,
        command: &str,
        cwd: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, ToolError> {
        let allowed_via = self.sandbox.check(command)?;
        *self.last_command.lock().unwrap_or_else(|e| e.into_inner()) = Some(command.to_string());

        let cwd = cwd
            .map(PathBuf::from)
            .or_else(|| self.config.workdir.clone());
        info!("Running command `{command}` ({allowed_via})");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &cwd {
            cmd.current_dir(dir);
        }

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ToolError::Cancelled(format!("command `{command}` cancelled")));
            }
            result = tokio::time::timeout(self.config.timeout, cmd.output()) => match result {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    return Err(ToolError::Execution(format!("failed to run `{command}`: {e}")));
                }
                Err(_) => {
                    warn!("Command `{command}` timed out after {:?}", self.config.timeout);
                    return Err(ToolError::Timeout(format!(
                        "command `{command}` timed out after {} seconds",
                        self.config.timeout.as_secs()
                    )));
                }
            },
        };

        let max_chars = self
            .config
            .max_output_chars
            .unwrap_or(self.config.max_output_lines * CHARS_PER_LINE);
        let out = CommandOutput {
            identifier: identifier.to_string(),
            cwd: cwd.map(|p| p.display().to_string()),
            stdout: truncate_output(
                &String::from_utf8_lossy(&output.stdout),
                self.config.max_output_lines,
                max_chars,
            ),
            stderr: truncate_output(
                &String::from_utf8_lossy(&output.stderr),
                self.config.max_output_lines,
                max_chars,
            ),
            returncode: output.status.code(),
        };
        debug!(
            "Command `{command}` exited with {:?} ({} bytes stdout)",
            out.returncode,
            out.stdout.len()
        );
        Ok(out)
    }
}

#[async_trait]
impl Extension for ShellCapability {
    fn name(&self) -> &str {
        "shell"
    }

    async fn on_tag(&self, ctx: &HookContext<'_>, tag: &Element) -> HookResult<()> {
        if tag.name != self.config.tag_name {
            return Ok(());
        }
        let identifier = tag.attr("identifier").unwrap_or("__cmd_run__");
        let command = tag.text();
        match self
            .run(identifier, command.trim(), tag.attr("cwd"), ctx.cancel)
            .await
        {
            Ok(out) => Err(Halt::interrupt_with(out.to_markup())),
            Err(ToolError::Cancelled(_)) => Err(Halt::Fatal(OrchestratorError::Cancelled)),
            Err(e) => Err(Halt::interrupt_with(format!("Command failed due to {e}"))),
        }
    }
}

#[async_trait]
impl Capability for ShellCapability {
    fn tools(&self) -> Vec<ToolSpec> {
        if self.config.enable_tool_use {
            vec![self.bash_spec()]
        } else {
            Vec::new()
        }
    }

    async fn dispatch(
        &self,
        ctx: &HookContext<'_>,
        call: &ToolCall,
    ) -> Result<ToolResult, ToolError> {
        let args: ShellArgs = serde_json::from_value(call.input.clone())
            .map_err(|e| ToolError::InvalidInput(format!("invalid bash arguments: {e}")))?;
        let command = self.resolve(args)?;
        let out = self.run(&call.id, &command, None, ctx.cancel).await?;
        Ok(ToolResult {
            tool_use_id: call.id.clone(),
            content: out.to_markup(),
            is_error: !out.success(),
        })
    }

    fn is_retryable(&self, _call: &ToolCall, err: &ToolError) -> bool {
        !matches!(err, ToolError::Cancelled(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell() -> ShellCapability {
        ShellCapability::new(
            SandboxPolicy::new()
                .allow("echo", "Print text")
                .allow("ls", "List files")
                .deny("rm", "destructive"),
            ShellConfig::default(),
        )
    }

    #[test]
    fn truncate_by_lines_and_chars() {
        let text = "a\nb\nc\nd";
        assert_eq!(truncate_output(text, 2, 100), "a\nb\n... (truncated 2 more lines)");
        assert_eq!(truncate_output("abcdef", 10, 3), "abc\n... (truncated 3 more characters)");
        assert_eq!(truncate_output(text, 10, 100), text);
    }

    #[test]
    fn output_markup_escapes_content() {
        let out = CommandOutput {
            identifier: "t1".into(),
            cwd: None,
            stdout: "a < b".into(),
            stderr: String::new(),
            returncode: Some(0),
        };
        assert_eq!(
            out.to_markup(),
            "<command_line_output identifier=\"t1\" returncode=\"0\"><stdout>a &lt; b</stdout></command_line_output>"
        );
    }

    #[test]
    fn restart_requires_previous_command() {
        let shell = shell();
        let err = shell
            .resolve(ShellArgs {
                command: None,
                restart: true,
            })
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidInput");
        let err = shell
            .resolve(ShellArgs {
                command: None,
                restart: false,
            })
            .unwrap_err();
        assert!(err.to_string().contains("`command` is required"));
    }

    #[tokio::test]
    async fn runs_allowed_command_and_remembers_it() {
        let shell = shell();
        let cancel = CancellationToken::new();
        let out = shell.run("t1", "echo hello", None, &cancel).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(shell.last_command().as_deref(), Some("echo hello"));
        let again = shell
            .resolve(ShellArgs {
                command: None,
                restart: true,
            })
            .unwrap();
        assert_eq!(again, "echo hello");
    }

    #[tokio::test]
    async fn sandbox_rejection_is_validation_error() {
        let shell = shell();
        let cancel = CancellationToken::new();
        let err = shell.run("t1", "rm -rf /tmp/x", None, &cancel).await.unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
        assert!(err.to_string().contains("Reason: destructive"));
        assert!(shell.last_command().is_none());
    }

    #[tokio::test]
    async fn cancelled_token_stops_command() {
        let shell = shell();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = shell.run("t1", "echo hi", None, &cancel).await.unwrap_err();
        assert!(matches!(err, ToolError::Cancelled(_)));
    }

    #[test]
    fn tool_declared_only_when_enabled() {
        assert_eq!(shell().tools().len(), 1);
        let quiet = ShellCapability::new(
            SandboxPolicy::new(),
            ShellConfig {
                enable_tool_use: false,
                ..Default::default()
            },
        );
        assert!(quiet.tools().is_empty());
    }
}
