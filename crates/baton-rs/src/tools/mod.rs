//! Tool capabilities.
//!
//! - [`core`]: the [`Tool`] trait, [`ToolSet`] (a [`Capability`] that
//!   dispatches by name with schema validation, timeouts and truncation) and
//!   [`FnTool`] for closure-based tools.
//! - [`shell`]: [`ShellCapability`], a sandboxed `bash` tool and `<bash>` tag.
//!
//! [`Capability`]: crate::extension::Capability

pub mod core;
pub mod shell;

pub use self::core::{
    DEFAULT_MAX_RESULT_BYTES, DEFAULT_TOOL_TIMEOUT, FnTool, Tool, ToolFuture, ToolSet,
    json_schema_for, truncate_result, validate_tool_input,
};
pub use shell::{CommandOutput, ShellArgs, ShellCapability, ShellConfig};
