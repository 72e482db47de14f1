//! Convenience re-exports for common `baton-rs` types.
//!
//! ```ignore
//! use baton_rs::prelude::*;
//! ```
//!
//! Covers what most sessions need: the orchestrator and its config, memory
//! types, the extension traits, the budget extensions, the sandbox and the
//! tool capabilities. Parser internals and wire-format types are left out.

pub use std::sync::Arc;

pub use tokio_util::sync::CancellationToken;

// ── Core ────────────────────────────────────────────────────────────
pub use crate::error::{OrchestratorError, SandboxError, ToolError};
pub use crate::orchestrator::{Orchestrator, OrchestratorConfig, ParseMode, RunOutcome};

// ── Memory ──────────────────────────────────────────────────────────
pub use crate::memory::{ConversationScope, Part, ToolCall, ToolResult, Turn, TurnKind, Visibility};

// ── Extensions ──────────────────────────────────────────────────────
pub use crate::extension::{
    Capability, Element, Extension, Halt, HookContext, HookResult, LoggingObserver, Node, Observer,
    ToolSpec,
};

// ── Providers ───────────────────────────────────────────────────────
pub use crate::provider::openrouter::OpenRouterProvider;
pub use crate::provider::{Provider, ProviderError, ProviderRequest, Response, RetryConfig, Usage};

// ── Budget ──────────────────────────────────────────────────────────
pub use crate::budget::{CacheConfig, CachePlacer, Compactor, CompactorConfig, TokenEstimator};

// ── Sandbox & tools ─────────────────────────────────────────────────
pub use crate::logging::init_logging;
pub use crate::sandbox::{Sandbox, SandboxPolicy};
pub use crate::settings::Settings;
pub use crate::tools::{FnTool, ShellCapability, ShellConfig, Tool, ToolSet, json_schema_for};
