//! Orchestration engine for tool-using LLM sessions.
//!
//! `baton-rs` drives multi-turn sessions between a language-model backend and
//! a set of pluggable capabilities. The core abstraction is the
//! [`Orchestrator`](orchestrator::Orchestrator): a control loop that builds a
//! prompt from scoped conversation memory, calls a [`Provider`](provider::Provider),
//! and dispatches the response to extensions until no work is left.
//!
//! # Getting started
//!
//! ```ignore
//! use baton_rs::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), OrchestratorError> {
//!     let provider = Arc::new(OpenRouterProvider::from_env()?);
//!     let policy = SandboxPolicy::new()
//!         .allow("ls", "List directory contents")
//!         .allow("grep", "Search file contents");
//!
//!     let orchestrator = Orchestrator::new(provider, OrchestratorConfig::new())
//!         .with_extension(CachePlacer::new(CacheConfig::default()))
//!         .with_extension(Compactor::new(CompactorConfig::default())?)
//!         .with_capability(ShellCapability::new(policy, ShellConfig::default()))
//!         .with_observer(LoggingObserver::new());
//!
//!     let scope = ConversationScope::root("session");
//!     let outcome = orchestrator
//!         .run(&scope, vec![Turn::human("Find the TODOs")], CancellationToken::new())
//!         .await?;
//!     println!("{outcome:?}");
//!     Ok(())
//! }
//! ```
//!
//! # Where to find things
//!
//! - **Conversation state:** [`memory`] holds [`Turn`](memory::Turn), the
//!   append-only [`ConversationLog`](memory::ConversationLog) and the
//!   [`ConversationScope`](memory::ConversationScope) tree with its visibility
//!   projections.
//! - **Hooks:** [`extension`] defines the [`Extension`](extension::Extension)
//!   hook set and its [`Capability`](extension::Capability) and
//!   [`Observer`](extension::Observer) specializations.
//! - **Budgets:** [`budget`] has the adaptive token estimator, the prompt-cache
//!   breakpoint placer and the history compactor.
//! - **Shell safety:** [`sandbox`] parses command lines and matches them against
//!   allow/deny lists.
//! - **Tools:** [`tools`] provides [`ToolSet`](tools::ToolSet) for typed tools
//!   and the sandboxed [`ShellCapability`](tools::ShellCapability).
//! - **Configuration files:** [`settings::Settings`] reads the TOML layout and
//!   assembles the standard extension stack.

pub mod budget;
pub mod error;
pub mod extension;
pub mod logging;
pub mod memory;
pub mod orchestrator;
pub mod prelude;
pub mod provider;
pub mod sandbox;
pub mod settings;
pub mod tools;

pub use error::{OrchestratorError, SandboxError, ToolError};
pub use orchestrator::{Orchestrator, OrchestratorConfig, RunOutcome};
