//! Extensions: the hook points of the orchestrator loop.
//!
//! Every hook defaults to identity, so an extension implements only what it
//! cares about. Hooks run in registration order and fold: each one receives
//! the value returned by the previous one. Returning `Err(Halt)` leaves the
//! fold early with a control outcome.
//!
//! | Hook | Folded value | Runs |
//! |------|--------------|------|
//! | `on_input_messages` | input turns | once, before the first iteration |
//! | `on_memory` | prompt turns | every iteration, after projection |
//! | `on_invoke_llm` | prompt turns | every iteration, just before the call |
//! | `on_llm_response` | [`Response`] | after each provider call |
//! | `on_llm_output` | response text | before the text is parsed or recorded |
//! | `on_plain_text` | n/a | per text run (tag-tree) or free text (tool-call) |
//! | `on_tag` | n/a | tag-tree mode, per element |
//! | `on_add_messages` | turns being appended | whenever turns enter the scope |
//! | `on_interruption` | n/a | after an interruption's turns are added |
//! | `on_process_messages_complete` | n/a | when a turn produced no more work |

pub mod capability;
pub mod observer;
pub mod tag;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::OrchestratorError;
use crate::memory::{ConversationScope, Turn};
use crate::provider::{Provider, Response, RetryConfig};

pub use capability::{Capability, ToolSpec};
pub use observer::{LoggingObserver, Observer};
pub use tag::{Element, Node};

/// A control outcome raised from inside a hook.
#[derive(Debug)]
pub enum Halt {
    /// Stop the current pass and start a new iteration with these turns.
    Interrupt(Vec<Turn>),
    /// End the session cleanly.
    Terminate,
    /// End the session with an error.
    Fatal(OrchestratorError),
}

impl Halt {
    /// Interrupt with a single HUMAN turn.
    pub fn interrupt_with(text: impl Into<String>) -> Self {
        Halt::Interrupt(vec![Turn::human(text.into())])
    }
}

impl From<OrchestratorError> for Halt {
    fn from(err: OrchestratorError) -> Self {
        Halt::Fatal(err)
    }
}

pub type HookResult<T> = Result<T, Halt>;

/// What a hook can see of the running session.
pub struct HookContext<'a> {
    pub scope: &'a Arc<ConversationScope>,
    pub provider: &'a dyn Provider,
    pub retry: &'a RetryConfig,
    pub cancel: &'a CancellationToken,
    /// 1-based iteration currently running.
    pub iteration: u32,
}

/// A set of loop hooks.
#[async_trait]
pub trait Extension: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Stop sequences this extension needs the provider to honor.
    fn stop_sequences(&self) -> Vec<String> {
        Vec::new()
    }

    async fn on_input_messages(
        &self,
        _ctx: &HookContext<'_>,
        turns: Vec<Turn>,
    ) -> HookResult<Vec<Turn>> {
        Ok(turns)
    }

    async fn on_memory(&self, _ctx: &HookContext<'_>, turns: Vec<Turn>) -> HookResult<Vec<Turn>> {
        Ok(turns)
    }

    async fn on_invoke_llm(
        &self,
        _ctx: &HookContext<'_>,
        turns: Vec<Turn>,
    ) -> HookResult<Vec<Turn>> {
        Ok(turns)
    }

    async fn on_llm_response(
        &self,
        _ctx: &HookContext<'_>,
        response: Response,
    ) -> HookResult<Response> {
        Ok(response)
    }

    async fn on_llm_output(&self, _ctx: &HookContext<'_>, text: String) -> HookResult<String> {
        Ok(text)
    }

    async fn on_plain_text(&self, _ctx: &HookContext<'_>, _text: &str) -> HookResult<()> {
        Ok(())
    }

    async fn on_tag(&self, _ctx: &HookContext<'_>, _tag: &Element) -> HookResult<()> {
        Ok(())
    }

    async fn on_add_messages(
        &self,
        _ctx: &HookContext<'_>,
        turns: Vec<Turn>,
    ) -> HookResult<Vec<Turn>> {
        Ok(turns)
    }

    async fn on_interruption(&self, _ctx: &HookContext<'_>, _turns: &[Turn]) -> HookResult<()> {
        Ok(())
    }

    async fn on_process_messages_complete(&self, _ctx: &HookContext<'_>) -> HookResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::TurnKind;

    #[test]
    fn interrupt_with_builds_human_turn() {
        let Halt::Interrupt(turns) = Halt::interrupt_with("stop and read this") else {
            panic!("expected interrupt");
        };
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].kind, TurnKind::Human);
        assert_eq!(turns[0].text(), "stop and read this");
    }

    #[test]
    fn default_name_is_type_name() {
        struct Quiet;
        impl Extension for Quiet {}
        assert!(Quiet.name().ends_with("Quiet"));
    }
}
