//! Prompt-cache breakpoint placement.
//!
//! Before each prompt build the placer checks whether the prompt has grown by
//! more than `min_prompt_length` tokens since the last breakpoint; if so the
//! newest turn is flagged. Flags live on the stored turns, so they persist
//! across iterations. At send time a limited number of markers is spent: one
//! on the system prompt, then one per flagged turn, newest first.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::TokenEstimator;
use crate::extension::{Extension, HookContext, HookResult};
use crate::memory::{Turn, TurnKind};
use crate::provider::Response;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Minimum growth (tokens) between two breakpoints.
    pub min_prompt_length: u64,
    /// Markers available per request, including the system prompt's.
    pub max_num_checkpoints: usize,
    pub cache_system_prompt: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            min_prompt_length: 10_000,
            max_num_checkpoints: 4,
            cache_system_prompt: true,
        }
    }
}

/// Places prompt-cache markers on outgoing prompts.
#[derive(Debug, Default)]
pub struct CachePlacer {
    config: CacheConfig,
    estimator: TokenEstimator,
}

impl CachePlacer {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            estimator: TokenEstimator::new(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Spend markers on `turns`. Returns how many were placed.
    pub fn place_markers(&self, turns: &mut [Turn]) -> usize {
        let mut remaining = self.config.max_num_checkpoints;
        let mut placed = 0;

        if self.config.cache_system_prompt
            && remaining > 0
            && let Some(first) = turns.first_mut()
            && first.kind == TurnKind::System
            && first.place_cache_marker()
        {
            remaining -= 1;
            placed += 1;
        }

        let mut i = turns.len();
        while i > 0 && remaining > 0 {
            i -= 1;
            if !turns[i].flags.cache_breakpoint {
                continue;
            }
            // Walk back from the flagged turn until one accepts a marker.
            loop {
                if turns[i].cache_marker.is_none() && turns[i].place_cache_marker() {
                    remaining -= 1;
                    placed += 1;
                    break;
                }
                if i == 0 {
                    break;
                }
                i -= 1;
            }
        }
        placed
    }
}

#[async_trait]
impl Extension for CachePlacer {
    fn name(&self) -> &str {
        "prompt_cache"
    }

    async fn on_memory(
        &self,
        ctx: &HookContext<'_>,
        mut turns: Vec<Turn>,
    ) -> HookResult<Vec<Turn>> {
        let reported = ctx.scope.budget().last_prompt_tokens;
        let total = match reported {
            Some(tokens) => tokens,
            None => self.estimator.estimate(ctx.scope, &turns),
        };
        let advanced = ctx
            .scope
            .budget()
            .advance_checkpoint(total, self.config.min_prompt_length);
        if advanced && let Some(last) = turns.last_mut() {
            debug!(total, seq = last.seq(), "Flagging cache breakpoint");
            last.flags.cache_breakpoint = true;
            ctx.scope.mark(&HashSet::from([last.seq()]), |t| {
                t.flags.cache_breakpoint = true;
            });
        }
        Ok(turns)
    }

    async fn on_invoke_llm(
        &self,
        _ctx: &HookContext<'_>,
        mut turns: Vec<Turn>,
    ) -> HookResult<Vec<Turn>> {
        let placed = self.place_markers(&mut turns);
        debug!(placed, "Placed prompt-cache markers");
        Ok(turns)
    }

    async fn on_llm_response(
        &self,
        ctx: &HookContext<'_>,
        response: Response,
    ) -> HookResult<Response> {
        self.estimator.observe(ctx.scope, &response.usage);
        Ok(response)
    }
}
