//! Adaptive token estimation.
//!
//! Token counts are estimated as `ceil(chars / R)` per turn, where `R` is the
//! characters-per-token ratio last observed from the provider.

use async_trait::async_trait;

use crate::extension::{Extension, HookContext, HookResult};
use crate::memory::{ConversationScope, Turn};
use crate::provider::{Response, Usage};

pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.0;
pub const MAX_CHARS_PER_TOKEN: f64 = 4.0;

/// Learns the chars-per-token ratio from provider usage.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokenEstimator;

impl TokenEstimator {
    pub fn new() -> Self {
        Self
    }

    /// Estimated tokens for a single turn. Binary attachments are excluded.
    pub fn estimate_turn(turn: &Turn, chars_per_token: f64) -> u64 {
        (turn.char_len() as f64 / chars_per_token).ceil() as u64
    }

    /// Per-turn estimates using the scope's current ratio.
    pub fn turn_estimates(&self, scope: &ConversationScope, turns: &[Turn]) -> Vec<u64> {
        let ratio = scope.budget().chars_per_token;
        turns.iter().map(|t| Self::estimate_turn(t, ratio)).collect()
    }

    /// Total estimated tokens for `turns`.
    pub fn estimate(&self, scope: &ConversationScope, turns: &[Turn]) -> u64 {
        self.turn_estimates(scope, turns).iter().sum()
    }

    /// Fold reported usage into the scope's budget state.
    pub fn observe(&self, scope: &ConversationScope, usage: &Usage) {
        scope.budget().record_usage(usage);
    }
}

#[async_trait]
impl Extension for TokenEstimator {
    fn name(&self) -> &str {
        "token_estimator"
    }

    async fn on_llm_response(
        &self,
        ctx: &HookContext<'_>,
        response: Response,
    ) -> HookResult<Response> {
        self.observe(ctx.scope, &response.usage);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn learned_ratio_drives_estimate() {
        let scope = ConversationScope::root("s");
        let estimator = TokenEstimator::new();
        scope.budget().record_prompt(3200);
        estimator.observe(
            &scope,
            &Usage {
                input_tokens: 1000,
                ..Default::default()
            },
        );
        let prompt = vec![Turn::human("x".repeat(6400))];
        assert_eq!(estimator.estimate(&scope, &prompt), 2000);
    }

    #[test]
    fn estimate_rounds_up_per_turn() {
        let scope = ConversationScope::root("s");
        let turns = vec![Turn::human("abcd"), Turn::ai("e")];
        // ceil(4/3) + ceil(1/3)
        assert_eq!(TokenEstimator.estimate(&scope, &turns), 3);
    }
}
