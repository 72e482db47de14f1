//! Prompt budget management.
//!
//! Three extensions share one per-scope [`BudgetState`]:
//!
//! - [`TokenEstimator`] learns the characters-per-token ratio from provider usage.
//! - [`CachePlacer`] places prompt-cache breakpoints as the prompt grows.
//! - [`Compactor`] summarizes old history once the prompt exceeds its budget.

pub mod cache;
pub mod compactor;
pub mod estimator;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::provider::Usage;

pub use cache::{CacheConfig, CachePlacer};
pub use compactor::{Compactor, CompactorConfig};
pub use estimator::{DEFAULT_CHARS_PER_TOKEN, MAX_CHARS_PER_TOKEN, TokenEstimator};

/// Budget bookkeeping for one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetState {
    /// Prompt size (tokens) at the last cache breakpoint. Never decreases.
    pub last_checkpoint: u64,
    /// Learned characters per token, kept within `[3.0, 4.0]`.
    pub chars_per_token: f64,
    /// Characters in the most recent prompt actually sent.
    pub last_prompt_chars: Option<usize>,
    /// Prompt tokens the provider reported for that prompt.
    pub last_prompt_tokens: Option<u64>,
}

impl Default for BudgetState {
    fn default() -> Self {
        Self {
            last_checkpoint: 0,
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
            last_prompt_chars: None,
            last_prompt_tokens: None,
        }
    }
}

impl BudgetState {
    /// Record the size of the prompt about to be sent.
    pub fn record_prompt(&mut self, chars: usize) {
        self.last_prompt_chars = Some(chars);
    }

    /// Update the ratio from reported usage. Last writer wins.
    ///
    /// Returns the new ratio, or `None` when the usage carried no prompt tokens
    /// or no prompt size was recorded.
    pub fn record_usage(&mut self, usage: &Usage) -> Option<f64> {
        let tokens = usage.prompt_tokens();
        if tokens == 0 {
            return None;
        }
        self.last_prompt_tokens = Some(tokens);
        let chars = self.last_prompt_chars.filter(|c| *c > 0)?;
        let ratio = (chars as f64 / tokens as f64).clamp(DEFAULT_CHARS_PER_TOKEN, MAX_CHARS_PER_TOKEN);
        debug!("Estimated characters per token: {ratio:.3} ({chars} chars / {tokens} tokens)");
        self.chars_per_token = ratio;
        Some(ratio)
    }

    /// Move the checkpoint forward if `total` exceeds it by more than `min_gap`.
    pub fn advance_checkpoint(&mut self, total: u64, min_gap: u64) -> bool {
        if total > self.last_checkpoint.saturating_add(min_gap) {
            self.last_checkpoint = total;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(input: u64) -> Usage {
        Usage {
            input_tokens: input,
            ..Default::default()
        }
    }

    #[test]
    fn ratio_from_reported_usage() {
        let mut state = BudgetState::default();
        state.record_prompt(3200);
        assert_eq!(state.record_usage(&usage(1000)), Some(3.2));
        assert_eq!(state.last_prompt_tokens, Some(1000));
    }

    #[test]
    fn ratio_is_clamped() {
        let mut state = BudgetState::default();
        state.record_prompt(10_000);
        assert_eq!(state.record_usage(&usage(1000)), Some(4.0));
        state.record_prompt(1000);
        assert_eq!(state.record_usage(&usage(1000)), Some(3.0));
    }

    #[test]
    fn zero_tokens_leave_ratio_unchanged() {
        let mut state = BudgetState::default();
        state.record_prompt(3500);
        assert_eq!(state.record_usage(&usage(0)), None);
        assert_eq!(state.chars_per_token, DEFAULT_CHARS_PER_TOKEN);
    }

    #[test]
    fn checkpoint_never_decreases() {
        let mut state = BudgetState::default();
        assert!(state.advance_checkpoint(15_000, 10_000));
        assert!(!state.advance_checkpoint(20_000, 10_000));
        assert!(!state.advance_checkpoint(1_000, 10_000));
        assert_eq!(state.last_checkpoint, 15_000);
        assert!(state.advance_checkpoint(25_001, 10_000));
    }
}
