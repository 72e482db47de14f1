//! Token-budget-driven history compaction.
//!
//! When the estimated prompt exceeds `max_prompt_length` tokens (or the turn
//! count exceeds `max_num_messages`), turns from `start_index` onward are
//! flagged pending until the remainder fits in `min_prompt_length` and the
//! window ends on an AI turn. Before the next provider call, the flagged
//! window is summarized by one auxiliary call; the summary replaces the window
//! and the window's turns are marked omitted for good.
//!
//! The window travels on the turns' own flags, so one compactor can serve any
//! number of scopes at once.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::TokenEstimator;
use crate::error::OrchestratorError;
use crate::extension::tag::{Element, Node, parse_root};
use crate::extension::{Extension, Halt, HookContext, HookResult};
use crate::memory::{Omission, Turn, TurnKind};
use crate::provider::{ProviderError, ProviderRequest, Response, retry_provider_call};

const ARCHITECT_PROMPT: &str = "\
You are a Senior Software Architect responsible for creating detailed technical documentation and implementation plans.

You are given a human-AI chat history. Review and analyze the conversation to generate a structured response using the following format:

<{summary}>
[CONVERSATION CONTEXT]
- Initial Requirements: [Original problem statement and requirements]
- Scope Changes: [Any modifications to requirements during discussion]
- User Preferences: [Specific preferences or constraints mentioned by the user]

[TECHNICAL DECISIONS]
- Architecture Decisions: [Key architectural choices made and their rationale]
- Technology Stack: [Technologies, frameworks, or tools discussed/selected]
- Design Patterns: [Any specific patterns or approaches agreed upon]
- APIs/Interfaces: [Any API designs or interface definitions discussed]

[IMPLEMENTATION PROGRESS]
- Completed Work: [Code or components already implemented]
- Current State: [State of the implementation]
- Failed Attempts: [Previous approaches that were tried and discarded]
- Debugging History: [Any debugging or troubleshooting done]

[TECHNICAL DETAILS]
- Data Structures: [Key data structures defined or discussed]
- Algorithms: [Important algorithms or processes defined]
- Edge Cases: [Identified edge cases and their handling]
- Performance Considerations: [Any performance requirements or optimizations]

[OUTSTANDING ITEMS]
- Known Issues: [Current bugs or problems]
- Open Questions: [Unresolved technical questions]
- TODOs: [Planned but unimplemented features]
</{summary}>

<{plan}>
[Insert ONE of the following sections based on the analysis:]

FOR ISSUES DETECTED:
<thinking>
- Problem Analysis: [Brief description of technical issues]
- Impact Assessment: [Potential consequences]
- Solution Strategy: [High-level approach to resolution]
</thinking>
<issues>
[List and describe technical issues that need addressing]
</issues>
<{step} sequence_num=\"1\">
[First immediate action with clear technical direction]
</{step}>
<{step} sequence_num=\"2\">
[Second immediate action with clear technical direction]
</{step}>
[Additional steps as needed]

OR FOR NORMAL PROGRESSION:
<thinking>
- Current State: [Technical status assessment]
- Architecture Implications: [Impact on system design]
- Risk Assessment: [Potential technical challenges]
</thinking>
<{step} sequence_num=\"1\">
[First immediate action with clear technical direction]
</{step}>
<{step} sequence_num=\"2\">
[Second immediate action with clear technical direction]
</{step}>
[Additional steps as needed]
</{plan}>

Guidelines:
1. Maintain structured tag hierarchy using provided or configured tag names
2. Include all mandatory sections: <{summary}>, and <{plan}>
3. Ensure <thinking> section provides clear technical rationale
4. Prioritize steps based on technical impact and dependencies
5. Provide specific, actionable technical guidance
6. Consider scalability, maintainability, and best practices in recommendations
7. Keep responses technically precise while remaining concise and clear
";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactorConfig {
    /// Compaction triggers above this many estimated tokens.
    pub max_prompt_length: u64,
    /// Compaction trims the prompt down to at most this many tokens.
    pub min_prompt_length: u64,
    /// Compaction also triggers above this many turns.
    pub max_num_messages: usize,
    /// First prompt index eligible for omission; 1 keeps the initial request.
    pub start_index: usize,
    pub plan_tag: String,
    pub step_tag: String,
    pub summary_tag: String,
    /// Appended to the summary so the model keeps going after reading it.
    pub suffix: String,
    /// Summarization attempts before giving up.
    pub max_attempts: u32,
    pub model: Option<String>,
    pub max_tokens: u32,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            max_prompt_length: 100_000,
            min_prompt_length: 50_000,
            max_num_messages: 1000,
            start_index: 1,
            plan_tag: "plan".into(),
            step_tag: "next_step".into(),
            summary_tag: "summary".into(),
            suffix: "Now, based on the plan, I will".into(),
            max_attempts: 3,
            model: None,
            max_tokens: 4096,
        }
    }
}

impl CompactorConfig {
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.max_prompt_length < self.min_prompt_length {
            return Err(OrchestratorError::Config(format!(
                "max_prompt_length {} must be greater than or equal to min_prompt_length {}",
                self.max_prompt_length, self.min_prompt_length
            )));
        }
        Ok(())
    }

    fn system_prompt(&self) -> String {
        ARCHITECT_PROMPT
            .replace("{summary}", &self.summary_tag)
            .replace("{plan}", &self.plan_tag)
            .replace("{step}", &self.step_tag)
    }

    fn clarification(&self) -> String {
        format!(
            "No <{plan}> or <{summary}> tag found. Please write your plan in the <{plan}> tag and summary in the <{summary}> tag.",
            plan = self.plan_tag,
            summary = self.summary_tag,
        )
    }
}

/// Render turns as a `<conversation>` transcript for the summarizer.
pub fn transcript(turns: &[Turn]) -> String {
    let mut out = String::from("<conversation>");
    for turn in turns {
        out.push_str(&format!("\n<message role=\"{}\">", turn.kind));
        out.push('\n');
        out.push_str(&turn.text());
        out.push_str("\n</message>");
    }
    out.push_str("\n</conversation>");
    out
}

/// Summarizes old history once the prompt outgrows its budget.
#[derive(Debug)]
pub struct Compactor {
    config: CompactorConfig,
    estimator: TokenEstimator,
}

impl Compactor {
    pub fn new(config: CompactorConfig) -> Result<Self, OrchestratorError> {
        config.validate()?;
        Ok(Self {
            config,
            estimator: TokenEstimator::new(),
        })
    }

    pub fn config(&self) -> &CompactorConfig {
        &self.config
    }

    /// Choose the omission window. Returns indices into `turns`.
    pub fn select_window(&self, turns: &[Turn], lengths: &[u64]) -> Vec<usize> {
        let mut total: u64 = lengths.iter().sum();
        if total <= self.config.max_prompt_length
            && turns.len() <= self.config.max_num_messages
        {
            return Vec::new();
        }
        let mut window = Vec::new();
        for i in self.config.start_index..turns.len() {
            if total <= self.config.min_prompt_length && turns[i].kind == TurnKind::Ai {
                break;
            }
            window.push(i);
            total = total.saturating_sub(lengths[i]);
        }
        window
    }

    /// Build the summary text from a summarizer reply, or `None` if a required
    /// section is missing.
    pub fn extract_plan(&self, reply: &str) -> Option<String> {
        let root = parse_root(reply);
        let summary = root.find(&self.config.summary_tag)?;
        let plan = root.find(&self.config.plan_tag)?;
        Some(summary.to_markup() + &self.truncate_plan(plan).to_markup())
    }

    /// Keep the plan's children up to and including the first step.
    fn truncate_plan(&self, plan: &Element) -> Element {
        let cut = plan
            .children
            .iter()
            .position(|n| matches!(n, Node::Element(el) if el.name == self.config.step_tag));
        let mut kept = plan.clone();
        if let Some(idx) = cut {
            kept.children.truncate(idx + 1);
        }
        kept
    }

    async fn summarize(&self, ctx: &HookContext<'_>, window: &[Turn]) -> HookResult<String> {
        let mut turns = vec![
            Turn::system(self.config.system_prompt()),
            Turn::human(transcript(window)),
        ];

        for attempt in 1..=self.config.max_attempts {
            let request = ProviderRequest {
                turns: turns.clone(),
                max_tokens: Some(self.config.max_tokens),
                model: self.config.model.clone(),
                ..Default::default()
            };
            let request = &request;
            let provider = ctx.provider;
            let call = retry_provider_call(ctx.retry, move || async move {
                let response = provider.generate(request).await?;
                if response.content.is_empty() {
                    return Err(ProviderError::Retryable(
                        "empty response from provider".into(),
                    ));
                }
                Ok::<Response, ProviderError>(response)
            });
            let response = tokio::select! {
                r = call => r.map_err(OrchestratorError::from)?,
                _ = ctx.cancel.cancelled() => {
                    return Err(Halt::Fatal(OrchestratorError::Cancelled));
                }
            };

            let reply = response.text();
            if let Some(plan) = self.extract_plan(&reply) {
                return Ok(plan);
            }
            let clarification = self.config.clarification();
            warn!(attempt, "Summary reply missing sections; asking again");
            turns.push(Turn::ai(reply));
            turns.push(Turn::human(clarification));
        }
        Err(Halt::Fatal(OrchestratorError::Hook {
            extension: self.name().to_string(),
            hook: "on_invoke_llm",
            message: format!(
                "summarizer did not produce <{}> and <{}> after {} attempts",
                self.config.plan_tag, self.config.summary_tag, self.config.max_attempts
            ),
        }))
    }
}

#[async_trait]
impl Extension for Compactor {
    fn name(&self) -> &str {
        "compactor"
    }

    fn stop_sequences(&self) -> Vec<String> {
        vec![format!("</{}>", self.config.plan_tag)]
    }

    async fn on_memory(&self, ctx: &HookContext<'_>, turns: Vec<Turn>) -> HookResult<Vec<Turn>> {
        let mut turns: Vec<Turn> = turns.into_iter().filter(|t| !t.is_omitted()).collect();
        let lengths = self.estimator.turn_estimates(ctx.scope, &turns);
        let window = self.select_window(&turns, &lengths);
        let seqs: HashSet<u64> = window.iter().map(|&i| turns[i].seq()).collect();

        // Turns flagged on an earlier pass but no longer in the window go back to normal.
        let stale: HashSet<u64> = turns
            .iter()
            .filter(|t| t.is_pending_omission() && !seqs.contains(&t.seq()))
            .map(Turn::seq)
            .collect();
        for t in turns.iter_mut().filter(|t| stale.contains(&t.seq())) {
            t.flags.omission = None;
        }
        ctx.scope.mark(&stale, |t| {
            if t.is_pending_omission() {
                t.flags.omission = None;
            }
        });
        if window.is_empty() {
            return Ok(turns);
        }

        for &i in &window {
            turns[i].flags.omission = Some(Omission::Pending);
        }
        ctx.scope.mark(&seqs, |t| t.flags.omission = Some(Omission::Pending));
        info!(
            flagged = window.len(),
            total = lengths.iter().sum::<u64>(),
            "Prompt over budget, flagging turns for compaction"
        );
        Ok(turns)
    }

    async fn on_invoke_llm(
        &self,
        ctx: &HookContext<'_>,
        turns: Vec<Turn>,
    ) -> HookResult<Vec<Turn>> {
        let pending: HashSet<u64> = turns
            .iter()
            .filter(|t| t.is_pending_omission())
            .map(Turn::seq)
            .collect();
        if pending.is_empty() {
            return Ok(turns);
        }

        info!(
            "Generating summary: prompt exceeds {} tokens",
            self.config.max_prompt_length
        );
        let (window, mut kept): (Vec<Turn>, Vec<Turn>) =
            turns.into_iter().partition(|t| pending.contains(&t.seq()));
        let mut text = self.summarize(ctx, &window).await?;
        debug!(chars = text.len(), "Summary generated");
        text.push_str(&self.config.suffix);

        let summary = ctx.scope.add_turn(Turn::human(text));
        kept.push(summary);

        ctx.scope.mark(&pending, |t| t.flags.omission = Some(Omission::Omitted));
        Ok(kept)
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio_util::sync::CancellationToken;

    use crate::memory::{ConversationScope, Part, TurnKind, Visibility};
    use crate::provider::{Provider, RetryConfig};

    fn compactor() -> Compactor {
        Compactor::new(CompactorConfig::default()).unwrap()
    }

    /// Always answers with a well-formed summary.
    #[derive(Default)]
    struct Summarizer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Provider for Summarizer {
        fn name(&self) -> &str {
            "summarizer"
        }

        async fn generate(&self, _request: &ProviderRequest) -> Result<Response, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Response {
                content: vec![Part::text(
                    "<summary>earlier work</summary><plan><next_step>go on</next_step></plan>",
                )],
                ..Default::default()
            })
        }
    }

    fn long_scope(owner: &str, turns: usize) -> Arc<ConversationScope> {
        let scope = ConversationScope::root(owner);
        let body = "x".repeat(400);
        scope.add_turns(
            (0..turns)
                .map(|i| {
                    if i % 2 == 0 {
                        Turn::human(body.clone())
                    } else {
                        Turn::ai(body.clone())
                    }
                })
                .collect(),
        );
        scope
    }

    fn context<'a>(
        scope: &'a Arc<ConversationScope>,
        provider: &'a dyn Provider,
        retry: &'a RetryConfig,
        cancel: &'a CancellationToken,
    ) -> HookContext<'a> {
        HookContext {
            scope,
            provider,
            retry,
            cancel,
            iteration: 1,
        }
    }

    #[tokio::test]
    async fn interleaved_scopes_keep_their_own_windows() {
        let compactor = Compactor::new(CompactorConfig {
            max_prompt_length: 100,
            min_prompt_length: 50,
            ..Default::default()
        })
        .unwrap();
        let provider = Summarizer::default();
        let retry = RetryConfig::default();
        let cancel = CancellationToken::new();

        let busy = long_scope("busy", 5);
        let quiet = ConversationScope::root("quiet");
        quiet.add_turn(Turn::human("hi"));
        let busy_ctx = context(&busy, &provider, &retry, &cancel);
        let quiet_ctx = context(&quiet, &provider, &retry, &cancel);

        let busy_prompt = compactor
            .on_memory(&busy_ctx, busy.project(Visibility::Scope, false))
            .await
            .unwrap();
        assert_eq!(busy_prompt.iter().filter(|t| t.is_pending_omission()).count(), 4);

        // A second session passes through the same compactor before the first sends.
        let quiet_prompt = compactor
            .on_memory(&quiet_ctx, quiet.project(Visibility::Scope, false))
            .await
            .unwrap();
        let quiet_prompt = compactor
            .on_invoke_llm(&quiet_ctx, quiet_prompt)
            .await
            .unwrap();
        assert_eq!(quiet_prompt.len(), 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);

        let sent = compactor.on_invoke_llm(&busy_ctx, busy_prompt).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(sent.len(), 2);
        assert!(sent[1].text().starts_with("<summary>earlier work</summary>"));
        let omitted = busy.own_turns().iter().filter(|t| t.is_omitted()).count();
        assert_eq!(omitted, 4);
        assert!(quiet.own_turns().iter().all(|t| t.flags.omission.is_none()));
    }

    #[test]
    fn validate_rejects_inverted_limits() {
        let config = CompactorConfig {
            max_prompt_length: 10,
            min_prompt_length: 20,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(OrchestratorError::Config(_))));
        assert!(Compactor::new(config).is_err());
    }

    #[test]
    fn under_budget_selects_nothing() {
        let turns = vec![Turn::human("a"), Turn::ai("b")];
        assert!(compactor().select_window(&turns, &[10, 10]).is_empty());
    }

    #[test]
    fn window_stops_on_ai_boundary_below_min() {
        // 12 turns of 10k tokens = 120k, alternating human/ai starting human.
        let turns: Vec<Turn> = (0..12)
            .map(|i| if i % 2 == 0 { Turn::human("h") } else { Turn::ai("a") })
            .collect();
        let lengths = vec![10_000; 12];
        let window = compactor().select_window(&turns, &lengths);
        // After dropping 1..=7 the total is 50k and index 8 is human, so 8 goes
        // too; index 9 is the first AI turn at or below 50k.
        assert_eq!(window, (1..=8).collect::<Vec<_>>());
        assert_eq!(turns[9].kind, TurnKind::Ai);
    }

    #[test]
    fn message_count_triggers_compaction() {
        let c = Compactor::new(CompactorConfig {
            max_num_messages: 3,
            min_prompt_length: 0,
            ..Default::default()
        })
        .unwrap();
        let turns: Vec<Turn> = (0..5).map(|_| Turn::human("x")).collect();
        assert_eq!(c.select_window(&turns, &[1; 5]), vec![1, 2, 3, 4]);
    }

    #[test]
    fn transcript_format() {
        let t = transcript(&[Turn::human("hi"), Turn::ai("hello")]);
        assert_eq!(
            t,
            "<conversation>\n<message role=\"human\">\nhi\n</message>\n<message role=\"ai\">\nhello\n</message>\n</conversation>"
        );
    }

    #[test]
    fn extract_plan_keeps_first_step_only() {
        let reply = "<summary>did things</summary>\n<plan><thinking>t</thinking><next_step sequence_num=\"1\">one</next_step><next_step sequence_num=\"2\">two</next_step></plan>";
        let text = compactor().extract_plan(reply).unwrap();
        assert!(text.starts_with("<summary>did things</summary>"));
        assert!(text.contains("one"));
        assert!(!text.contains("two"));
        assert!(text.ends_with("</next_step></plan>"));
    }

    #[test]
    fn extract_plan_requires_both_sections() {
        assert!(compactor().extract_plan("<plan>p</plan>").is_none());
        assert!(compactor().extract_plan("<summary>s</summary>").is_none());
    }

    #[test]
    fn clarification_text() {
        assert_eq!(
            CompactorConfig::default().clarification(),
            "No <plan> or <summary> tag found. Please write your plan in the <plan> tag and summary in the <summary> tag."
        );
    }

    #[test]
    fn stop_sequence_closes_plan() {
        assert_eq!(compactor().stop_sequences(), vec!["</plan>".to_string()]);
    }
}
