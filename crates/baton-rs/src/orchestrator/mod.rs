//! The orchestrator: the control loop that drives a session.
//!
//! Each iteration builds a prompt from a projection of the scope, calls the
//! provider, and turns the response into work. Work is either a tag tree
//! fanned out to every extension or a queue of structured tool calls
//! dispatched to capabilities. The loop ends when an iteration produces no
//! further work, when an extension terminates the session, or on a fatal
//! error.
//!
//! ```ignore
//! let orchestrator = Orchestrator::new(provider, OrchestratorConfig::new())
//!     .with_extension(Compactor::new(CompactorConfig::default())?)
//!     .with_capability(ShellCapability::new(policy, ShellConfig::default()))
//!     .with_observer(LoggingObserver::new());
//!
//! let scope = ConversationScope::root("session");
//! let outcome = orchestrator
//!     .run(&scope, vec![Turn::human("List the repo")], CancellationToken::new())
//!     .await?;
//! ```

pub mod config;
pub mod dispatch;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::OrchestratorError;
use crate::extension::{
    Capability, Extension, Halt, HookContext, HookResult, Node, Observer, ToolSpec, tag,
};
use crate::memory::{ConversationScope, Turn, TurnKind};
use crate::provider::{Provider, ProviderError, ProviderRequest, Response, retry_provider_call};

pub use config::{DEFAULT_MAX_ITERATIONS, OrchestratorConfig, ParseMode};
pub use dispatch::{MAX_TOOL_NAME_LEN, sanitize_tool_name};

/// How a session ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// An iteration produced no further work.
    Completed { iterations: u32 },
    /// An extension ended the session.
    Terminated,
    /// The cancellation token fired.
    Cancelled,
}

/// What an iteration left behind.
enum Flow {
    /// Tool results are waiting for the model.
    Continue,
    Done,
}

// ── Orchestrator ───────────────────────────────────────────────────

/// Composes a provider with extensions and runs the loop.
///
/// Extensions run in registration order. Capabilities and observers are
/// extensions too and take part in every hook fold at the position they were
/// registered.
pub struct Orchestrator {
    provider: Arc<dyn Provider>,
    config: OrchestratorConfig,
    extensions: Vec<Arc<dyn Extension>>,
    capabilities: Vec<Arc<dyn Capability>>,
    observers: Vec<Arc<dyn Observer>>,
}

impl Orchestrator {
    pub fn new(provider: Arc<dyn Provider>, config: OrchestratorConfig) -> Self {
        Self {
            provider,
            config,
            extensions: Vec::new(),
            capabilities: Vec::new(),
            observers: Vec::new(),
        }
    }

    pub fn with_extension(self, extension: impl Extension + 'static) -> Self {
        self.with_shared_extension(Arc::new(extension))
    }

    /// Register an extension the caller keeps a handle to.
    pub fn with_shared_extension<E: Extension + 'static>(mut self, extension: Arc<E>) -> Self {
        self.extensions.push(extension);
        self
    }

    pub fn with_capability(self, capability: impl Capability + 'static) -> Self {
        self.with_shared_capability(Arc::new(capability))
    }

    pub fn with_shared_capability<C: Capability + 'static>(mut self, capability: Arc<C>) -> Self {
        self.extensions.push(capability.clone());
        self.capabilities.push(capability);
        self
    }

    pub fn with_observer(self, observer: impl Observer + 'static) -> Self {
        self.with_shared_observer(Arc::new(observer))
    }

    pub fn with_shared_observer<O: Observer + 'static>(mut self, observer: Arc<O>) -> Self {
        self.extensions.push(observer.clone());
        self.observers.push(observer);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Tool declarations of every capability, in registration order.
    pub fn tool_specs(&self) -> Vec<ToolSpec> {
        self.capabilities.iter().flat_map(|c| c.tools()).collect()
    }

    /// Deduplicated stop sequences of every extension plus configured extras.
    pub fn stop_sequences(&self) -> Vec<String> {
        let mut stops: Vec<String> = Vec::new();
        let declared = self.extensions.iter().flat_map(|e| e.stop_sequences());
        for stop in declared.chain(self.config.extra_stop_sequences.iter().cloned()) {
            if !stops.contains(&stop) {
                stops.push(stop);
            }
        }
        stops
    }

    fn context<'a>(
        &'a self,
        scope: &'a Arc<ConversationScope>,
        cancel: &'a CancellationToken,
        iteration: u32,
    ) -> HookContext<'a> {
        HookContext {
            scope,
            provider: self.provider.as_ref(),
            retry: &self.config.retry,
            cancel,
            iteration,
        }
    }

    // ── Entry point ────────────────────────────────────────────────

    /// Run a session over `scope`, seeded with `input`.
    ///
    /// Termination and cancellation are reported as outcomes. Everything
    /// else that ends the session early is an error.
    pub async fn run(
        &self,
        scope: &Arc<ConversationScope>,
        input: Vec<Turn>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, OrchestratorError> {
        info!(
            "Session started: provider={}, extensions={}, max_iterations={}",
            self.provider.name(),
            self.extensions.len(),
            self.config.max_iterations
        );

        let mut iteration = 0u32;
        let mut next = {
            let ctx = self.context(scope, &cancel, iteration);
            self.ingest(&ctx, input).await.map(|()| Flow::Continue)
        };

        loop {
            match next {
                Ok(Flow::Continue) => {}
                Ok(Flow::Done) => {
                    info!("Session completed after {iteration} iteration(s)");
                    return Ok(RunOutcome::Completed {
                        iterations: iteration,
                    });
                }
                Err(Halt::Interrupt(turns)) => {
                    debug!("Interrupted with {} turn(s)", turns.len());
                    let ctx = self.context(scope, &cancel, iteration);
                    next = self.absorb_interruption(&ctx, turns).await.map(|()| Flow::Continue);
                    continue;
                }
                Err(Halt::Terminate) => {
                    info!("Session terminated by extension at iteration {iteration}");
                    return Ok(RunOutcome::Terminated);
                }
                Err(Halt::Fatal(OrchestratorError::Cancelled)) => {
                    info!("Session cancelled at iteration {iteration}");
                    return Ok(RunOutcome::Cancelled);
                }
                Err(Halt::Fatal(err)) => {
                    warn!("Session failed at iteration {iteration}: {err}");
                    return Err(err);
                }
            }

            if cancel.is_cancelled() {
                info!("Session cancelled at iteration {iteration}");
                return Ok(RunOutcome::Cancelled);
            }
            if iteration >= self.config.max_iterations {
                warn!("Iteration limit reached ({})", self.config.max_iterations);
                return Err(OrchestratorError::IterationLimitExceeded {
                    max: self.config.max_iterations,
                });
            }
            iteration += 1;
            let ctx = self.context(scope, &cancel, iteration);
            next = self.iterate(&ctx).await;
        }
    }

    // ── Turn intake ────────────────────────────────────────────────

    async fn ingest(&self, ctx: &HookContext<'_>, mut turns: Vec<Turn>) -> HookResult<()> {
        for ext in &self.extensions {
            turns = ext.on_input_messages(ctx, turns).await?;
        }
        self.add_messages(ctx, turns).await?;
        Ok(())
    }

    /// Fold `turns` through every `on_add_messages` and append what is left.
    pub(crate) async fn add_messages(
        &self,
        ctx: &HookContext<'_>,
        mut turns: Vec<Turn>,
    ) -> HookResult<Vec<Turn>> {
        for ext in &self.extensions {
            turns = ext.on_add_messages(ctx, turns).await?;
        }
        if turns.is_empty() {
            return Ok(turns);
        }
        Ok(ctx.scope.add_turns(turns))
    }

    async fn absorb_interruption(&self, ctx: &HookContext<'_>, turns: Vec<Turn>) -> HookResult<()> {
        let (carried, dropped): (Vec<Turn>, Vec<Turn>) =
            turns.into_iter().partition(|t| t.kind != TurnKind::Unknown);
        if !dropped.is_empty() {
            debug!("Dropping {} interruption turn(s) of unknown kind", dropped.len());
        }
        let added = self.add_messages(ctx, carried).await?;
        for ext in &self.extensions {
            ext.on_interruption(ctx, &added).await?;
        }
        Ok(())
    }

    // ── One iteration ──────────────────────────────────────────────

    async fn iterate(&self, ctx: &HookContext<'_>) -> HookResult<Flow> {
        debug!("Iteration {} started", ctx.iteration);
        let prompt = self.build_prompt(ctx).await?;

        let mode = self
            .config
            .parse_mode
            .resolve(self.provider.supports_tool_use());
        let request = ProviderRequest {
            turns: prompt,
            tools: match mode {
                ParseMode::ToolUse => self.tool_specs(),
                _ => Vec::new(),
            },
            stop_sequences: self.stop_sequences(),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            model: self.config.model.clone(),
        };

        let mut response = self.invoke_provider(ctx, &request).await?;
        for ext in &self.extensions {
            response = ext.on_llm_response(ctx, response).await?;
        }
        debug!(
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            stop_reason = ?response.stop_reason,
            "Provider responded"
        );

        let thinking: Vec<Turn> = response
            .thinking()
            .into_iter()
            .map(|part| Turn::ai(vec![part]))
            .collect();
        if !thinking.is_empty() {
            self.add_messages(ctx, thinking).await?;
        }

        match mode {
            ParseMode::ToolUse => self.process_tool_use(ctx, &response).await,
            _ => self.process_tag_tree(ctx, response.text()).await,
        }
    }

    /// Projection, `on_memory`, system prompt, `on_invoke_llm`.
    async fn build_prompt(&self, ctx: &HookContext<'_>) -> HookResult<Vec<Turn>> {
        let mut turns: Vec<Turn> = ctx
            .scope
            .project(self.config.visibility, self.config.include_children)
            .into_iter()
            .filter(|t| !t.is_omitted())
            .collect();
        for ext in &self.extensions {
            turns = ext.on_memory(ctx, turns).await?;
        }
        if let Some(system) = &self.config.system_prompt {
            turns.insert(0, Turn::system(system.clone()));
        }
        for ext in &self.extensions {
            turns = ext.on_invoke_llm(ctx, turns).await?;
        }

        let chars: usize = turns.iter().map(Turn::char_len).sum();
        ctx.scope.budget().record_prompt(chars);
        debug!(turns = turns.len(), chars, "Prompt built");
        Ok(turns)
    }

    async fn invoke_provider(
        &self,
        ctx: &HookContext<'_>,
        request: &ProviderRequest,
    ) -> HookResult<Response> {
        let provider = self.provider.as_ref();
        let call = retry_provider_call(&self.config.retry, move || async move {
            let response = provider.generate(request).await?;
            if response.content.is_empty() {
                return Err(ProviderError::Retryable(format!(
                    "{} returned an empty response",
                    provider.name()
                )));
            }
            Ok(response)
        });
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(Halt::Fatal(OrchestratorError::Cancelled)),
            r = call => r.map_err(|e| Halt::Fatal(e.into())),
        }
    }

    // ── Output processing ──────────────────────────────────────────

    async fn process_tag_tree(&self, ctx: &HookContext<'_>, text: String) -> HookResult<Flow> {
        let mut text = text;
        for ext in &self.extensions {
            text = ext.on_llm_output(ctx, text).await?;
        }
        let root = tag::parse_root(&text);
        for child in &root.children {
            match child {
                Node::Element(element) => {
                    self.add_messages(ctx, vec![Turn::ai(element.to_markup())]).await?;
                    for ext in &self.extensions {
                        ext.on_tag(ctx, element).await?;
                    }
                }
                Node::Text(run) => {
                    let run = run.trim();
                    if run.is_empty() {
                        continue;
                    }
                    self.add_messages(ctx, vec![Turn::ai(run.to_string())]).await?;
                    for ext in &self.extensions {
                        ext.on_plain_text(ctx, run).await?;
                    }
                }
            }
        }
        self.check_complete(ctx).await?;
        Ok(Flow::Done)
    }

    async fn process_tool_use(&self, ctx: &HookContext<'_>, response: &Response) -> HookResult<Flow> {
        let queue: Vec<_> = response
            .tool_calls()
            .into_iter()
            .map(|mut call| {
                call.name = sanitize_tool_name(&call.name);
                call
            })
            .collect();

        let mut text = response.text();
        if !text.trim().is_empty() {
            for ext in &self.extensions {
                text = ext.on_llm_output(ctx, text).await?;
            }
            let text = text.trim();
            if !text.is_empty() {
                self.add_messages(ctx, vec![Turn::ai(text)]).await?;
                for ext in &self.extensions {
                    ext.on_plain_text(ctx, text).await?;
                }
            }
        }

        if queue.is_empty() {
            self.check_complete(ctx).await?;
            return Ok(Flow::Done);
        }
        info!(
            "[iteration {}] Processing {} tool call(s)",
            ctx.iteration,
            queue.len()
        );
        self.drain_tool_queue(ctx, queue).await?;
        Ok(Flow::Continue)
    }

    async fn check_complete(&self, ctx: &HookContext<'_>) -> HookResult<()> {
        for ext in &self.extensions {
            ext.on_process_messages_complete(ctx).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::memory::{Part, ToolCall};
    use crate::provider::ProviderError;

    struct Scripted {
        replies: Mutex<Vec<Response>>,
        requests: Mutex<Vec<ProviderRequest>>,
        tool_use: bool,
    }

    impl Scripted {
        fn new(tool_use: bool, mut replies: Vec<Response>) -> Arc<Self> {
            replies.reverse();
            Arc::new(Self {
                replies: Mutex::new(replies),
                requests: Mutex::new(Vec::new()),
                tool_use,
            })
        }
    }

    #[async_trait]
    impl Provider for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn supports_tool_use(&self) -> bool {
            self.tool_use
        }

        async fn generate(&self, request: &ProviderRequest) -> Result<Response, ProviderError> {
            self.requests.lock().unwrap().push(request.clone());
            self.replies
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| ProviderError::Permanent("script exhausted".into()))
        }
    }

    fn text(s: &str) -> Response {
        Response {
            content: vec![Part::text(s)],
            ..Default::default()
        }
    }

    struct Stops(&'static str);

    impl Extension for Stops {
        fn stop_sequences(&self) -> Vec<String> {
            vec![self.0.to_string()]
        }
    }

    #[tokio::test]
    async fn plain_reply_completes_in_one_iteration() {
        let provider = Scripted::new(true, vec![text("Hello there")]);
        let orchestrator = Orchestrator::new(
            provider.clone(),
            OrchestratorConfig::new().with_system_prompt("be nice"),
        );
        let scope = ConversationScope::root("test");
        let outcome = orchestrator
            .run(&scope, vec![Turn::human("hi")], CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Completed { iterations: 1 });

        let turns = scope.own_turns();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].kind, TurnKind::Ai);
        assert_eq!(turns[1].text(), "Hello there");

        let requests = provider.requests.lock().unwrap();
        assert_eq!(requests[0].turns[0].kind, TurnKind::System);
        assert_eq!(requests[0].turns[1].text(), "hi");
        assert!(scope.own_turns().iter().all(|t| t.kind != TurnKind::System));
        assert!(scope.budget().last_prompt_chars.is_some());
    }

    #[test]
    fn stop_sequences_are_deduplicated() {
        let provider = Scripted::new(true, Vec::new());
        let orchestrator = Orchestrator::new(
            provider,
            OrchestratorConfig::new().with_stop_sequence("</a>").with_stop_sequence("</c>"),
        )
        .with_extension(Stops("</a>"))
        .with_extension(Stops("</b>"));
        assert_eq!(orchestrator.stop_sequences(), vec!["</a>", "</b>", "</c>"]);
    }

    #[tokio::test]
    async fn thinking_is_recorded_before_text() {
        let provider = Scripted::new(
            true,
            vec![Response {
                content: vec![
                    Part::Thinking {
                        thinking: "consider".into(),
                        signature: None,
                    },
                    Part::text("answer"),
                ],
                ..Default::default()
            }],
        );
        let orchestrator = Orchestrator::new(provider, OrchestratorConfig::new());
        let scope = ConversationScope::root("test");
        orchestrator
            .run(&scope, vec![Turn::human("q")], CancellationToken::new())
            .await
            .unwrap();
        let turns = scope.own_turns();
        assert_eq!(turns.len(), 3);
        assert!(matches!(
            &turns[1].content,
            crate::memory::Content::Parts(parts) if matches!(parts[0], Part::Thinking { .. })
        ));
        assert_eq!(turns[2].text(), "answer");
    }

    /// Drops thinking turns before they are stored.
    struct DropThinking;

    #[async_trait]
    impl Extension for DropThinking {
        async fn on_add_messages(
            &self,
            _ctx: &HookContext<'_>,
            turns: Vec<Turn>,
        ) -> HookResult<Vec<Turn>> {
            Ok(turns
                .into_iter()
                .filter(|t| {
                    !matches!(
                        &t.content,
                        crate::memory::Content::Parts(parts)
                            if parts.iter().any(|p| matches!(p, Part::Thinking { .. }))
                    )
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn thinking_turns_pass_through_add_messages() {
        let provider = Scripted::new(
            true,
            vec![Response {
                content: vec![
                    Part::Thinking {
                        thinking: "consider".into(),
                        signature: None,
                    },
                    Part::text("answer"),
                ],
                ..Default::default()
            }],
        );
        let orchestrator =
            Orchestrator::new(provider, OrchestratorConfig::new()).with_extension(DropThinking);
        let scope = ConversationScope::root("test");
        orchestrator
            .run(&scope, vec![Turn::human("q")], CancellationToken::new())
            .await
            .unwrap();
        let texts: Vec<String> = scope.own_turns().iter().map(Turn::text).collect();
        assert_eq!(texts, vec!["q", "answer"]);
    }

    #[tokio::test]
    async fn tool_names_are_sanitized_before_lookup() {
        let provider = Scripted::new(
            true,
            vec![
                Response {
                    content: vec![Part::ToolCall(ToolCall::new(
                        "c1",
                        "fs.read",
                        serde_json::json!({}),
                    ))],
                    ..Default::default()
                },
                text("done"),
            ],
        );
        let orchestrator = Orchestrator::new(provider, OrchestratorConfig::new());
        let scope = ConversationScope::root("test");
        orchestrator
            .run(&scope, vec![Turn::human("read")], CancellationToken::new())
            .await
            .unwrap();
        let turns = scope.own_turns();
        assert_eq!(turns[1].tool_calls()[0].name, "fs_read");
        assert!(turns[2].text().contains("Tool `fs_read` is not supported"));
    }

    #[tokio::test]
    async fn provider_failure_is_fatal() {
        let provider = Scripted::new(true, Vec::new());
        let orchestrator = Orchestrator::new(provider, OrchestratorConfig::new());
        let scope = ConversationScope::root("test");
        let err = orchestrator
            .run(&scope, vec![Turn::human("q")], CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Provider(ProviderError::Permanent(_))));
    }
}
