//! OpenRouter chat-completions adapter.
//!
//! Maps turns onto OpenAI-style messages, cache markers onto `cache_control`
//! content blocks, and the returned choice back into [`Response`] parts.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{Provider, ProviderError, ProviderRequest, Response, StopReason, Usage};
use crate::extension::ToolSpec;
use crate::memory::{Content, Part, ToolCall, Turn, TurnKind};

pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Default model when neither the request nor the provider names one.
pub const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4";

const DEFAULT_MAX_TOKENS: u32 = 8192;

// ── Wire types ─────────────────────────────────────────────────────

#[derive(Serialize, Debug, Default)]
struct ChatRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "is_zero_u32")]
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDef>>,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Serialize, Clone, Debug, PartialEq)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: &'static str,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_control: Option<CacheControl>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
struct CacheControl {
    #[serde(rename = "type")]
    kind: &'static str,
}

impl ContentBlock {
    fn text(text: impl Into<String>, cached: bool) -> Self {
        Self {
            block_type: "text",
            text: text.into(),
            cache_control: cached.then_some(CacheControl { kind: "ephemeral" }),
        }
    }
}

#[derive(Serialize, Clone, Debug)]
struct Message {
    role: MessageRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<MessageContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl Message {
    fn new(role: MessageRole, content: MessageContent) -> Self {
        Self {
            role,
            content: Some(content),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: Some(MessageContent::Text(content.into())),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }
}

#[derive(Serialize, Clone, Debug)]
struct ToolDef {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: FunctionDef,
}

#[derive(Serialize, Clone, Debug)]
struct FunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

impl From<&ToolSpec> for ToolDef {
    fn from(spec: &ToolSpec) -> Self {
        Self {
            tool_type: "function",
            function: FunctionDef {
                name: spec.name.clone(),
                description: spec.description.clone(),
                parameters: spec.input_schema.clone(),
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    call_type: String,
    function: FunctionCallData,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct FunctionCallData {
    name: String,
    arguments: String,
}

#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    error: Option<ApiErrorResponse>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
    reasoning: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorResponse {
    message: String,
}

#[derive(Deserialize, Debug, Clone, Default)]
struct UsageInfo {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Deserialize, Debug, Clone, Default)]
struct PromptTokensDetails {
    cached_tokens: Option<u64>,
    cache_write_tokens: Option<u64>,
}

impl From<&UsageInfo> for Usage {
    fn from(info: &UsageInfo) -> Self {
        let prompt = info.prompt_tokens.unwrap_or(0);
        let details = info.prompt_tokens_details.clone().unwrap_or_default();
        let read = details.cached_tokens.unwrap_or(0);
        let write = details.cache_write_tokens.unwrap_or(0);
        Usage {
            input_tokens: prompt.saturating_sub(read + write),
            output_tokens: info.completion_tokens.unwrap_or(0),
            cache_read_tokens: read,
            cache_write_tokens: write,
        }
    }
}

// ── Turn mapping ───────────────────────────────────────────────────

fn text_content(turn: &Turn, parts: &[Part]) -> Option<MessageContent> {
    let blocks: Vec<ContentBlock> = parts
        .iter()
        .enumerate()
        .filter_map(|(i, p)| match p {
            Part::Text { text } => Some(ContentBlock::text(text, turn.cache_marker == Some(i))),
            _ => None,
        })
        .collect();
    if blocks.is_empty() {
        None
    } else if blocks.iter().all(|b| b.cache_control.is_none()) {
        Some(MessageContent::Text(
            blocks.into_iter().map(|b| b.text).collect::<Vec<_>>().join("\n"),
        ))
    } else {
        Some(MessageContent::Blocks(blocks))
    }
}

/// Convert one turn into zero or more wire messages.
fn turn_to_messages(turn: &Turn) -> Vec<Message> {
    let role = match turn.kind {
        TurnKind::System => MessageRole::System,
        TurnKind::Human | TurnKind::Context => MessageRole::User,
        TurnKind::Ai => MessageRole::Assistant,
        other => {
            trace!("Skipping {other} turn in prompt");
            return Vec::new();
        }
    };

    let parts = match &turn.content {
        Content::Text(text) => vec![Part::text(text.clone())],
        Content::Parts(parts) => parts.clone(),
    };

    let mut messages = Vec::new();
    for part in &parts {
        if let Part::ToolResult(result) = part {
            messages.push(Message::tool_result(&result.tool_use_id, &result.content));
        }
    }

    let tool_calls: Vec<WireToolCall> = parts
        .iter()
        .filter_map(|p| match p {
            Part::ToolCall(call) => Some(WireToolCall {
                id: call.id.clone(),
                call_type: function_type(),
                function: FunctionCallData {
                    name: call.name.clone(),
                    arguments: call.input.to_string(),
                },
            }),
            _ => None,
        })
        .collect();

    let content = text_content(turn, &parts);
    if content.is_some() || !tool_calls.is_empty() {
        let mut message = Message {
            role,
            content,
            tool_calls: None,
            tool_call_id: None,
        };
        if !tool_calls.is_empty() {
            message.tool_calls = Some(tool_calls);
        }
        messages.push(message);
    }

    for attachment in &turn.attachments {
        if let crate::memory::AttachmentPayload::Text { data } = &attachment.payload {
            messages.push(Message::new(
                MessageRole::User,
                MessageContent::Text(format!("[{}]\n{data}", attachment.name)),
            ));
        }
    }
    messages
}

fn completion_to_response(choice: Option<RawChoice>, usage: Option<&UsageInfo>) -> Response {
    let usage = usage.map(Usage::from).unwrap_or_default();
    let Some(choice) = choice else {
        return Response {
            content: Vec::new(),
            usage,
            stop_reason: StopReason::Other,
        };
    };

    let mut content = Vec::new();
    if let Some(reasoning) = choice.message.reasoning.filter(|r| !r.is_empty()) {
        content.push(Part::Thinking {
            thinking: reasoning,
            signature: None,
        });
    }
    if let Some(text) = choice.message.content.filter(|t| !t.is_empty()) {
        content.push(Part::Text { text });
    }
    for call in choice.message.tool_calls.unwrap_or_default() {
        let input = serde_json::from_str(&call.function.arguments)
            .unwrap_or(serde_json::Value::String(call.function.arguments));
        content.push(Part::ToolCall(ToolCall {
            id: call.id,
            name: call.function.name,
            input,
        }));
    }

    Response {
        content,
        usage,
        stop_reason: StopReason::from_finish_reason(choice.finish_reason.as_deref()),
    }
}

// ── Provider ───────────────────────────────────────────────────────

/// Async HTTP client for the OpenRouter chat completions API.
pub struct OpenRouterProvider {
    client: reqwest::Client,
    api_key: String,
    referer: String,
    title: String,
    default_model: String,
}

impl OpenRouterProvider {
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .user_agent("baton-rs/0.1")
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| ProviderError::Permanent(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            referer: "https://github.com/tacryt-socryp/baton-rs".into(),
            title: "baton-rs".into(),
            default_model: DEFAULT_MODEL.into(),
        })
    }

    /// Read the API key from `OPENROUTER_KEY`.
    pub fn from_env() -> Result<Self, ProviderError> {
        let key = std::env::var("OPENROUTER_KEY")
            .map_err(|_| ProviderError::Permanent("OPENROUTER_KEY not set".into()))?;
        Self::new(key)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    fn build_request(&self, request: &ProviderRequest) -> ChatRequest {
        ChatRequest {
            model: Some(
                request
                    .model
                    .clone()
                    .unwrap_or_else(|| self.default_model.clone()),
            ),
            messages: request.turns.iter().flat_map(turn_to_messages).collect(),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: request.temperature,
            stop: (!request.stop_sequences.is_empty()).then(|| request.stop_sequences.clone()),
            tools: (!request.tools.is_empty())
                .then(|| request.tools.iter().map(ToolDef::from).collect()),
        }
    }

    async fn chat(&self, body: &ChatRequest) -> Result<Response, String> {
        debug!(
            "LLM request: model={}, messages={}, tools={}, max_tokens={}",
            body.model.as_deref().unwrap_or("(none)"),
            body.messages.len(),
            body.tools.as_ref().map_or(0, |t| t.len()),
            body.max_tokens,
        );
        trace!(
            "Request payload size: {} bytes",
            serde_json::to_string(body).map_or(0, |s| s.len())
        );

        let start = Instant::now();
        let resp = self
            .client
            .post(OPENROUTER_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", &self.title)
            .json(body)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| format!("failed to read response: {e}"))?;
        debug!(
            "LLM response: HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            return Err(format!("OpenRouter API HTTP {status}: {text}"));
        }

        let parsed: RawChatResponse =
            serde_json::from_str(&text).map_err(|e| format!("failed to parse response: {e}"))?;
        if let Some(err) = parsed.error {
            return Err(format!("OpenRouter API error: {}", err.message));
        }

        let choice = parsed.choices.and_then(|c| c.into_iter().next());
        let response = completion_to_response(choice, parsed.usage.as_ref());
        debug!(
            "Token usage: input={}, output={}, cache_read={}, cache_write={}",
            response.usage.input_tokens,
            response.usage.output_tokens,
            response.usage.cache_read_tokens,
            response.usage.cache_write_tokens,
        );
        Ok(response)
    }
}

#[async_trait]
impl Provider for OpenRouterProvider {
    fn name(&self) -> &str {
        "openrouter"
    }

    async fn generate(&self, request: &ProviderRequest) -> Result<Response, ProviderError> {
        let body = self.build_request(request);
        self.chat(&body).await.map_err(ProviderError::classify)
    }
}
