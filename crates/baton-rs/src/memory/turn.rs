//! Turns: the unit of conversation state.
//!
//! Every [`Turn`] receives a sequence number from a process-wide atomic
//! counter at construction. Logs order turns by that number, never by
//! insertion order, so turns produced concurrently by different scopes still
//! interleave deterministically.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::json;

// ── Sequence counter ───────────────────────────────────────────────

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

/// Allocate the next turn sequence number.
pub fn next_seq() -> u64 {
    NEXT_SEQ.fetch_add(1, Ordering::Relaxed)
}

/// Ensure future sequence numbers are strictly greater than `seq`.
///
/// Called after loading persisted turns so freshly created turns sort after
/// the restored history.
pub fn advance_seq_past(seq: u64) {
    NEXT_SEQ.fetch_max(seq.saturating_add(1), Ordering::Relaxed);
}

// ── Kinds ──────────────────────────────────────────────────────────

/// Who (or what) authored a turn.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TurnKind {
    Human,
    Ai,
    System,
    Error,
    Log,
    Warning,
    Context,
    Artifact,
    Unknown,
}

impl fmt::Display for TurnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TurnKind::Human => "human",
            TurnKind::Ai => "ai",
            TurnKind::System => "system",
            TurnKind::Error => "error",
            TurnKind::Log => "log",
            TurnKind::Warning => "warning",
            TurnKind::Context => "context",
            TurnKind::Artifact => "artifact",
            TurnKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// The kinds that flow between scopes and into prompts by default.
pub fn conversational_kinds() -> HashSet<TurnKind> {
    [TurnKind::Human, TurnKind::Ai, TurnKind::System]
        .into_iter()
        .collect()
}

// ── Tool call / result parts ───────────────────────────────────────

/// A tool invocation requested by the model.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
        }
    }
}

/// The outcome of a tool invocation, paired with its call by `tool_use_id`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: true,
        }
    }
}

// ── Content ────────────────────────────────────────────────────────

/// One block of structured turn content.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    ToolCall(ToolCall),
    ToolResult(ToolResult),
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    RedactedThinking {
        data: String,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    /// Flat text rendering used for size estimation and transcripts.
    ///
    /// Thinking signatures are opaque and excluded.
    pub fn render(&self) -> String {
        match self {
            Part::Text { text } => text.clone(),
            Part::ToolCall(call) => json!({
                "type": "tool_use",
                "id": call.id,
                "name": call.name,
                "input": call.input,
            })
            .to_string(),
            Part::ToolResult(result) => json!({
                "type": "tool_result",
                "tool_use_id": result.tool_use_id,
                "content": result.content,
                "is_error": result.is_error,
            })
            .to_string(),
            Part::Thinking { thinking, .. } => {
                json!({"type": "thinking", "thinking": thinking}).to_string()
            }
            Part::RedactedThinking { data } => {
                json!({"type": "redacted_thinking", "data": data}).to_string()
            }
        }
    }

    /// Whether a cache marker may be attached to this part.
    ///
    /// Providers reject cache control on empty text blocks.
    pub fn accepts_cache_marker(&self) -> bool {
        !matches!(self, Part::Text { text } if text.is_empty())
    }
}

/// Turn content: plain text or a list of parts.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<Part>),
}

impl Content {
    /// Flatten to text, joining parts with newlines.
    pub fn render(&self) -> String {
        match self {
            Content::Text(text) => text.clone(),
            Content::Parts(parts) => parts
                .iter()
                .map(Part::render)
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Borrow the content as parts, converting plain text into one text part.
    pub fn into_parts(self) -> Vec<Part> {
        match self {
            Content::Text(text) => vec![Part::Text { text }],
            Content::Parts(parts) => parts,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Content::Text(text) => text.is_empty(),
            Content::Parts(parts) => parts.is_empty(),
        }
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Content::Text(s)
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Content::Text(s.to_string())
    }
}

impl From<Vec<Part>> for Content {
    fn from(parts: Vec<Part>) -> Self {
        Content::Parts(parts)
    }
}

// ── Attachments ────────────────────────────────────────────────────

/// A file or link attached to a turn.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub payload: AttachmentPayload,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttachmentPayload {
    Text { data: String },
    Link { url: String },
    Binary { bytes: Vec<u8> },
}

impl Attachment {
    /// Characters this attachment contributes to the prompt size.
    /// Binary payloads are priced by the provider separately and count as zero.
    pub fn char_len(&self) -> usize {
        match &self.payload {
            AttachmentPayload::Text { data } => data.chars().count(),
            AttachmentPayload::Link { url } => url.chars().count(),
            AttachmentPayload::Binary { .. } => 0,
        }
    }
}

// ── Flags ──────────────────────────────────────────────────────────

/// Compaction state of a turn.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Omission {
    /// Flagged for the next summarization window.
    Pending,
    /// Replaced by a summary; never shown again.
    Omitted,
}

/// The mutable metadata of an otherwise immutable turn.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct TurnFlags {
    /// Candidate position for a prompt-cache breakpoint.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cache_breakpoint: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub omission: Option<Omission>,
}

// ── Turn ───────────────────────────────────────────────────────────

/// One message in a conversation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Turn {
    seq: u64,
    pub kind: TurnKind,
    pub content: Content,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_name: Option<String>,
    /// Owner id of the scope (orchestrator or capability) that produced it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub flags: TurnFlags,
    /// Index of the part carrying a prompt-cache marker for the current send.
    /// Only ever set on prompt copies, never persisted.
    #[serde(skip)]
    pub cache_marker: Option<usize>,
}

impl Turn {
    pub fn new(kind: TurnKind, content: impl Into<Content>) -> Self {
        Self {
            seq: next_seq(),
            kind,
            content: content.into(),
            path: Vec::new(),
            entry_name: None,
            owner: None,
            attachments: Vec::new(),
            flags: TurnFlags::default(),
            cache_marker: None,
        }
    }

    pub fn human(content: impl Into<Content>) -> Self {
        Self::new(TurnKind::Human, content)
    }

    pub fn ai(content: impl Into<Content>) -> Self {
        Self::new(TurnKind::Ai, content)
    }

    pub fn system(content: impl Into<Content>) -> Self {
        Self::new(TurnKind::System, content)
    }

    /// An AI turn carrying a single tool call.
    pub fn tool_call(call: ToolCall) -> Self {
        Self::ai(vec![Part::ToolCall(call)])
    }

    /// A HUMAN turn carrying a single tool result.
    pub fn tool_result(result: ToolResult) -> Self {
        Self::human(vec![Part::ToolResult(result)])
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn with_path(mut self, path: Vec<String>) -> Self {
        self.path = path;
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Flattened text of the content (attachments excluded).
    pub fn text(&self) -> String {
        self.content.render()
    }

    /// Prompt size in characters: rendered content plus text attachments.
    pub fn char_len(&self) -> usize {
        self.content.render().chars().count()
            + self.attachments.iter().map(Attachment::char_len).sum::<usize>()
    }

    pub fn is_omitted(&self) -> bool {
        self.flags.omission == Some(Omission::Omitted)
    }

    pub fn is_pending_omission(&self) -> bool {
        self.flags.omission == Some(Omission::Pending)
    }

    /// Tool calls contained in this turn.
    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        match &self.content {
            Content::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    Part::ToolCall(call) => Some(call),
                    _ => None,
                })
                .collect(),
            Content::Text(_) => Vec::new(),
        }
    }

    /// Attach a cache marker to the last part that accepts one.
    ///
    /// Plain-text content is converted to a single text part first. Returns
    /// `false` (leaving the turn untouched) if no part accepts a marker.
    pub fn place_cache_marker(&mut self) -> bool {
        let parts = match &self.content {
            Content::Text(text) => vec![Part::text(text.clone())],
            Content::Parts(parts) => parts.clone(),
        };
        match parts.iter().rposition(Part::accepts_cache_marker) {
            Some(idx) => {
                self.content = Content::Parts(parts);
                self.cache_marker = Some(idx);
                true
            }
            None => false,
        }
    }
}
