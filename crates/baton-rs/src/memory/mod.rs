//! Conversation state: turns, ordered logs, and the scope tree.

pub mod log;
mod persist;
pub mod scope;
pub mod turn;

pub use log::ConversationLog;
pub use scope::{ConversationScope, ScopeBuilder, Visibility};
pub use turn::{
    Attachment, AttachmentPayload, Content, Omission, Part, ToolCall, ToolResult, Turn, TurnFlags,
    TurnKind,
};
