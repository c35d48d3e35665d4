//! 消息层：消息模型与只追加的对话记录

pub mod conversation;

pub use conversation::{Message, Role, ToolCallRequest, ToolStatus, Transcript};
