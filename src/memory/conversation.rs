//! 对话记录：消息模型与只追加的消息序列
//!
//! Message 覆盖 user / assistant / tool / system 四种角色；assistant 消息可携带一批 ToolCallRequest，
//! tool 消息通过 call_id 回指其请求。Transcript 只允许追加，已追加的消息不再修改或重排。

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

/// 模型提出的一次工具调用
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl ToolCallRequest {
    pub fn new(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            arguments,
        }
    }
}

/// tool 消息的结果类别：下游推理据此区分真实结果、失败、拒绝与中断
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Failed,
    /// 审批被拒，调用从未执行
    Rejected,
    /// 进程在执行中途退出，结果未知；不会重放
    Interrupted,
}

impl ToolStatus {
    pub fn is_success(self) -> bool {
        matches!(self, ToolStatus::Success)
    }
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    /// 仅 assistant 消息携带
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    /// 仅 tool 消息携带：回指 ToolCallRequest.call_id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ToolStatus>,
}

impl Message {
    fn plain(role: Role, content: String) -> Self {
        Self {
            role,
            content,
            tool_calls: Vec::new(),
            call_id: None,
            tool_name: None,
            status: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content.into())
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content.into())
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content.into())
    }

    /// 携带工具调用批次的 assistant 消息
    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<ToolCallRequest>) -> Self {
        let mut msg = Self::plain(Role::Assistant, content.into());
        msg.tool_calls = calls;
        msg
    }

    /// 回应某个调用的 tool 消息
    pub fn tool_result(call: &ToolCallRequest, status: ToolStatus, content: impl Into<String>) -> Self {
        let mut msg = Self::plain(Role::Tool, content.into());
        msg.call_id = Some(call.call_id.clone());
        msg.tool_name = Some(call.tool_name.clone());
        msg.status = Some(status);
        msg
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// 只追加的消息序列
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
    }

    pub fn extend(&mut self, msgs: impl IntoIterator<Item = Message>) {
        self.messages.extend(msgs);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// 尚未得到 tool 消息回应的调用（按提出顺序）
    pub fn unanswered_calls(&self) -> Vec<&ToolCallRequest> {
        let answered: std::collections::HashSet<&str> = self
            .messages
            .iter()
            .filter_map(|m| m.call_id.as_deref())
            .collect();
        self.messages
            .iter()
            .flat_map(|m| m.tool_calls.iter())
            .filter(|c| !answered.contains(c.call_id.as_str()))
            .collect()
    }
}

impl From<Vec<Message>> for Transcript {
    fn from(messages: Vec<Message>) -> Self {
        Self { messages }
    }
}
