//! 编排过程事件：供 CLI / 前端展示阶段切换、工具调用、审批与回复

use serde::Serialize;

use crate::core::{ApprovalRequest, Phase};

/// 单步过程事件（可序列化为 JSON）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// 阶段切换（已持久化）
    PhaseChanged { thread_id: String, phase: Phase },
    /// 正在调用模型
    Thinking { thread_id: String, step: usize },
    /// 即将执行的工具调用
    ToolCall {
        thread_id: String,
        call_id: String,
        tool: String,
        args: serde_json::Value,
    },
    /// 工具返回（预览）
    Observation {
        thread_id: String,
        call_id: String,
        tool: String,
        preview: String,
    },
    /// 工具执行失败
    ToolFailure {
        thread_id: String,
        call_id: String,
        tool: String,
        reason: String,
    },
    /// 线程挂起等待审批
    ApprovalRequested { request: ApprovalRequest },
    /// 审批已处理
    ApprovalResolved {
        thread_id: String,
        batch_id: String,
        approved: bool,
        reason: Option<String>,
    },
    /// 最终回复
    Response { thread_id: String, text: String },
    /// 致命错误
    Error { thread_id: String, text: String },
}

/// 截取预览文本（按字符）
pub(crate) fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let head: String = text.chars().take(max_chars).collect();
        format!("{}...", head)
    }
}
