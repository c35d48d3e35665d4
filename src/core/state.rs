//! 会话状态：阶段与待处理批次
//!
//! SessionState 可完整序列化进检查点；挂起点被显式表示为 phase + pending_batch，
//! 恢复就是带着 ApprovalDecision 的一次普通函数调用。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::memory::{Message, ToolCallRequest, Transcript};

/// 编排状态机的阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Reasoning,
    AwaitingApproval,
    ExecutingTools,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Reasoning => "REASONING",
            Phase::AwaitingApproval => "AWAITING_APPROVAL",
            Phase::ExecutingTools => "EXECUTING_TOOLS",
            Phase::Done => "DONE",
        };
        f.write_str(s)
    }
}

/// 一次推理产生、尚未得到结果的调用批次
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingBatch {
    pub batch_id: String,
    pub calls: Vec<ToolCallRequest>,
    pub created_at: DateTime<Utc>,
}

impl PendingBatch {
    pub fn new(calls: Vec<ToolCallRequest>) -> Self {
        Self {
            batch_id: uuid::Uuid::new_v4().to_string(),
            calls,
            created_at: Utc::now(),
        }
    }
}

/// 单个线程的完整会话状态
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub thread_id: String,
    pub messages: Transcript,
    pub phase: Phase,
    /// AwaitingApproval / ExecutingTools 时必有
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_batch: Option<PendingBatch>,
}

impl SessionState {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            messages: Transcript::new(),
            phase: Phase::Reasoning,
            pending_batch: None,
        }
    }

    pub fn messages(&self) -> &[Message] {
        self.messages.messages()
    }

    /// phase 与 pending_batch 是否一致；不一致的状态不允许持久化
    pub fn is_consistent(&self) -> bool {
        match self.phase {
            Phase::AwaitingApproval | Phase::ExecutingTools => self
                .pending_batch
                .as_ref()
                .map(|b| !b.calls.is_empty())
                .unwrap_or(false),
            Phase::Reasoning | Phase::Done => self.pending_batch.is_none(),
        }
    }

    /// 最后一条 assistant 消息（DONE 时即最终回复）
    pub fn last_assistant(&self) -> Option<&Message> {
        self.messages()
            .iter()
            .rev()
            .find(|m| m.role == crate::memory::Role::Assistant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_consistency_rules() {
        let mut s = SessionState::new("t");
        assert!(s.is_consistent());
        s.phase = Phase::AwaitingApproval;
        assert!(!s.is_consistent());
        s.pending_batch = Some(PendingBatch::new(vec![ToolCallRequest::new(
            "1",
            "merge_pull_request",
            json!({}),
        )]));
        assert!(s.is_consistent());
        s.phase = Phase::Done;
        assert!(!s.is_consistent());
    }

    #[test]
    fn test_phase_wire_names() {
        assert_eq!(
            serde_json::to_value(Phase::AwaitingApproval).unwrap(),
            json!("AWAITING_APPROVAL")
        );
        assert_eq!(Phase::ExecutingTools.to_string(), "EXECUTING_TOOLS");
    }
}
