//! 审批闸门：人工/策略审批的边界
//!
//! 编排器在批次含高风险调用时持久化 pending_batch 后返回 PendingApproval，自身不阻塞；
//! 审批方拿到 ApprovalRequest 后产生唯一一个 ApprovalDecision，再通过 resolve_approval 恢复线程。
//! ApprovalGate 把任意 Approver 包装成带可选超时的驱动器，超时视为拒绝。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::PendingBatch;
use crate::memory::{Message, ToolCallRequest, ToolStatus};
use crate::tools::{RiskClassifier, RiskTier};

/// 拒绝消息的固定前缀，模型据此区分拒绝与真实工具结果
pub const REJECTED_PREFIX: &str = "[REJECTED]";

/// 审批决定；每个待审批批次只消费一次
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ApprovalDecision {
    pub fn approve() -> Self {
        Self {
            approved: true,
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: Some(reason.into()),
        }
    }
}

/// 展示给审批方的单个调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub risk: RiskTier,
}

/// 审批请求：线程、批次与整批调用（混合批次整体送审）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub thread_id: String,
    pub batch_id: String,
    pub pending_calls: Vec<PendingCall>,
}

impl ApprovalRequest {
    pub fn from_batch(thread_id: &str, batch: &PendingBatch, classifier: &RiskClassifier) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            batch_id: batch.batch_id.clone(),
            pending_calls: batch
                .calls
                .iter()
                .map(|c| PendingCall {
                    call_id: c.call_id.clone(),
                    tool_name: c.tool_name.clone(),
                    arguments: c.arguments.clone(),
                    risk: classifier.classify(&c.tool_name),
                })
                .collect(),
        }
    }

    pub fn high_risk_calls(&self) -> impl Iterator<Item = &PendingCall> {
        self.pending_calls.iter().filter(|c| c.risk == RiskTier::HighRisk)
    }
}

/// 审批方：人（CLI、聊天按钮）或自动策略
#[async_trait]
pub trait Approver: Send + Sync {
    async fn decide(&self, request: &ApprovalRequest) -> ApprovalDecision;
}

/// 固定决定的审批方（自动化策略 / 测试）
#[derive(Debug, Clone)]
pub struct StaticApprover {
    decision: ApprovalDecision,
}

impl StaticApprover {
    pub fn approve_all() -> Self {
        Self {
            decision: ApprovalDecision::approve(),
        }
    }

    pub fn reject_all(reason: impl Into<String>) -> Self {
        Self {
            decision: ApprovalDecision::reject(reason),
        }
    }
}

#[async_trait]
impl Approver for StaticApprover {
    async fn decide(&self, _request: &ApprovalRequest) -> ApprovalDecision {
        self.decision.clone()
    }
}

/// 审批驱动：调用 Approver，可选超时
#[derive(Clone)]
pub struct ApprovalGate {
    approver: Arc<dyn Approver>,
    timeout: Option<Duration>,
}

impl ApprovalGate {
    pub fn new(approver: Arc<dyn Approver>) -> Self {
        Self {
            approver,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn request_approval(&self, request: &ApprovalRequest) -> ApprovalDecision {
        let Some(limit) = self.timeout else {
            return self.approver.decide(request).await;
        };
        match tokio::time::timeout(limit, self.approver.decide(request)).await {
            Ok(decision) => decision,
            Err(_) => {
                tracing::warn!(
                    thread_id = %request.thread_id,
                    batch_id = %request.batch_id,
                    timeout_secs = limit.as_secs(),
                    "approval timed out, treating as rejection"
                );
                ApprovalDecision::reject("approval timed out")
            }
        }
    }
}

/// 为被拒绝的调用合成 tool 消息
pub fn rejection_message(call: &ToolCallRequest, reason: Option<&str>) -> Message {
    let content = match reason.map(str::trim).filter(|r| !r.is_empty()) {
        Some(r) => format!(
            "{} The operator rejected {}; the action was NOT executed. Reason: {}",
            REJECTED_PREFIX, call.tool_name, r
        ),
        None => format!(
            "{} The operator rejected {}; the action was NOT executed.",
            REJECTED_PREFIX, call.tool_name
        ),
    };
    Message::tool_result(call, ToolStatus::Rejected, content)
}
