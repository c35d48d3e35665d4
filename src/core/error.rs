//! 编排错误
//!
//! 只有让当前轮次无法推进的情况才是 AgentError；工具失败是数据，写进 tool 消息。
//! 致命错误都带 thread_id 与 phase，便于人工定位并恢复。

use thiserror::Error;

use crate::checkpoint::StoreError;
use crate::core::Phase;
use crate::llm::LlmError;

#[derive(Error, Debug)]
pub enum AgentError {
    /// 模型不可达、输出非法、配额/鉴权错误；轮次未推进，可重新提交
    #[error("model failure in thread '{thread_id}' during {phase}: {source}")]
    Model {
        thread_id: String,
        phase: Phase,
        #[source]
        source: LlmError,
    },

    /// 检查点写入/读取失败；对应的阶段转换不算完成
    #[error("checkpoint failure in thread '{thread_id}' during {phase}: {source}")]
    Checkpoint {
        thread_id: String,
        phase: Phase,
        #[source]
        source: StoreError,
    },

    #[error("thread '{0}' not found")]
    ThreadNotFound(String),

    /// 线程当前没有待审批批次（已被处理或从未挂起）
    #[error("no pending approval in thread '{thread_id}' (phase {phase})")]
    NoPendingApproval { thread_id: String, phase: Phase },

    /// 决策针对的批次不是当前待审批批次
    #[error("approval for batch '{got}' is stale; thread '{thread_id}' is waiting on '{expected}'")]
    StaleApproval {
        thread_id: String,
        expected: String,
        got: String,
    },

    /// 线程正挂起等待审批，不能接受新的用户输入
    #[error("thread '{thread_id}' is awaiting approval of batch '{batch_id}'")]
    ApprovalPending { thread_id: String, batch_id: String },

    #[error("turn cancelled in thread '{thread_id}' during {phase}")]
    Cancelled { thread_id: String, phase: Phase },

    #[error("thread '{thread_id}' exceeded {max_steps} reasoning steps in one turn")]
    StepLimitExceeded { thread_id: String, max_steps: usize },

    #[error("Config error: {0}")]
    ConfigError(String),
}

impl AgentError {
    /// 协议违规类错误：调用方用法不对，状态未被修改
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            AgentError::NoPendingApproval { .. }
                | AgentError::StaleApproval { .. }
                | AgentError::ApprovalPending { .. }
        )
    }
}
