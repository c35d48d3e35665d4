//! 编排器：推理 / 审批 / 执行 状态机
//!
//! 每个线程是一个顺序过程：REASONING → (DONE | EXECUTING_TOOLS | AWAITING_APPROVAL) → ...
//! 所有转换都在 SessionState 的副本上完成，检查点写入成功后才生效；写入失败时内存状态回到上一个已持久化版本。
//! AWAITING_APPROVAL 是唯一的无限期等待点：状态落盘后操作直接返回 PendingApproval，不持有任何锁。
//!
//! 至多一次：EXECUTING_TOOLS 检查点在执行前写入。若之后某个操作读到的仍是 EXECUTING_TOOLS，
//! 说明进程在执行中途退出，该批次不会被重跑，而是逐个记为 interrupted 并回到 REASONING。

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{CheckpointStore, StoreError};
use crate::core::approval::rejection_message;
use crate::core::events::preview;
use crate::core::{
    AgentError, AgentEvent, ApprovalDecision, ApprovalGate, ApprovalRequest, PendingBatch, Phase,
    SessionState, SessionSupervisor,
};
use crate::memory::{Message, ToolStatus};
use crate::react::Planner;
use crate::tools::{RiskClassifier, ToolExecutor};

/// 单轮默认最多推理步数
pub const DEFAULT_MAX_STEPS: usize = 20;

const OBSERVATION_PREVIEW_CHARS: usize = 200;

/// 一次操作的结果：终止回复，或挂起等待审批
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed(Message),
    PendingApproval(ApprovalRequest),
}

impl TurnOutcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, TurnOutcome::PendingApproval(_))
    }
}

/// 状态机编排器；可在多个线程（thread_id）间并发使用
pub struct Orchestrator {
    planner: Planner,
    executor: ToolExecutor,
    classifier: Arc<RiskClassifier>,
    store: Arc<dyn CheckpointStore>,
    supervisor: SessionSupervisor,
    max_steps: usize,
    event_tx: Option<mpsc::UnboundedSender<AgentEvent>>,
}

impl Orchestrator {
    pub fn new(
        planner: Planner,
        executor: ToolExecutor,
        classifier: Arc<RiskClassifier>,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            planner,
            executor,
            classifier,
            store,
            supervisor: SessionSupervisor::new(),
            max_steps: DEFAULT_MAX_STEPS,
            event_tx: None,
        }
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<AgentEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn classifier(&self) -> &RiskClassifier {
        &self.classifier
    }

    pub fn checkpoint_store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// 会话入口：提交用户消息，返回终止回复或待审批通知
    pub async fn submit_user_message(
        &self,
        thread_id: &str,
        text: &str,
    ) -> Result<TurnOutcome, AgentError> {
        let outcome = self.submit_locked(thread_id, text).await;
        self.supervisor.release(thread_id).await;
        outcome
    }

    async fn submit_locked(&self, thread_id: &str, text: &str) -> Result<TurnOutcome, AgentError> {
        let _guard = self.supervisor.lock(thread_id).await;
        let token = self.supervisor.new_cancel_token(thread_id).await;

        let mut state = self.load_or_new(thread_id).await?;
        match state.phase {
            Phase::AwaitingApproval => {
                let batch_id = state
                    .pending_batch
                    .as_ref()
                    .map(|b| b.batch_id.clone())
                    .unwrap_or_default();
                return Err(AgentError::ApprovalPending {
                    thread_id: thread_id.to_string(),
                    batch_id,
                });
            }
            Phase::ExecutingTools => state = self.recover_interrupted(state).await?,
            Phase::Reasoning | Phase::Done => {}
        }

        tracing::info!(thread_id, "user message received");
        self.drive(state, Some(Message::user(text)), &token).await
    }

    /// 对当前待审批批次给出决定；恰好消费一次
    pub async fn resolve_approval(
        &self,
        thread_id: &str,
        batch_id: &str,
        decision: ApprovalDecision,
    ) -> Result<TurnOutcome, AgentError> {
        let outcome = self.resolve_locked(thread_id, batch_id, decision).await;
        self.supervisor.release(thread_id).await;
        outcome
    }

    async fn resolve_locked(
        &self,
        thread_id: &str,
        batch_id: &str,
        decision: ApprovalDecision,
    ) -> Result<TurnOutcome, AgentError> {
        let _guard = self.supervisor.lock(thread_id).await;
        let token = self.supervisor.new_cancel_token(thread_id).await;

        let state = self.load_existing(thread_id).await?;
        let batch = match (&state.phase, &state.pending_batch) {
            (Phase::AwaitingApproval, Some(batch)) => batch.clone(),
            _ => {
                return Err(AgentError::NoPendingApproval {
                    thread_id: thread_id.to_string(),
                    phase: state.phase,
                })
            }
        };
        if batch.batch_id != batch_id {
            return Err(AgentError::StaleApproval {
                thread_id: thread_id.to_string(),
                expected: batch.batch_id,
                got: batch_id.to_string(),
            });
        }

        self.emit(AgentEvent::ApprovalResolved {
            thread_id: thread_id.to_string(),
            batch_id: batch_id.to_string(),
            approved: decision.approved,
            reason: decision.reason.clone(),
        });

        let mut next = state.clone();
        if decision.approved {
            tracing::info!(thread_id, batch_id, calls = batch.calls.len(), "batch approved");
            next.phase = Phase::ExecutingTools;
        } else {
            tracing::warn!(
                thread_id,
                batch_id,
                calls = batch.calls.len(),
                reason = decision.reason.as_deref().unwrap_or(""),
                "batch rejected"
            );
            next.messages.extend(
                batch
                    .calls
                    .iter()
                    .map(|c| rejection_message(c, decision.reason.as_deref())),
            );
            next.pending_batch = None;
            next.phase = Phase::Reasoning;
        }
        let next = self.commit(next).await?;
        self.drive(next, None, &token).await
    }

    /// 推进一个停在 REASONING（上次模型失败）或 EXECUTING_TOOLS（进程中断）的线程；
    /// 停在 AWAITING_APPROVAL 时重新给出同一批次，DONE 时返回最后的回复
    pub async fn continue_turn(&self, thread_id: &str) -> Result<TurnOutcome, AgentError> {
        let outcome = self.continue_locked(thread_id).await;
        self.supervisor.release(thread_id).await;
        outcome
    }

    async fn continue_locked(&self, thread_id: &str) -> Result<TurnOutcome, AgentError> {
        let _guard = self.supervisor.lock(thread_id).await;
        let token = self.supervisor.new_cancel_token(thread_id).await;

        let mut state = self.load_existing(thread_id).await?;
        if state.phase == Phase::ExecutingTools {
            state = self.recover_interrupted(state).await?;
        }
        self.drive(state, None, &token).await
    }

    /// 当前待审批请求（若有）；崩溃重启后据此重新展示同一批次
    pub async fn pending_approval(&self, thread_id: &str) -> Result<Option<ApprovalRequest>, AgentError> {
        let state = self.load_existing(thread_id).await?;
        Ok(match (&state.phase, &state.pending_batch) {
            (Phase::AwaitingApproval, Some(batch)) => Some(self.approval_request(thread_id, batch)),
            _ => None,
        })
    }

    /// 最新已持久化的会话状态
    pub async fn state(&self, thread_id: &str) -> Result<SessionState, AgentError> {
        self.load_existing(thread_id).await
    }

    pub async fn list_threads(&self) -> Result<Vec<String>, AgentError> {
        self.store
            .list_threads()
            .await
            .map_err(|source| AgentError::Checkpoint {
                thread_id: String::new(),
                phase: Phase::Reasoning,
                source,
            })
    }

    /// 取消线程在途的推理；最后一个检查点保持有效
    pub async fn cancel(&self, thread_id: &str) -> bool {
        self.supervisor.cancel(thread_id).await
    }

    /// 提交并用审批闸门循环处理挂起，直到得到终止回复
    pub async fn run_turn(
        &self,
        thread_id: &str,
        text: &str,
        gate: &ApprovalGate,
    ) -> Result<Message, AgentError> {
        let outcome = self.submit_user_message(thread_id, text).await?;
        self.settle(thread_id, outcome, gate).await
    }

    /// 用审批闸门处理挂起，直到线程给出终止回复
    pub async fn settle(
        &self,
        thread_id: &str,
        mut outcome: TurnOutcome,
        gate: &ApprovalGate,
    ) -> Result<Message, AgentError> {
        loop {
            match outcome {
                TurnOutcome::Completed(reply) => return Ok(reply),
                TurnOutcome::PendingApproval(request) => {
                    let decision = gate.request_approval(&request).await;
                    outcome = self
                        .resolve_approval(thread_id, &request.batch_id, decision)
                        .await?;
                }
            }
        }
    }

    /// 主循环：从给定状态推进到 DONE 或 AWAITING_APPROVAL
    async fn drive(
        &self,
        mut state: SessionState,
        mut user: Option<Message>,
        token: &CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        let mut steps = 0usize;
        loop {
            match state.phase {
                Phase::AwaitingApproval => {
                    let Some(batch) = state.pending_batch.as_ref() else {
                        return Err(self.inconsistent(&state));
                    };
                    let request = self.approval_request(&state.thread_id, batch);
                    tracing::info!(
                        thread_id = %state.thread_id,
                        batch_id = %request.batch_id,
                        calls = request.pending_calls.len(),
                        "awaiting approval"
                    );
                    self.emit(AgentEvent::ApprovalRequested {
                        request: request.clone(),
                    });
                    return Ok(TurnOutcome::PendingApproval(request));
                }
                Phase::ExecutingTools => {
                    state = self.execute_pending(state).await?;
                }
                Phase::Done if user.is_none() => {
                    let reply = state
                        .last_assistant()
                        .cloned()
                        .unwrap_or_else(|| Message::assistant(""));
                    return Ok(TurnOutcome::Completed(reply));
                }
                Phase::Reasoning | Phase::Done => {
                    if steps >= self.max_steps {
                        tracing::warn!(thread_id = %state.thread_id, max_steps = self.max_steps, "step limit reached");
                        return Err(AgentError::StepLimitExceeded {
                            thread_id: state.thread_id.clone(),
                            max_steps: self.max_steps,
                        });
                    }
                    steps += 1;
                    state = self.reason(state, user.take(), token, steps).await?;
                }
            }
        }
    }

    /// 一次推理；用户消息与推理结果一起持久化，模型失败时轮次不推进
    async fn reason(
        &self,
        state: SessionState,
        user: Option<Message>,
        token: &CancellationToken,
        step: usize,
    ) -> Result<SessionState, AgentError> {
        let thread_id = state.thread_id.clone();
        let mut next = state;
        if let Some(msg) = user {
            next.messages.push(msg);
        }
        next.phase = Phase::Reasoning;

        self.emit(AgentEvent::Thinking {
            thread_id: thread_id.clone(),
            step,
        });
        let specs = self.executor.registry().specs();
        let reply = tokio::select! {
            biased;
            _ = token.cancelled() => {
                tracing::info!(thread_id = %thread_id, "turn cancelled during reasoning");
                return Err(AgentError::Cancelled { thread_id, phase: Phase::Reasoning });
            }
            result = self.planner.plan(next.messages(), &specs) => result,
        };
        let reply = match reply {
            Ok(reply) => reply,
            Err(source) => {
                tracing::error!(thread_id = %thread_id, error = %source, "reasoning step failed");
                self.emit(AgentEvent::Error {
                    thread_id: thread_id.clone(),
                    text: source.to_string(),
                });
                return Err(AgentError::Model {
                    thread_id,
                    phase: Phase::Reasoning,
                    source,
                });
            }
        };

        if reply.has_tool_calls() {
            let calls = reply.tool_calls.clone();
            let gated = self.classifier.requires_approval(&calls);
            next.messages.push(reply);
            next.pending_batch = Some(PendingBatch::new(calls));
            next.phase = if gated {
                Phase::AwaitingApproval
            } else {
                Phase::ExecutingTools
            };
        } else {
            self.emit(AgentEvent::Response {
                thread_id: thread_id.clone(),
                text: reply.content.clone(),
            });
            next.messages.push(reply);
            next.phase = Phase::Done;
        }
        self.commit(next).await
    }

    /// 执行已放行的批次：结果按调用顺序追加，然后回到 REASONING
    async fn execute_pending(&self, state: SessionState) -> Result<SessionState, AgentError> {
        let Some(batch) = state.pending_batch.clone() else {
            return Err(self.inconsistent(&state));
        };
        let thread_id = state.thread_id.clone();

        for call in &batch.calls {
            self.emit(AgentEvent::ToolCall {
                thread_id: thread_id.clone(),
                call_id: call.call_id.clone(),
                tool: call.tool_name.clone(),
                args: call.arguments.clone(),
            });
        }
        let results = self.executor.execute_batch(&batch.calls).await;
        for result in &results {
            let call_id = result.call_id.clone().unwrap_or_default();
            let tool = result.tool_name.clone().unwrap_or_default();
            if result.status.map(ToolStatus::is_success).unwrap_or(false) {
                self.emit(AgentEvent::Observation {
                    thread_id: thread_id.clone(),
                    call_id,
                    tool,
                    preview: preview(&result.content, OBSERVATION_PREVIEW_CHARS),
                });
            } else {
                self.emit(AgentEvent::ToolFailure {
                    thread_id: thread_id.clone(),
                    call_id,
                    tool,
                    reason: result.content.clone(),
                });
            }
        }

        let mut next = state;
        next.messages.extend(results);
        next.pending_batch = None;
        next.phase = Phase::Reasoning;
        self.commit(next).await
    }

    /// 读到 EXECUTING_TOOLS：上一个进程在执行中途退出，批次内每个调用都记为 interrupted。
    /// 执行结果与离开 EXECUTING_TOOLS 在同一次提交里落盘，所以批次中不会有已应答的调用；
    /// 历史里同名 call_id 属于更早的批次，不能算作应答
    async fn recover_interrupted(&self, state: SessionState) -> Result<SessionState, AgentError> {
        let mut next = state;
        if let Some(batch) = next.pending_batch.take() {
            tracing::warn!(
                thread_id = %next.thread_id,
                batch_id = %batch.batch_id,
                calls = batch.calls.len(),
                "found interrupted tool execution, not re-running"
            );
            let interrupted: Vec<Message> = batch
                .calls
                .iter()
                .map(|c| {
                    Message::tool_result(
                        c,
                        ToolStatus::Interrupted,
                        format!(
                            "Error: execution of {} was interrupted; outcome unknown. Verify the current state before retrying.",
                            c.tool_name
                        ),
                    )
                })
                .collect();
            next.messages.extend(interrupted);
        }
        next.phase = Phase::Reasoning;
        self.commit(next).await
    }

    /// 持久化一次转换；失败时调用方持有的旧状态即最后一个有效版本
    async fn commit(&self, next: SessionState) -> Result<SessionState, AgentError> {
        let checkpoint = self
            .store
            .save(&next.thread_id, &next)
            .await
            .map_err(|source| {
                tracing::error!(thread_id = %next.thread_id, phase = %next.phase, error = %source, "checkpoint save failed");
                AgentError::Checkpoint {
                    thread_id: next.thread_id.clone(),
                    phase: next.phase,
                    source,
                }
            })?;
        tracing::info!(
            thread_id = %next.thread_id,
            phase = %next.phase,
            seq = checkpoint.seq,
            messages = next.messages.len(),
            "phase transition"
        );
        self.emit(AgentEvent::PhaseChanged {
            thread_id: next.thread_id.clone(),
            phase: next.phase,
        });
        Ok(next)
    }

    async fn load_or_new(&self, thread_id: &str) -> Result<SessionState, AgentError> {
        match self.store.load(thread_id).await {
            Ok(state) => Ok(state),
            Err(StoreError::NotFound(_)) => Ok(SessionState::new(thread_id)),
            Err(source) => Err(AgentError::Checkpoint {
                thread_id: thread_id.to_string(),
                phase: Phase::Reasoning,
                source,
            }),
        }
    }

    async fn load_existing(&self, thread_id: &str) -> Result<SessionState, AgentError> {
        match self.store.load(thread_id).await {
            Ok(state) => Ok(state),
            Err(StoreError::NotFound(_)) => Err(AgentError::ThreadNotFound(thread_id.to_string())),
            Err(source) => Err(AgentError::Checkpoint {
                thread_id: thread_id.to_string(),
                phase: Phase::Reasoning,
                source,
            }),
        }
    }

    fn approval_request(&self, thread_id: &str, batch: &PendingBatch) -> ApprovalRequest {
        ApprovalRequest::from_batch(thread_id, batch, &self.classifier)
    }

    fn inconsistent(&self, state: &SessionState) -> AgentError {
        AgentError::Checkpoint {
            thread_id: state.thread_id.clone(),
            phase: state.phase,
            source: StoreError::Invalid {
                thread_id: state.thread_id.clone(),
                reason: format!("phase {} without a pending batch", state.phase),
            },
        }
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }
}
