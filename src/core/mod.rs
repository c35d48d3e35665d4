//! 核心编排层：会话状态、错误、审批闸门、会话监管、事件、主状态机与构建

pub mod approval;
pub mod builder;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod session_supervisor;
pub mod state;

pub use approval::{
    rejection_message, ApprovalDecision, ApprovalGate, ApprovalRequest, Approver, PendingCall,
    StaticApprover, REJECTED_PREFIX,
};
pub use builder::{create_llm_from_config, create_orchestrator, OrchestratorBuilder};
pub use error::AgentError;
pub use events::AgentEvent;
pub use orchestrator::{Orchestrator, TurnOutcome, DEFAULT_MAX_STEPS};
pub use session_supervisor::SessionSupervisor;
pub use state::{PendingBatch, Phase, SessionState};
