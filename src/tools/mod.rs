//! 工具层：能力提供方抽象、注册表、风险分级与执行器

pub mod echo;
pub mod executor;
pub mod registry;
pub mod risk;
pub mod shell;

pub use echo::EchoTool;
pub use executor::{ToolExecutor, ToolFailure};
pub use registry::{BlockingTool, Tool, ToolRegistry, ToolSpec};
pub use risk::{RiskClassifier, RiskTier, DEFAULT_HIGH_RISK_TOOLS};
pub use shell::ShellTool;
