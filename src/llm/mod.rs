//! LLM 层：模型接口抽象与实现（OpenAI 兼容 / Mock / 脚本化）与重试包装

pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::{MockLlmClient, ScriptedLlmClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{LlmClient, LlmError, RetryConfig, RetryingLlmClient};
