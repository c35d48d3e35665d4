//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock / 脚本化）实现 LlmClient：给定完整历史与可用工具，返回一条 assistant 消息，
//! 其中可携带零个或多个 ToolCallRequest。RetryingLlmClient 为任意客户端加上指数退避重试。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::memory::Message;
use crate::tools::ToolSpec;

/// 模型调用错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("model request timed out")]
    Timeout,

    #[error("rate limited (retry after {retry_after_ms} ms)")]
    RateLimited { retry_after_ms: u64 },

    #[error("model service unavailable: {0}")]
    Unavailable(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("invalid model output: {0}")]
    InvalidOutput(String),

    #[error("model API error: {0}")]
    Api(String),
}

impl LlmError {
    /// 瞬时错误可重试；鉴权、非法请求、非法输出不重试
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Timeout | LlmError::RateLimited { .. } | LlmError::Unavailable(_) => true,
            LlmError::Auth(_) | LlmError::InvalidOutput(_) => false,
            LlmError::Api(msg) => {
                let lower = msg.to_lowercase();
                lower.contains("rate limit")
                    || lower.contains("resource has been exhausted")
                    || lower.contains("503")
                    || lower.contains("502")
                    || lower.contains("500")
            }
        }
    }

    /// 根据后端返回的错误文本归类
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("timed out") || lower.contains("timeout") {
            LlmError::Timeout
        } else if lower.contains("429") || lower.contains("rate limit") {
            LlmError::RateLimited { retry_after_ms: 0 }
        } else if lower.contains("401") || lower.contains("403") || lower.contains("api key") {
            LlmError::Auth(message)
        } else if lower.contains("503") || lower.contains("unavailable") {
            LlmError::Unavailable(message)
        } else {
            LlmError::Api(message)
        }
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, history: &[Message], tools: &[ToolSpec]) -> Result<Message, LlmError>;

    /// 累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 重试策略
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(20),
        }
    }
}

impl RetryConfig {
    /// 第 attempt 次重试前的等待：base * 2^attempt，封顶 max_delay；限流时至少等服务端给的时长
    fn delay_for(&self, attempt: u32, err: &LlmError) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        match err {
            LlmError::RateLimited { retry_after_ms } => exp.max(Duration::from_millis(*retry_after_ms)),
            _ => exp,
        }
    }
}

/// 带重试的客户端包装
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    config: RetryConfig,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn complete(&self, history: &[Message], tools: &[ToolSpec]) -> Result<Message, LlmError> {
        let mut attempt = 0;
        loop {
            match self.inner.complete(history, tools).await {
                Ok(msg) => return Ok(msg),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.config.delay_for(attempt, &e);
                    tracing::warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying model call"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.inner.token_usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures: AtomicU32,
        error: LlmError,
    }

    #[async_trait]
    impl LlmClient for Flaky {
        async fn complete(&self, _history: &[Message], _tools: &[ToolSpec]) -> Result<Message, LlmError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                Err(self.error.clone())
            } else {
                Ok(Message::assistant("ok"))
            }
        }
    }

    fn fast() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let inner = Arc::new(Flaky {
            failures: AtomicU32::new(2),
            error: LlmError::Unavailable("503".into()),
        });
        let client = RetryingLlmClient::new(inner, fast());
        assert_eq!(client.complete(&[], &[]).await.unwrap().content, "ok");
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let inner = Arc::new(Flaky {
            failures: AtomicU32::new(5),
            error: LlmError::Timeout,
        });
        let client = RetryingLlmClient::new(inner, fast());
        assert_eq!(client.complete(&[], &[]).await, Err(LlmError::Timeout));
    }

    #[tokio::test]
    async fn test_auth_errors_not_retried() {
        let inner = Arc::new(Flaky {
            failures: AtomicU32::new(1),
            error: LlmError::Auth("bad key".into()),
        });
        let client = RetryingLlmClient::new(inner.clone(), fast());
        assert!(matches!(client.complete(&[], &[]).await, Err(LlmError::Auth(_))));
        assert_eq!(inner.failures.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_classify() {
        assert_eq!(LlmError::classify("request timed out"), LlmError::Timeout);
        assert!(matches!(LlmError::classify("HTTP 429 Too Many Requests"), LlmError::RateLimited { .. }));
        assert!(matches!(LlmError::classify("401 Unauthorized"), LlmError::Auth(_)));
        assert!(LlmError::classify("HTTP 503 Service Unavailable").is_retryable());
    }
}
