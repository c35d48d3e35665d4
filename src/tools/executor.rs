//! 工具执行器
//!
//! 持有 ToolRegistry、单次调用超时与并发许可。execute_batch 并发派发一批调用，
//! 等待全部完成后按提出顺序返回 tool 消息（每个调用恰好一条，call_id 一致）。
//! 工具失败、超时、未知工具、重复 call_id 都记录为 Failed 结果，不影响同批其他调用。
//! 每次调用输出结构化审计日志（JSON）。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::memory::{Message, ToolCallRequest, ToolStatus};
use crate::tools::ToolRegistry;

/// 单个调用的失败原因；只作为 tool 消息内容，不会升级为编排错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolFailure {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Duplicate call_id '{0}' in batch; call skipped")]
    DuplicateCallId(String),

    #[error("Tool timed out after {0}s")]
    Timeout(u64),

    #[error("Tool execution failed: {0}")]
    Failed(String),
}

/// 工具执行器
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
    permits: Arc<Semaphore>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, timeout_secs: u64) -> Self {
        Self::with_parallelism(registry, timeout_secs, 4)
    }

    pub fn with_parallelism(registry: Arc<ToolRegistry>, timeout_secs: u64, max_parallel: usize) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
            permits: Arc::new(Semaphore::new(max_parallel.max(1))),
        }
    }

    /// 使用毫秒级超时（测试中模拟慢工具）
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// 执行一批调用；返回与输入一一对应、顺序相同的 tool 消息
    pub async fn execute_batch(&self, calls: &[ToolCallRequest]) -> Vec<Message> {
        let mut seen = HashSet::new();
        let futures = calls.iter().map(|call| {
            let duplicate = !seen.insert(call.call_id.clone());
            async move {
                if duplicate {
                    let failure = ToolFailure::DuplicateCallId(call.call_id.clone());
                    audit(call, "duplicate", Duration::ZERO);
                    return Message::tool_result(call, ToolStatus::Failed, format!("Error: {}", failure));
                }
                self.execute(call).await
            }
        });
        join_all(futures).await
    }

    /// 执行单个调用
    pub async fn execute(&self, call: &ToolCallRequest) -> Message {
        match self.run(call).await {
            Ok(content) => Message::tool_result(call, ToolStatus::Success, content),
            Err(failure) => {
                tracing::warn!(tool = %call.tool_name, call_id = %call.call_id, error = %failure, "tool call failed");
                Message::tool_result(call, ToolStatus::Failed, format!("Error: {}", failure))
            }
        }
    }

    async fn run(&self, call: &ToolCallRequest) -> Result<String, ToolFailure> {
        let Some(tool) = self.registry.get(&call.tool_name) else {
            audit(call, "unknown_tool", Duration::ZERO);
            return Err(ToolFailure::UnknownTool(call.tool_name.clone()));
        };

        // 信号量只在执行器内部使用，不会被关闭
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| ToolFailure::Failed(e.to_string()))?;

        let start = Instant::now();
        let result = timeout(self.timeout, tool.execute(call.arguments.clone())).await;
        let outcome = match &result {
            Ok(Ok(_)) => "ok",
            Ok(Err(_)) => "error",
            Err(_) => "timeout",
        };
        audit(call, outcome, start.elapsed());

        match result {
            Ok(Ok(content)) => Ok(content),
            Ok(Err(e)) => Err(ToolFailure::Failed(e)),
            Err(_) => Err(ToolFailure::Timeout(self.timeout.as_secs())),
        }
    }
}

fn audit(call: &ToolCallRequest, outcome: &str, elapsed: Duration) {
    let audit = serde_json::json!({
        "event": "tool_audit",
        "tool": call.tool_name,
        "call_id": call.call_id,
        "ok": outcome == "ok",
        "outcome": outcome,
        "duration_ms": elapsed.as_millis() as u64,
        "args_preview": args_preview(&call.arguments),
    });
    tracing::info!(audit = %audit, "tool");
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{EchoTool, Tool};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct Sleepy {
        name: &'static str,
        millis: u64,
    }

    #[async_trait]
    impl Tool for Sleepy {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "sleeps then answers with its name"
        }

        async fn execute(&self, _args: Value) -> Result<String, String> {
            tokio::time::sleep(Duration::from_millis(self.millis)).await;
            Ok(self.name.to_string())
        }
    }

    struct Broken;

    #[async_trait]
    impl Tool for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn description(&self) -> &str {
            "always fails"
        }

        async fn execute(&self, _args: Value) -> Result<String, String> {
            Err("connection refused".to_string())
        }
    }

    fn executor() -> ToolExecutor {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(Broken);
        registry.register(Sleepy { name: "slow", millis: 60 });
        registry.register(Sleepy { name: "fast", millis: 1 });
        ToolExecutor::new(Arc::new(registry), 5)
    }

    #[tokio::test]
    async fn test_results_keep_call_order() {
        let calls = vec![
            ToolCallRequest::new("1", "slow", json!({})),
            ToolCallRequest::new("2", "fast", json!({})),
            ToolCallRequest::new("3", "echo", json!({"text": "x"})),
        ];
        let results = executor().execute_batch(&calls).await;
        let ids: Vec<_> = results.iter().map(|m| m.call_id.clone().unwrap()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(results[0].content, "slow");
        assert_eq!(results[1].content, "fast");
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_batch() {
        let calls = vec![
            ToolCallRequest::new("a", "broken", json!({})),
            ToolCallRequest::new("b", "echo", json!({"text": "still here"})),
        ];
        let results = executor().execute_batch(&calls).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].status, Some(ToolStatus::Failed));
        assert!(results[0].content.contains("connection refused"));
        assert_eq!(results[1].status, Some(ToolStatus::Success));
        assert_eq!(results[1].content, "still here");
    }

    #[tokio::test]
    async fn test_unknown_tool_and_duplicate_id() {
        let calls = vec![
            ToolCallRequest::new("x", "echo", json!({"text": "one"})),
            ToolCallRequest::new("x", "echo", json!({"text": "two"})),
            ToolCallRequest::new("y", "nope", json!({})),
        ];
        let results = executor().execute_batch(&calls).await;
        assert_eq!(results[0].status, Some(ToolStatus::Success));
        assert_eq!(results[1].status, Some(ToolStatus::Failed));
        assert!(results[1].content.contains("Duplicate call_id"));
        assert_eq!(results[1].call_id.as_deref(), Some("x"));
        assert!(results[2].content.contains("Unknown tool: nope"));
    }

    #[tokio::test]
    async fn test_timeout_recorded_as_failure() {
        let exec = executor().with_timeout(Duration::from_millis(10));
        let results = exec
            .execute_batch(&[ToolCallRequest::new("t", "slow", json!({}))])
            .await;
        assert_eq!(results[0].status, Some(ToolStatus::Failed));
        assert!(results[0].content.contains("timed out"));
    }
}
