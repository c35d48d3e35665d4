//! 工具注册表
//!
//! 所有能力提供方实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry 按名注册与查找。
//! 同步实现可实现 BlockingTool，注册时包一层适配器，在阻塞线程池中执行。
//! 注册表在启动时构建一次，之后以 Arc 注入 Orchestrator 与 ToolExecutor。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（与 ToolCallRequest.tool_name 对应）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 执行工具；Err 为失败描述，会作为 tool 消息内容交回模型
    async fn execute(&self, args: Value) -> Result<String, String>;
}

/// 同步调用约定：实现方在当前线程阻塞执行
pub trait BlockingTool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    fn execute_blocking(&self, args: Value) -> Result<String, String>;
}

/// 把 BlockingTool 适配为 Tool：执行放到 spawn_blocking
struct BlockingAdapter<T> {
    inner: Arc<T>,
}

#[async_trait]
impl<T: BlockingTool + 'static> Tool for BlockingAdapter<T> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    fn parameters_schema(&self) -> Value {
        self.inner.parameters_schema()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.execute_blocking(args))
            .await
            .map_err(|e| format!("Blocking tool panicked or was cancelled: {}", e))?
    }
}

/// 提供给模型的工具描述
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册工具；同名工具会被替换并记录警告
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "tool registered twice, keeping the latest");
        }
    }

    pub fn register_blocking(&mut self, tool: impl BlockingTool + 'static) {
        self.register_arc(Arc::new(BlockingAdapter {
            inner: Arc::new(tool),
        }));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 按名称排序的工具描述，顺序稳定以便 prompt 可复现
    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .values()
            .map(|tool| ToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::EchoTool;

    struct Upper;

    impl BlockingTool for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        fn description(&self) -> &str {
            "Uppercase the text argument"
        }

        fn execute_blocking(&self, args: Value) -> Result<String, String> {
            args.get("text")
                .and_then(|v| v.as_str())
                .map(|s| s.to_uppercase())
                .ok_or_else(|| "missing text".to_string())
        }
    }

    #[tokio::test]
    async fn test_blocking_tool_runs_through_adapter() {
        let mut registry = ToolRegistry::new();
        registry.register_blocking(Upper);
        let tool = registry.get("upper").unwrap();
        let out = tool.execute(serde_json::json!({"text": "pods"})).await;
        assert_eq!(out, Ok("PODS".to_string()));
        let err = tool.execute(serde_json::json!({})).await;
        assert!(err.is_err());
    }

    #[test]
    fn test_specs_sorted_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register_blocking(Upper);
        registry.register(EchoTool);
        let names: Vec<String> = registry.specs().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["echo".to_string(), "upper".to_string()]);
    }
}
