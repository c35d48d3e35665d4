//! Echo 工具（诊断用，standard 级别）

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::Tool;

#[derive(Debug, Deserialize, JsonSchema)]
struct EchoArgs {
    /// 要回显的文本
    text: String,
}

/// Echo 工具：回显文本
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back unchanged. Useful to check that tool dispatch works."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::to_value(schemars::schema_for!(EchoArgs)).unwrap_or_default()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: EchoArgs =
            serde_json::from_value(args).map_err(|e| format!("Invalid arguments: {}", e))?;
        Ok(args.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_requires_text() {
        assert_eq!(
            EchoTool.execute(serde_json::json!({"text": "hi"})).await,
            Ok("hi".to_string())
        );
        assert!(EchoTool.execute(serde_json::json!({})).await.is_err());
    }

    #[test]
    fn test_echo_schema_lists_text() {
        let schema = EchoTool.parameters_schema();
        assert!(schema["properties"].get("text").is_some());
    }
}
