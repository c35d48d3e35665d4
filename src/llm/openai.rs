//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）。工具以 JSON schema 列表写进 system 段，
//! 模型以纯文本回复或 JSON 动作回答，再由 parse_llm_output 解析为 assistant 消息。
//! tool 消息以 Observation 的形式回放给模型，assistant 的调用批次以 JSON 回放。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError};
use crate::memory::{Message, Role, ToolStatus};
use crate::react::parse_llm_output;
use crate::tools::ToolSpec;

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// 工具说明与动作格式，拼在 system prompt 之后
pub fn tools_section(tools: &[ToolSpec]) -> String {
    let schema = serde_json::to_string_pretty(tools).unwrap_or_else(|_| "[]".to_string());
    format!(
        "## Available tools\n{}\n\n## ACTION format\n\
        To act, reply with one JSON object: {{\"tool_calls\": [{{\"tool\": \"<name>\", \"args\": {{...}}}}]}}. \
        Several independent calls may be listed in one reply. To answer the user, reply with plain text and no JSON.",
        schema
    )
}

/// 把一条历史消息渲染为发给模型的文本
pub fn render_for_model(m: &Message) -> String {
    match m.role {
        Role::Tool => {
            let status = match m.status {
                Some(ToolStatus::Success) | None => "ok",
                Some(ToolStatus::Failed) => "failed",
                Some(ToolStatus::Rejected) => "REJECTED by operator",
                Some(ToolStatus::Interrupted) => "interrupted, outcome unknown",
            };
            format!(
                "Observation from {} [{}] ({}): {}",
                m.tool_name.as_deref().unwrap_or("tool"),
                m.call_id.as_deref().unwrap_or("-"),
                status,
                m.content
            )
        }
        Role::Assistant if m.has_tool_calls() => {
            let calls: Vec<serde_json::Value> = m
                .tool_calls
                .iter()
                .map(|c| serde_json::json!({"id": c.call_id, "tool": c.tool_name, "args": c.arguments}))
                .collect();
            let json = serde_json::json!({ "tool_calls": calls });
            if m.content.is_empty() {
                json.to_string()
            } else {
                format!("{}\n{}", m.content, json)
            }
        }
        _ => m.content.clone(),
    }
}

fn build_err<E: std::fmt::Display>(e: E) -> LlmError {
    LlmError::Api(e.to_string())
}

/// OpenAI 兼容客户端
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            usage: TokenUsage::new(),
        }
    }

    fn to_openai_messages(
        &self,
        history: &[Message],
        tools: &[ToolSpec],
    ) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        let mut out = Vec::with_capacity(history.len() + 1);
        if !tools.is_empty() {
            out.push(ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(tools_section(tools))
                    .build()
                    .map_err(build_err)?,
            ));
        }
        for m in history {
            let text = render_for_model(m);
            let msg = match m.role {
                Role::System => ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(text)
                        .build()
                        .map_err(build_err)?,
                ),
                // tool 结果以 user 身份回放：纯文本协议下模型只认 user / assistant
                Role::User | Role::Tool => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(text)
                        .build()
                        .map_err(build_err)?,
                ),
                Role::Assistant => ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(text)
                        .build()
                        .map_err(build_err)?,
                ),
            };
            out.push(msg);
        }
        Ok(out)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn complete(&self, history: &[Message], tools: &[ToolSpec]) -> Result<Message, LlmError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(self.to_openai_messages(history, tools)?)
            .build()
            .map_err(build_err)?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| LlmError::classify(e.to_string()))?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        Ok(parse_llm_output(&content)?.into_message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ToolCallRequest;

    #[test]
    fn test_render_rejection_is_marked() {
        let call = ToolCallRequest::new("c9", "merge_pull_request", serde_json::json!({}));
        let m = Message::tool_result(&call, ToolStatus::Rejected, "[REJECTED] not now");
        let text = render_for_model(&m);
        assert!(text.contains("REJECTED by operator"));
        assert!(text.contains("c9"));
    }

    #[test]
    fn test_rendered_calls_parse_back() {
        let call = ToolCallRequest::new("c1", "list_k8s_pods", serde_json::json!({"namespace": "prod"}));
        let m = Message::assistant_with_calls("Looking at pods.", vec![call.clone()]);
        let parsed = parse_llm_output(&render_for_model(&m)).unwrap().into_message();
        assert_eq!(parsed.tool_calls, vec![call]);
        assert_eq!(parsed.content, "Looking at pods.");
    }

    #[test]
    fn test_tools_section_lists_names() {
        let spec = ToolSpec {
            name: "echo".into(),
            description: "Echo".into(),
            parameters: serde_json::json!({"type": "object"}),
        };
        assert!(tools_section(&[spec]).contains("\"echo\""));
    }
}
