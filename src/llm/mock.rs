//! Mock / 脚本化 LLM 客户端（无需 API）
//!
//! MockLlmClient：对用户消息提出一次 echo 调用，拿到工具结果后给出最终回复，便于本地跑通完整流程。
//! ScriptedLlmClient：按顺序返回预置回复，并记录每次收到的历史，供测试断言。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError};
use crate::memory::{Message, Role, ToolCallRequest};
use crate::react::planner::new_call_id;
use crate::tools::ToolSpec;

/// Mock 客户端
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, history: &[Message], _tools: &[ToolSpec]) -> Result<Message, LlmError> {
        let last = history.iter().rev().find(|m| m.role != Role::System);
        match last {
            Some(m) if m.role == Role::User => Ok(Message::assistant_with_calls(
                "Echoing your request through the tool pipeline.",
                vec![ToolCallRequest::new(
                    new_call_id(),
                    "echo",
                    serde_json::json!({ "text": format!("Echo from Mock: {}", m.content) }),
                )],
            )),
            Some(m) if m.role == Role::Tool => Ok(Message::assistant(format!(
                "Tool {} answered: {}",
                m.tool_name.as_deref().unwrap_or("?"),
                m.content
            ))),
            _ => Ok(Message::assistant("(no input)")),
        }
    }
}

/// 脚本化客户端
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    replies: Mutex<VecDeque<Result<Message, LlmError>>>,
    histories: Mutex<Vec<Vec<Message>>>,
    delay: Option<Duration>,
}

impl ScriptedLlmClient {
    pub fn new(replies: Vec<Message>) -> Self {
        Self::from_results(replies.into_iter().map(Ok).collect())
    }

    pub fn from_results(replies: Vec<Result<Message, LlmError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            histories: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// 每次调用前先等待（模拟慢模型）
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push(&self, reply: Result<Message, LlmError>) {
        if let Ok(mut q) = self.replies.lock() {
            q.push_back(reply);
        }
    }

    /// 每次调用收到的历史（含 system prompt）
    pub fn histories(&self) -> Vec<Vec<Message>> {
        self.histories.lock().map(|h| h.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.histories.lock().map(|h| h.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, history: &[Message], _tools: &[ToolSpec]) -> Result<Message, LlmError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Ok(mut h) = self.histories.lock() {
            h.push(history.to_vec());
        }
        self.replies
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or_else(|| Err(LlmError::Api("script exhausted".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ToolStatus;

    #[tokio::test]
    async fn test_mock_proposes_echo_then_answers() {
        let mock = MockLlmClient;
        let first = mock.complete(&[Message::user("ping")], &[]).await.unwrap();
        assert_eq!(first.tool_calls.len(), 1);
        assert_eq!(first.tool_calls[0].tool_name, "echo");

        let result = Message::tool_result(&first.tool_calls[0], ToolStatus::Success, "pong");
        let second = mock
            .complete(&[Message::user("ping"), first, result], &[])
            .await
            .unwrap();
        assert!(!second.has_tool_calls());
        assert!(second.content.contains("pong"));
    }

    #[tokio::test]
    async fn test_scripted_exhaustion_is_error() {
        let s = ScriptedLlmClient::new(vec![Message::assistant("one")]);
        assert_eq!(s.complete(&[], &[]).await.unwrap().content, "one");
        assert!(s.complete(&[], &[]).await.is_err());
        assert_eq!(s.call_count(), 2);
    }
}
