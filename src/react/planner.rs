//! Planner：推理步骤与动作解析
//!
//! Planner 持有 LLM、system prompt 与单步超时，把完整历史交给模型，得到终止回复或一批工具调用。
//! parse_llm_output 把纯文本模型输出解析为回复或调用批次，接受以下 JSON 形状（可包在 ```json 代码块里）：
//! `{"tool": .., "args": ..}`、`{"tool_name": .., "parameters": ..}`、`{"tool_calls": [..]}` 或动作数组。

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::llm::{LlmClient, LlmError};
use crate::memory::{Message, Role, ToolCallRequest};
use crate::tools::ToolSpec;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are AIDE, an autonomous incident diagnostic engineer. \
Investigate production incidents systematically: observe with read-only tools first, form a hypothesis, \
then remediate. State-changing actions are reviewed by a human operator and may be rejected; when a tool \
result says an action was rejected, do not retry it blindly, re-plan or ask the operator. \
After any remediation, verify the outcome with observability tools.";

/// Planner 输出
#[derive(Debug, Clone, PartialEq)]
pub enum PlannerOutput {
    /// 直接回复用户
    Response(String),
    /// 需要执行工具；thought 为 JSON 之前的说明文字
    ToolCalls {
        thought: String,
        calls: Vec<ToolCallRequest>,
    },
}

impl PlannerOutput {
    pub fn into_message(self) -> Message {
        match self {
            PlannerOutput::Response(text) => Message::assistant(text),
            PlannerOutput::ToolCalls { thought, calls } => Message::assistant_with_calls(thought, calls),
        }
    }
}

pub fn new_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

/// 截取 JSON 片段与其前面的文字
fn extract_json(trimmed: &str) -> Option<(&str, &str)> {
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        let body = rest.find("```").map(|end| &rest[..end]).unwrap_or(rest);
        return Some((trimmed[..start].trim(), body.trim()));
    }
    let start = trimmed.find(['{', '['])?;
    let close = if trimmed[start..].starts_with('{') { '}' } else { ']' };
    // 没有闭合括号时取到末尾，交给 JSON 解析报错
    let body = match trimmed.rfind(close) {
        Some(end) if end > start => &trimmed[start..=end],
        _ => &trimmed[start..],
    };
    Some((trimmed[..start].trim(), body))
}

fn field<'a>(obj: &'a serde_json::Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| obj.get(*k))
}

fn is_action(obj: &serde_json::Map<String, Value>) -> bool {
    field(obj, &["tool", "tool_name"]).is_some()
}

fn parse_action(value: &Value) -> Result<ToolCallRequest, LlmError> {
    let obj = value
        .as_object()
        .ok_or_else(|| LlmError::InvalidOutput(format!("action is not an object: {}", value)))?;
    let name = field(obj, &["tool", "tool_name", "name"])
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| LlmError::InvalidOutput(format!("action without tool name: {}", value)))?;
    let args = match field(obj, &["args", "parameters", "arguments"]) {
        // 部分模型把参数编码成字符串
        Some(Value::String(s)) => serde_json::from_str(s)
            .map_err(|e| LlmError::InvalidOutput(format!("arguments of {} are not JSON: {}", name, e)))?,
        Some(v) => v.clone(),
        None => Value::Object(Default::default()),
    };
    let call_id = field(obj, &["id", "call_id"])
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .unwrap_or_else(new_call_id);
    Ok(ToolCallRequest::new(call_id, name, args))
}

/// 解析 LLM 输出：无 JSON 或 JSON 不是动作时为 Response；JSON 非法或动作缺字段时报 InvalidOutput
pub fn parse_llm_output(output: &str) -> Result<PlannerOutput, LlmError> {
    let trimmed = output.trim();
    let Some((thought, json_str)) = extract_json(trimmed) else {
        return Ok(PlannerOutput::Response(trimmed.to_string()));
    };

    let value: Value = serde_json::from_str(json_str)
        .map_err(|e| LlmError::InvalidOutput(format!("{}: {}", e, json_str)))?;

    let actions: Vec<&Value> = match &value {
        Value::Array(items) => items.iter().collect(),
        Value::Object(obj) => match obj.get("tool_calls") {
            Some(Value::Array(items)) => items.iter().collect(),
            Some(other) => {
                return Err(LlmError::InvalidOutput(format!("tool_calls is not an array: {}", other)))
            }
            None if is_action(obj) => vec![&value],
            None => return Ok(PlannerOutput::Response(trimmed.to_string())),
        },
        _ => return Ok(PlannerOutput::Response(trimmed.to_string())),
    };

    if actions.is_empty() {
        return Ok(PlannerOutput::Response(thought.to_string()));
    }
    let calls = actions
        .into_iter()
        .map(parse_action)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(PlannerOutput::ToolCalls {
        thought: thought.to_string(),
        calls,
    })
}

/// Planner：推理步骤
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
    timeout: Duration,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, system_prompt: impl Into<String>, timeout: Duration) -> Self {
        Self {
            llm,
            system_prompt: system_prompt.into(),
            timeout,
        }
    }

    pub fn base_system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    /// 一次推理：历史前补 system prompt，调用模型（带超时），并规整返回消息
    pub async fn plan(&self, history: &[Message], tools: &[ToolSpec]) -> Result<Message, LlmError> {
        let needs_system = !self.system_prompt.is_empty()
            && history.first().map(|m| m.role != Role::System).unwrap_or(true);
        let messages: Vec<Message> = if needs_system {
            std::iter::once(Message::system(self.system_prompt.clone()))
                .chain(history.iter().cloned())
                .collect()
        } else {
            history.to_vec()
        };

        let reply = tokio::time::timeout(self.timeout, self.llm.complete(&messages, tools))
            .await
            .map_err(|_| LlmError::Timeout)??;

        tracing::debug!(content = %reply.content, calls = reply.tool_calls.len(), "model reply");
        Ok(normalize(reply))
    }
}

/// 强制 assistant 角色，清掉 tool 专属字段，为缺失 call_id 的调用补 ID
fn normalize(mut reply: Message) -> Message {
    reply.role = Role::Assistant;
    reply.call_id = None;
    reply.tool_name = None;
    reply.status = None;
    for call in &mut reply.tool_calls {
        if call.call_id.trim().is_empty() {
            call.call_id = new_call_id();
        }
    }
    reply
}
