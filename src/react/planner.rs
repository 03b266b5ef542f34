//! Planner：拼装提示词、调用带弹性层的 LLM，并把回复解析为「最终答案」或「单个工具调用」
//!
//! 每轮只接受一个工具调用；数组或多个调用视为格式错误，作为失败观察写回对话。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::LlmSection;
use crate::core::AgentError;
use crate::llm::{Completion, CompletionRequest, ResilientLlm};
use crate::tools::tool_call_schema_json;

/// 模型请求的工具调用：`{"tool": "code_read", "args": {...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default = "empty_args")]
    pub args: Value,
}

fn empty_args() -> Value {
    Value::Object(Default::default())
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlannerOutput {
    /// 结束：最终答案（JSON 对象会被序列化为字符串保留结构）
    FinalAnswer(String),
    ToolCall(ToolCall),
}

/// 解析模型回复
///
/// - `{"final_answer": ...}` 或不含 JSON 的纯文本 → `FinalAnswer`
/// - `{"tool": ..., "args": {...}}`，或只含一个元素的 `{"tool_calls": [...]}` → `ToolCall`
/// - 其余（数组、多个调用、缺少键、JSON 损坏）→ `MalformedResponse`
pub fn parse_llm_output(output: &str) -> Result<PlannerOutput, AgentError> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Err(AgentError::MalformedResponse("empty response".to_string()));
    }

    let (candidate, explicit) = match extract_json(trimmed) {
        Some(found) => found,
        None => return Ok(PlannerOutput::FinalAnswer(trimmed.to_string())),
    };

    let value: Value = match serde_json::from_str(candidate) {
        Ok(v) => v,
        // 正文里夹带的花括号（如代码片段）不算工具调用
        Err(_) if !explicit => return Ok(PlannerOutput::FinalAnswer(trimmed.to_string())),
        Err(e) => {
            return Err(AgentError::MalformedResponse(format!(
                "invalid JSON: {e}: {}",
                preview(candidate)
            )))
        }
    };

    match value {
        Value::Array(items) => Err(AgentError::MalformedResponse(format!(
            "expected one JSON object, got an array of {}",
            items.len()
        ))),
        Value::Object(mut obj) => {
            if let Some(answer) = obj.remove("final_answer") {
                return Ok(PlannerOutput::FinalAnswer(match answer {
                    Value::String(s) => s,
                    other => other.to_string(),
                }));
            }
            if let Some(calls) = obj.remove("tool_calls") {
                return match calls {
                    Value::Array(mut calls) if calls.len() == 1 => to_tool_call(calls.remove(0)),
                    Value::Array(calls) => Err(AgentError::MalformedResponse(format!(
                        "exactly one tool call per step is allowed, got {}",
                        calls.len()
                    ))),
                    _ => Err(AgentError::MalformedResponse(
                        "tool_calls must be an array".to_string(),
                    )),
                };
            }
            if obj.contains_key("tool") {
                return to_tool_call(Value::Object(obj));
            }
            if explicit {
                Err(AgentError::MalformedResponse(
                    "JSON reply needs either \"final_answer\" or \"tool\"".to_string(),
                ))
            } else {
                Ok(PlannerOutput::FinalAnswer(trimmed.to_string()))
            }
        }
        _ if explicit => Err(AgentError::MalformedResponse(
            "expected a JSON object".to_string(),
        )),
        _ => Ok(PlannerOutput::FinalAnswer(trimmed.to_string())),
    }
}

fn to_tool_call(value: Value) -> Result<PlannerOutput, AgentError> {
    let call: ToolCall = serde_json::from_value(value)
        .map_err(|e| AgentError::MalformedResponse(format!("bad tool call: {e}")))?;
    if call.tool.trim().is_empty() {
        return Err(AgentError::MalformedResponse("tool name is empty".to_string()));
    }
    if !call.args.is_object() {
        return Err(AgentError::MalformedResponse(format!(
            "args for '{}' must be a JSON object",
            call.tool
        )));
    }
    Ok(PlannerOutput::ToolCall(call))
}

/// 找出 JSON 片段；`explicit` 表示回复本身就是 JSON（代码块或以括号开头）
fn extract_json(text: &str) -> Option<(&str, bool)> {
    if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        let body = rest.find("```").map(|end| &rest[..end]).unwrap_or(rest);
        return Some((body.trim(), true));
    }
    if text.starts_with('{') || text.starts_with('[') {
        return Some((text, true));
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| (&text[start..=end], false))
}

fn preview(s: &str) -> String {
    if s.chars().count() > 120 {
        format!("{}...", s.chars().take(120).collect::<String>())
    } else {
        s.to_string()
    }
}

/// 回复格式说明，拼在每个 Agent 的 system prompt 末尾
pub fn response_format_instructions() -> String {
    format!(
        "Respond with exactly one JSON object and nothing else.\n\
         To call a tool: {{\"tool\": \"<name>\", \"args\": {{...}}}} (one tool per reply).\n\
         When you are done: {{\"final_answer\": <string or object>}}.\n\
         Tool call format schema:\n{}",
        tool_call_schema_json()
    )
}

pub struct Planner {
    llm: ResilientLlm,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl Planner {
    pub fn new(llm: ResilientLlm, settings: &LlmSection) -> Self {
        Self {
            llm,
            model: settings.model.clone(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
        }
    }

    pub fn llm(&self) -> &ResilientLlm {
        &self.llm
    }

    /// system = 角色指令 + 工具目录 + 回复格式
    pub fn system_prompt(&self, instructions: &str, tool_catalogue: &str) -> String {
        format!(
            "{instructions}\n\nAvailable tools:\n{tool_catalogue}\n\n{}",
            response_format_instructions()
        )
    }

    pub async fn think(
        &self,
        system_prompt: &str,
        transcript: &str,
        cancel: &CancellationToken,
    ) -> Result<Completion, AgentError> {
        let request = CompletionRequest {
            prompt: transcript.to_string(),
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            system_prompt: Some(system_prompt.to_string()),
        };
        tracing::debug!(
            provider = self.llm.provider(),
            model = %self.model,
            prompt_chars = transcript.len(),
            "llm request"
        );
        self.llm.complete(&request, cancel).await
    }
}
