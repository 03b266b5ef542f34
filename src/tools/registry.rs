//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry 按名注册与查找，
//! ToolExecutor 在调用前做一次参数校验，调用时加超时并统一产出 ToolResult。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::tools::schema::{empty_object_schema, validate_against_schema};

/// 单次调用的上下文
#[derive(Clone, Debug, Default)]
pub struct ToolContext {
    pub agent_id: String,
    pub cancel: CancellationToken,
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（用于 JSON 中的 "tool" 字段）
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认无参数
    fn parameters_schema(&self) -> Value {
        empty_object_schema()
    }

    /// 分发前的参数校验，失败时 Agent 收到 InvalidToolArguments 观察
    fn validate(&self, args: &Value) -> Result<(), String> {
        validate_against_schema(&self.parameters_schema(), args)
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, String>;
}

/// 分发结果
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolResult {
    pub tool: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ToolResult {
    pub fn ok(tool: &str, data: String, duration_ms: u64) -> Self {
        Self {
            tool: tool.to_string(),
            success: true,
            data: Some(data),
            error: None,
            duration_ms,
        }
    }

    pub fn failed(tool: &str, error: String, duration_ms: u64) -> Self {
        Self {
            tool: tool.to_string(),
            success: false,
            data: None,
            error: Some(error),
            duration_ms,
        }
    }

    /// 写回对话的观察文本
    pub fn observation(&self) -> String {
        match (&self.data, &self.error) {
            (Some(data), _) if self.success => data.clone(),
            (_, Some(err)) => format!("Error from {}: {}", self.tool, err),
            _ => format!("{} returned no output", self.tool),
        }
    }
}

/// 工具注册表：按名称有序存储，生成的工具目录顺序稳定
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// 工具目录 JSON（name / description / parameters）；`allowed` 为 None 时包含全部
    pub fn to_schema_json(&self, allowed: Option<&[String]>) -> String {
        let tools: Vec<Value> = self
            .tools
            .iter()
            .filter(|(name, _)| allowed.map_or(true, |list| list.iter().any(|a| a == *name)))
            .map(|(name, tool)| {
                serde_json::json!({
                    "name": name,
                    "description": tool.description(),
                    "parameters": tool.parameters_schema()
                })
            })
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}
