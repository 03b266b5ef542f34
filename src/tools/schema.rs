//! 工具参数 JSON Schema：由 schemars 从参数结构体生成，分发时用 jsonschema 完整校验一次

use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};

/// 工具调用请求格式，与 ReAct 解析的 `{"tool": "...", "args": {...}}` 一致（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    /// 工具名，必须是工具列表中的一个
    pub tool: String,
    /// 工具参数，结构见各工具的 parameters
    pub args: Map<String, Value>,
}

/// 返回工具调用的 JSON Schema 字符串，可拼入 system prompt
pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ToolCallFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// 从参数结构体生成 schema
pub fn parameters_schema_for<T: JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| empty_object_schema())
}

pub fn empty_object_schema() -> Value {
    json!({ "type": "object", "properties": {}, "required": [] })
}

/// 反序列化为工具的参数结构体
pub fn typed_args<T: DeserializeOwned>(args: Value) -> Result<T, String> {
    serde_json::from_value(args).map_err(|e| format!("invalid arguments: {e}"))
}

/// 按 schema 校验参数（jsonschema 按 `$schema` 选择草案，schemars 生成的是 draft-07）
pub fn validate_against_schema(schema: &Value, args: &Value) -> Result<(), String> {
    let validator =
        jsonschema::validator_for(schema).map_err(|e| format!("invalid tool schema: {e}"))?;
    let errors: Vec<String> = validator
        .iter_errors(args)
        .map(|e| e.to_string())
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}
