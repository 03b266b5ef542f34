//! 工具执行器
//!
//! 持有 ToolRegistry 与全局超时。分发顺序：查找工具 → 参数校验 → 带超时 / 可取消地执行。
//! 未知工具与参数错误以 AgentError 返回（计入连续失败）；工具自身的失败与超时包装为失败的 ToolResult。
//! 每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::{timeout, Instant};

use crate::core::AgentError;
use crate::tools::{ToolContext, ToolRegistry, ToolResult};

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout: Duration) -> Self {
        Self {
            registry: Arc::new(registry),
            timeout,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// `allowed` 限定 Agent 可用的工具；不在列表中的工具按不存在处理
    pub async fn execute(
        &self,
        tool_name: &str,
        args: Value,
        ctx: &ToolContext,
        allowed: Option<&[String]>,
    ) -> Result<ToolResult, AgentError> {
        let permitted = allowed.map_or(true, |list| list.iter().any(|t| t == tool_name));
        let tool = self
            .registry
            .get(tool_name)
            .filter(|_| permitted)
            .ok_or_else(|| AgentError::ToolNotFound(tool_name.to_string()))?;

        tool.validate(&args)
            .map_err(|reason| AgentError::InvalidToolArguments {
                tool: tool_name.to_string(),
                reason,
            })?;

        let start = Instant::now();
        let args_preview = args_preview(&args);
        let outcome = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => None,
            res = timeout(self.timeout, tool.execute(args, ctx)) => Some(res),
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        let (ok, label) = match &outcome {
            Some(Ok(Ok(_))) => (true, "ok"),
            Some(Ok(Err(_))) => (false, "error"),
            Some(Err(_)) => (false, "timeout"),
            None => (false, "cancelled"),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "agent": ctx.agent_id,
            "tool": tool_name,
            "ok": ok,
            "outcome": label,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match outcome {
            Some(Ok(Ok(data))) => Ok(ToolResult::ok(tool_name, data, duration_ms)),
            Some(Ok(Err(err))) => Ok(ToolResult::failed(tool_name, err, duration_ms)),
            Some(Err(_)) => Ok(ToolResult::failed(
                tool_name,
                format!("timed out after {:?}", self.timeout),
                duration_ms,
            )),
            None => Err(AgentError::Cancelled),
        }
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
