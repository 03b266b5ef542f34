//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 RecoveryAction，供 ReAct 循环决定是回灌观察、退避还是终止。

use std::time::Duration;

use crate::core::{AgentError, RecoveryAction};

/// 连续限流达到该次数后改为退避
const RATE_LIMIT_BACKOFF_AFTER: u32 = 2;

/// 语义化错误恢复：将错误映射为可执行动作（观察 / 退避 / 终止）
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    max_backoff: Duration,
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl RecoveryEngine {
    pub fn new(max_backoff: Duration) -> Self {
        Self { max_backoff }
    }

    /// `consecutive_rate_limits` 为包括本次在内的连续限流次数
    pub fn handle(&self, err: &AgentError, consecutive_rate_limits: u32) -> RecoveryAction {
        match err {
            AgentError::PoolTimeout(waited) => RecoveryAction::Observe(format!(
                "LLM 连接池繁忙（等待 {waited:?} 未获得连接），请精简下一步。"
            )),
            AgentError::ExecutionTimeout(after) => RecoveryAction::Observe(format!(
                "上一次模型调用超过 {after:?} 未返回，请缩短输出后重试。"
            )),
            AgentError::LlmTransient(msg) => {
                RecoveryAction::Observe(format!("模型服务暂时不可用: {msg}"))
            }
            AgentError::RateLimitExceeded { retry_after } => {
                if consecutive_rate_limits >= RATE_LIMIT_BACKOFF_AFTER {
                    RecoveryAction::Backoff {
                        delay: self.cap(*retry_after),
                        note: format!("连续触发限流，已等待 {:?}。", self.cap(*retry_after)),
                    }
                } else {
                    RecoveryAction::Observe(format!(
                        "触发限流，建议 {retry_after:?} 后再调用模型。"
                    ))
                }
            }
            AgentError::CircuitOpen {
                dependency,
                retry_after,
            } => RecoveryAction::Backoff {
                delay: self.cap(*retry_after),
                note: format!("依赖 '{dependency}' 熔断中，已等待 {:?}。", self.cap(*retry_after)),
            },
            AgentError::MalformedResponse(raw) => RecoveryAction::Observe(format!(
                "上一轮输出无法解析: {raw}。\
                调用工具时只输出一个 JSON 对象: {{\"tool\": \"工具名\", \"args\": {{...}}}}；\
                完成时输出 {{\"final_answer\": ...}}。"
            )),
            AgentError::ToolNotFound(name) => RecoveryAction::Observe(format!(
                "工具 '{name}' 不存在，请只使用工具列表中的工具。"
            )),
            AgentError::InvalidToolArguments { tool, reason } => RecoveryAction::Observe(
                format!("工具 '{tool}' 参数不合法: {reason}"),
            ),
            AgentError::ToolTimeout(msg) => RecoveryAction::Observe(format!("工具执行超时: {msg}")),
            AgentError::ToolExecutionFailed(msg) => {
                RecoveryAction::Observe(format!("工具执行失败: {msg}"))
            }
            AgentError::SandboxUnavailable(reason) => RecoveryAction::Observe(format!(
                "沙箱不可用（{reason}），请改用静态分析工具。"
            )),
            AgentError::CheckpointWriteFailed(_)
            | AgentError::Storage(_)
            | AgentError::LlmFatal(_)
            | AgentError::Config(_)
            | AgentError::InvalidMessage(_)
            | AgentError::InvalidPhaseTransition { .. }
            | AgentError::IterationLimitExceeded(_)
            | AgentError::AgentWallClockExceeded(_)
            | AgentError::Cancelled => RecoveryAction::Fail,
        }
    }

    fn cap(&self, delay: Duration) -> Duration {
        delay.min(self.max_backoff)
    }
}
