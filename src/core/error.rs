//! Agent 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 AgentError 决定 Observe / Backoff / Fail。
//! 弹性层（ResilienceError）、LLM（LlmError）、存储（StoreError）、沙箱（SandboxError）
//! 各自有独立的错误枚举，在进入 Agent 运行时时统一转换为 AgentError。

use std::time::Duration;

use thiserror::Error;

use crate::llm::LlmError;
use crate::resilience::ResilienceError;
use crate::tools::sandbox::SandboxError;
use crate::tree::StoreError;

/// Agent 运行过程中可能出现的错误（准入、熔断、超时、工具、沙箱、检查点等）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    #[error("Connection pool admission timed out after {0:?}")]
    PoolTimeout(Duration),

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimitExceeded { retry_after: Duration },

    #[error("Circuit open for '{dependency}', retry after {retry_after:?}")]
    CircuitOpen {
        dependency: String,
        retry_after: Duration,
    },

    #[error("Execution timed out after {0:?}")]
    ExecutionTimeout(Duration),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid arguments for tool '{tool}': {reason}")]
    InvalidToolArguments { tool: String, reason: String },

    #[error("Sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    #[error("Iteration limit reached ({0})")]
    IterationLimitExceeded(u32),

    #[error("Agent wall-clock budget exceeded ({0:?})")]
    AgentWallClockExceeded(Duration),

    #[error("Checkpoint write failed: {0}")]
    CheckpointWriteFailed(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// 模型输出无法解析为「最终答案」或「单个工具调用」
    #[error("Malformed model response: {0}")]
    MalformedResponse(String),

    #[error("LLM transient error: {0}")]
    LlmTransient(String),

    #[error("LLM error: {0}")]
    LlmFatal(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Invalid phase transition: {from} -> {to}")]
    InvalidPhaseTransition { from: String, to: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Cancelled")]
    Cancelled,
}

impl AgentError {
    /// 写入 Agent 树节点的失败原因（迭代上限 / 墙钟超时使用固定短语）
    pub fn failure_reason(&self) -> String {
        match self {
            AgentError::IterationLimitExceeded(_) => "iteration limit".to_string(),
            AgentError::AgentWallClockExceeded(_) => "timeout".to_string(),
            AgentError::Cancelled => "cancelled".to_string(),
            other => other.to_string(),
        }
    }

    /// 工具分发阶段的错误（未知工具 / 参数不合法），与解析失败一起计入连续失败次数
    pub fn is_dispatch_error(&self) -> bool {
        matches!(
            self,
            AgentError::ToolNotFound(_) | AgentError::InvalidToolArguments { .. }
        )
    }
}

impl From<ResilienceError<LlmError>> for AgentError {
    fn from(err: ResilienceError<LlmError>) -> Self {
        match err {
            ResilienceError::PoolTimeout { waited, .. } => AgentError::PoolTimeout(waited),
            ResilienceError::RateLimitExceeded { retry_after, .. } => {
                AgentError::RateLimitExceeded { retry_after }
            }
            ResilienceError::CircuitOpen { name, retry_after } => AgentError::CircuitOpen {
                dependency: name,
                retry_after,
            },
            ResilienceError::ExecutionTimeout { after, .. } => AgentError::ExecutionTimeout(after),
            ResilienceError::Cancelled => AgentError::Cancelled,
            ResilienceError::Upstream(LlmError::Transient(msg)) => AgentError::LlmTransient(msg),
            ResilienceError::Upstream(LlmError::Fatal(msg)) => AgentError::LlmFatal(msg),
        }
    }
}

impl From<SandboxError> for AgentError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Unavailable(reason) => AgentError::SandboxUnavailable(reason),
            SandboxError::Timeout(after) => AgentError::ToolTimeout(format!("sandbox call exceeded {after:?}")),
            SandboxError::Cancelled => AgentError::Cancelled,
            other => AgentError::ToolExecutionFailed(other.to_string()),
        }
    }
}

impl From<StoreError> for AgentError {
    fn from(err: StoreError) -> Self {
        AgentError::Storage(err.to_string())
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 作为失败观察写回对话，让模型在下一轮调整
    Observe(String),
    /// 退避等待（受墙钟截止时间约束）后再写回观察
    Backoff { delay: Duration, note: String },
    /// 终止当前 Agent
    Fail,
}
