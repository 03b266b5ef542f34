//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Scripted Mock）实现 LlmClient::complete。
//! 连接池、限流、熔断不在这里处理，由 [`crate::resilience`] 包裹。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 单次补全请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
}

/// 单次调用的 token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens as u64 + self.completion_tokens as u64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    pub usage: Usage,
}

/// 后端错误：瞬时（5xx、429、网络）或致命（鉴权、请求非法）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("{0}")]
    Fatal(String),
}

impl LlmError {
    /// 按错误文本归类
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_transient_message(&message) {
            LlmError::Transient(message)
        } else {
            LlmError::Fatal(message)
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, LlmError::Transient(_))
    }
}

fn is_transient_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    const TRANSIENT: &[&str] = &[
        "500",
        "502",
        "503",
        "504",
        "internal server error",
        "bad gateway",
        "service unavailable",
        "gateway timeout",
        "429",
        "rate limit",
        "too many requests",
        "timeout",
        "timed out",
        "connection refused",
        "connection reset",
        "network error",
        "overloaded",
        "temporarily unavailable",
    ];
    TRANSIENT.iter().any(|pattern| lower.contains(pattern))
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 依赖名，用作弹性层注册表的 key（如 "openai"、"deepseek"）
    fn provider(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_transient() {
        assert!(LlmError::classify("HTTP 503 Service Unavailable").is_transient());
        assert!(LlmError::classify("429 Too Many Requests").is_transient());
        assert!(LlmError::classify("connection reset by peer").is_transient());
    }

    #[test]
    fn test_classify_fatal() {
        assert!(!LlmError::classify("401 invalid api key").is_transient());
        assert!(!LlmError::classify("model not found").is_transient());
    }
}
