//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / 脚本化 Mock）及弹性封装

pub mod mock;
pub mod openai;
pub mod resilient;
pub mod traits;

use std::sync::Arc;

pub use mock::{ScriptedLlmClient, ScriptedReply};
pub use openai::{OpenAiClient, TokenUsage, DEEPSEEK_BASE_URL};
pub use resilient::ResilientLlm;
pub use traits::{Completion, CompletionRequest, LlmClient, LlmError, Usage};

use crate::config::LlmSection;

/// 按 [llm] 段创建客户端；provider = "mock" 时返回脚本化客户端（只返回兜底答案）
pub fn create_llm_from_config(section: &LlmSection) -> Result<Arc<dyn LlmClient>, LlmError> {
    match section.provider.to_lowercase().as_str() {
        "mock" => Ok(Arc::new(ScriptedLlmClient::new("mock"))),
        "openai" | "deepseek" => Ok(Arc::new(OpenAiClient::from_config(section)?)),
        other => Err(LlmError::Fatal(format!("unknown llm provider '{other}'"))),
    }
}
