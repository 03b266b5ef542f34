//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；DeepSeek 使用同一适配器。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::config::LlmSection;
use crate::llm::{Completion, CompletionRequest, LlmClient, LlmError, Usage};

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
    }

    /// (prompt, completion, total)
    pub fn get(&self) -> (u64, u64, u64) {
        let prompt = self.prompt_tokens.load(Ordering::Relaxed);
        let completion = self.completion_tokens.load(Ordering::Relaxed);
        (prompt, completion, prompt + completion)
    }
}

/// OpenAI 兼容客户端
pub struct OpenAiClient {
    provider: String,
    client: Client<OpenAIConfig>,
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(provider: &str, base_url: Option<&str>, api_key: String) -> Self {
        let config = match base_url {
            Some(url) => OpenAIConfig::new().with_api_base(url).with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };
        Self {
            provider: provider.to_string(),
            client: Client::with_config(config),
            usage: TokenUsage::default(),
        }
    }

    /// 按 [llm] 段构建；deepseek 未配置 base_url 时使用官方地址，
    /// api_key 为空时读取 `{PROVIDER}_API_KEY`，再退回 `OPENAI_API_KEY`
    pub fn from_config(section: &LlmSection) -> Result<Self, LlmError> {
        let provider = section.provider.to_lowercase();
        let env_key = format!("{}_API_KEY", provider.to_uppercase());
        let api_key = section
            .api_key
            .clone()
            .or_else(|| std::env::var(&env_key).ok())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .ok_or_else(|| LlmError::Fatal(format!("no API key configured ({env_key})")))?;
        let base_url = section.base_url.clone().or_else(|| {
            (provider == "deepseek").then(|| DEEPSEEK_BASE_URL.to_string())
        });
        Ok(Self::new(&provider, base_url.as_deref(), api_key))
    }

    fn to_openai_messages(
        request: &CompletionRequest,
    ) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system_prompt {
            messages.push(ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system.clone())
                    .build()
                    .map_err(|e| LlmError::Fatal(e.to_string()))?,
            ));
        }
        messages.push(ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessageArgs::default()
                .content(request.prompt.clone())
                .build()
                .map_err(|e| LlmError::Fatal(e.to_string()))?,
        ));
        Ok(messages)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn provider(&self) -> &str {
        &self.provider
    }

    #[allow(deprecated)]
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let body = CreateChatCompletionRequestArgs::default()
            .model(&request.model)
            .messages(Self::to_openai_messages(request)?)
            .temperature(request.temperature)
            .max_tokens(request.max_tokens)
            .build()
            .map_err(|e| LlmError::Fatal(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(body)
            .await
            .map_err(|e| LlmError::classify(e.to_string()))?;

        let usage = response
            .usage
            .as_ref()
            .map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            })
            .unwrap_or_default();
        self.usage
            .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        tracing::debug!(
            provider = %self.provider,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "llm completion"
        );
        Ok(Completion { content, usage })
    }
}
