//! 带弹性层的 LLM 客户端：所有调用经过 provider 对应的 ResilienceGuard

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::llm::{Completion, CompletionRequest, LlmClient};
use crate::resilience::{ResilienceGuard, ResilienceRegistry};

#[derive(Clone)]
pub struct ResilientLlm {
    client: Arc<dyn LlmClient>,
    guard: Arc<ResilienceGuard>,
}

impl ResilientLlm {
    pub fn new(client: Arc<dyn LlmClient>, registry: &ResilienceRegistry) -> Self {
        let guard = registry.guard(client.provider());
        Self { client, guard }
    }

    pub fn provider(&self) -> &str {
        self.client.provider()
    }

    pub fn guard(&self) -> &Arc<ResilienceGuard> {
        &self.guard
    }

    pub async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Completion, AgentError> {
        let client = self.client.clone();
        self.guard
            .call(cancel, || async move { client.complete(request).await })
            .await
            .map_err(AgentError::from)
    }
}
