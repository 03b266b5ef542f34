//! 脚本化 LLM 客户端（用于测试与离线演示，无需 API）
//!
//! 回复按队列顺序返回；可按「标记字符串」路由，标记出现在 system prompt 或 prompt 中即命中，
//! 用来让 Recon / Analysis / Verification 各自拿到自己的脚本。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{Completion, CompletionRequest, LlmClient, LlmError, Usage};

/// 一条预设回复
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    Error(LlmError),
    /// 延迟后返回文本（用于超时测试）
    Delayed(Duration, String),
}

impl From<&str> for ScriptedReply {
    fn from(text: &str) -> Self {
        ScriptedReply::Text(text.to_string())
    }
}

impl From<String> for ScriptedReply {
    fn from(text: String) -> Self {
        ScriptedReply::Text(text)
    }
}

struct Route {
    marker: String,
    replies: VecDeque<ScriptedReply>,
}

/// 脚本化客户端
pub struct ScriptedLlmClient {
    provider: String,
    routes: Mutex<Vec<Route>>,
    fallback: Mutex<VecDeque<ScriptedReply>>,
    default_reply: String,
    calls: AtomicUsize,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlmClient {
    pub fn new(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            routes: Mutex::new(Vec::new()),
            fallback: Mutex::new(VecDeque::new()),
            default_reply: r#"{"final_answer": "nothing further"}"#.to_string(),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// 未命中任何路由时依次返回
    pub fn with_replies<I, R>(self, replies: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<ScriptedReply>,
    {
        if let Ok(mut queue) = self.fallback.lock() {
            queue.extend(replies.into_iter().map(Into::into));
        }
        self
    }

    /// 请求中包含 `marker` 时从该路由的队列取回复
    pub fn with_route<I, R>(self, marker: &str, replies: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<ScriptedReply>,
    {
        if let Ok(mut routes) = self.routes.lock() {
            routes.push(Route {
                marker: marker.to_string(),
                replies: replies.into_iter().map(Into::into).collect(),
            });
        }
        self
    }

    /// 队列耗尽后的兜底回复
    pub fn with_default_reply(mut self, reply: &str) -> Self {
        self.default_reply = reply.to_string();
        self
    }

    /// 已收到的调用次数（包括返回错误的调用）
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn next_reply(&self, request: &CompletionRequest) -> ScriptedReply {
        let system = request.system_prompt.as_deref().unwrap_or("");
        if let Ok(mut routes) = self.routes.lock() {
            if let Some(route) = routes
                .iter_mut()
                .find(|r| system.contains(&r.marker) || request.prompt.contains(&r.marker))
            {
                return route
                    .replies
                    .pop_front()
                    .unwrap_or_else(|| ScriptedReply::Text(self.default_reply.clone()));
            }
        }
        self.fallback
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or_else(|| ScriptedReply::Text(self.default_reply.clone()))
    }
}

fn rough_tokens(text: &str) -> u32 {
    (text.chars().count() / 4 + 1) as u32
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut log) = self.requests.lock() {
            log.push(request.clone());
        }

        let content = match self.next_reply(request) {
            ScriptedReply::Text(text) => text,
            ScriptedReply::Error(err) => return Err(err),
            ScriptedReply::Delayed(delay, text) => {
                tokio::time::sleep(delay).await;
                text
            }
        };
        let usage = Usage {
            prompt_tokens: rough_tokens(&request.prompt),
            completion_tokens: rough_tokens(&content),
        };
        Ok(Completion { content, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(system: &str, prompt: &str) -> CompletionRequest {
        CompletionRequest {
            prompt: prompt.to_string(),
            model: "mock".to_string(),
            temperature: 0.0,
            max_tokens: 64,
            system_prompt: Some(system.to_string()),
        }
    }

    #[tokio::test]
    async fn test_routes_by_marker_then_falls_back() {
        let client = ScriptedLlmClient::new("mock")
            .with_route("[recon]", ["recon-1", "recon-2"])
            .with_replies(["plain"]);

        let r = client.complete(&request("role [recon]", "x")).await.unwrap();
        assert_eq!(r.content, "recon-1");
        let r = client.complete(&request("other", "x")).await.unwrap();
        assert_eq!(r.content, "plain");
        let r = client.complete(&request("role [recon]", "x")).await.unwrap();
        assert_eq!(r.content, "recon-2");
        let r = client.complete(&request("role [recon]", "x")).await.unwrap();
        assert!(r.content.contains("final_answer"));
        assert_eq!(client.calls(), 4);
    }

    #[tokio::test]
    async fn test_scripted_error() {
        let client = ScriptedLlmClient::new("mock")
            .with_replies([ScriptedReply::Error(LlmError::Transient("503".into()))]);
        let err = client.complete(&request("", "x")).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(client.calls(), 1);
    }
}
