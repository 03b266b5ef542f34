//! 短期记忆：单个 Agent 的对话历史
//!
//! 每个 (session, agent) 一个有界 FIFO 环形缓冲，超过 `max_history` 时丢弃最旧的消息。
//! 可序列化到 [`ConversationCache`]（带 TTL），供检查点恢复时重建上下文。

use std::collections::{BTreeMap, VecDeque};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::AgentError;
use crate::memory::cache::{conversation_key, ConversationCache};

/// 消息角色（与 LLM API 一致，另加工具观察）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl FromStr for Role {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            "" => Err(AgentError::InvalidMessage("role must not be empty".to_string())),
            other => Err(AgentError::InvalidMessage(format!("unknown role '{other}'"))),
        }
    }
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            token_count: None,
            metadata: Map::new(),
        }
    }

    pub fn with_token_count(mut self, tokens: u32) -> Self {
        self.token_count = Some(tokens);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// 对话统计
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConversationSummary {
    pub total: usize,
    pub by_role: BTreeMap<Role, usize>,
    pub total_chars: usize,
    pub total_tokens: u64,
    /// 因容量上限被丢弃的消息数
    pub evicted: u64,
}

#[derive(Serialize, Deserialize)]
struct PersistedConversation {
    evicted: u64,
    messages: Vec<Message>,
}

#[derive(Clone, Debug)]
pub struct ConversationStore {
    messages: VecDeque<Message>,
    max_history: usize,
    evicted: u64,
}

impl ConversationStore {
    pub fn new(max_history: usize) -> Self {
        let max_history = max_history.max(1);
        Self {
            messages: VecDeque::with_capacity(max_history),
            max_history,
            evicted: 0,
        }
    }

    /// 追加一条消息；空内容返回 `InvalidMessage`
    pub fn append(
        &mut self,
        role: Role,
        content: impl Into<String>,
        metadata: Option<Map<String, Value>>,
    ) -> Result<&Message, AgentError> {
        let mut message = Message::new(role, content);
        if let Some(metadata) = metadata {
            message.metadata = metadata;
        }
        self.push(message)
    }

    /// 按字符串角色追加（外部输入）；空或未知角色返回 `InvalidMessage`
    pub fn append_raw(
        &mut self,
        role: &str,
        content: impl Into<String>,
        metadata: Option<Map<String, Value>>,
    ) -> Result<&Message, AgentError> {
        let role = role.parse::<Role>()?;
        self.append(role, content, metadata)
    }

    pub fn push(&mut self, message: Message) -> Result<&Message, AgentError> {
        if message.content.trim().is_empty() {
            return Err(AgentError::InvalidMessage(
                "content must not be empty".to_string(),
            ));
        }
        while self.messages.len() >= self.max_history {
            self.messages.pop_front();
            self.evicted += 1;
        }
        self.messages.push_back(message);
        self.messages
            .back()
            .ok_or_else(|| AgentError::InvalidMessage("append failed".to_string()))
    }

    /// 按时间顺序返回当前保留的消息
    pub fn history(&self) -> Vec<Message> {
        self.messages.iter().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    /// 纯文本形式，作为模型提示的上下文部分
    pub fn transcript(&self) -> String {
        self.messages
            .iter()
            .map(|m| format!("[{}] {}", m.role.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn summary(&self) -> ConversationSummary {
        let mut by_role = BTreeMap::new();
        let mut total_chars = 0;
        let mut total_tokens = 0u64;
        for m in &self.messages {
            *by_role.entry(m.role).or_insert(0) += 1;
            total_chars += m.content.chars().count();
            total_tokens += m.token_count.unwrap_or(0) as u64;
        }
        ConversationSummary {
            total: self.messages.len(),
            by_role,
            total_chars,
            total_tokens,
            evicted: self.evicted,
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// 写入缓存，`ttl` 后过期
    pub async fn persist(
        &self,
        cache: &dyn ConversationCache,
        session_id: &str,
        agent_id: &str,
        ttl: Duration,
    ) -> Result<(), AgentError> {
        let payload = PersistedConversation {
            evicted: self.evicted,
            messages: self.history(),
        };
        let json = serde_json::to_string(&payload)
            .map_err(|e| AgentError::Storage(format!("serialize conversation: {e}")))?;
        cache
            .put(&conversation_key(session_id, agent_id), json, ttl)
            .await
            .map_err(|e| AgentError::Storage(e.to_string()))
    }

    /// 从缓存恢复；未命中或已过期返回 `None`
    pub async fn restore(
        cache: &dyn ConversationCache,
        session_id: &str,
        agent_id: &str,
        max_history: usize,
    ) -> Result<Option<Self>, AgentError> {
        let Some(json) = cache
            .get(&conversation_key(session_id, agent_id))
            .await
            .map_err(|e| AgentError::Storage(e.to_string()))?
        else {
            return Ok(None);
        };
        let payload: PersistedConversation = serde_json::from_str(&json)
            .map_err(|e| AgentError::Storage(format!("corrupt conversation entry: {e}")))?;

        let mut store = Self::new(max_history);
        store.evicted = payload.evicted;
        for message in payload.messages {
            store.push(message)?;
        }
        Ok(Some(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::cache::InMemoryConversationCache;

    #[test]
    fn test_fifo_eviction_keeps_most_recent() {
        let mut store = ConversationStore::new(10);
        for i in 0..15 {
            store.append(Role::User, format!("msg {i}"), None).unwrap();
        }
        let history = store.history();
        assert_eq!(history.len(), 10);
        assert_eq!(history.first().unwrap().content, "msg 5");
        assert_eq!(history.last().unwrap().content, "msg 14");
        assert_eq!(store.summary().evicted, 5);
    }

    #[test]
    fn test_rejects_empty_content_and_role() {
        let mut store = ConversationStore::new(4);
        assert!(matches!(
            store.append(Role::User, "   ", None),
            Err(AgentError::InvalidMessage(_))
        ));
        assert!(matches!(
            store.append_raw("", "hello", None),
            Err(AgentError::InvalidMessage(_))
        ));
        assert!(matches!(
            store.append_raw("narrator", "hello", None),
            Err(AgentError::InvalidMessage(_))
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_summary_and_transcript() {
        let mut store = ConversationStore::new(8);
        store.append(Role::System, "audit", None).unwrap();
        store.push(Message::new(Role::Assistant, "{}").with_token_count(3)).unwrap();
        store.append_raw("tool", "ok", None).unwrap();

        let summary = store.summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.by_role.get(&Role::Tool), Some(&1));
        assert_eq!(summary.total_tokens, 3);
        assert_eq!(store.transcript(), "[system] audit\n\n[assistant] {}\n\n[tool] ok");
    }

    #[tokio::test]
    async fn test_persist_and_restore_round_trip() {
        let cache = InMemoryConversationCache::new();
        let mut store = ConversationStore::new(4);
        let mut meta = Map::new();
        meta.insert("tool".into(), Value::String("code_read".into()));
        store.append(Role::Tool, "file contents", Some(meta)).unwrap();
        store
            .persist(&cache, "task-1", "agent-1", Duration::from_secs(60))
            .await
            .unwrap();

        let restored = ConversationStore::restore(&cache, "task-1", "agent-1", 4)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(restored.history(), store.history());
        assert!(ConversationStore::restore(&cache, "task-1", "other", 4)
            .await
            .unwrap()
            .is_none());
    }
}
