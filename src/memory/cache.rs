//! 对话缓存：带 TTL 的键值存储
//!
//! 两个后端：进程内 HashMap（测试 / 单进程）和 SQLite 表（带 `expires_at`）。
//! 过期条目对读取不可见，在下一次写入时顺带清理。

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::time::Instant;

/// 默认 TTL：24 小时
pub const DEFAULT_CONVERSATION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub fn conversation_key(session_id: &str, agent_id: &str) -> String {
    format!("conversation:{session_id}:{agent_id}")
}

#[async_trait]
pub trait ConversationCache: Send + Sync {
    async fn put(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()>;

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    async fn remove(&self, key: &str) -> anyhow::Result<()>;
}

/// 进程内缓存
#[derive(Default)]
pub struct InMemoryConversationCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryConversationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .map(|e| e.values().filter(|(_, exp)| *exp > now).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ConversationCache for InMemoryConversationCache {
    async fn put(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        entries.insert(key.to_string(), (value, now + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(value, _)| value.clone()))
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }
}

const CACHE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS conversation_cache (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_conversation_cache_expires ON conversation_cache(expires_at);
";

/// SQLite 缓存；过期时间按墙钟毫秒存储
pub struct SqliteConversationCache {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteConversationCache {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(CACHE_SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CACHE_SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| anyhow::anyhow!("conversation cache connection poisoned"))?;
            f(&guard)
        })
        .await?
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl ConversationCache for SqliteConversationCache {
    async fn put(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()> {
        let key = key.to_string();
        let expires_at = now_millis() + ttl.as_millis() as i64;
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM conversation_cache WHERE expires_at <= ?1",
                params![now_millis()],
            )?;
            conn.execute(
                "INSERT INTO conversation_cache (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = ?2, expires_at = ?3",
                params![key, value, expires_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let value = conn
                .query_row(
                    "SELECT value FROM conversation_cache WHERE key = ?1 AND expires_at > ?2",
                    params![key, now_millis()],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(value)
        })
        .await
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM conversation_cache WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }
}
