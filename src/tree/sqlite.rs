//! SQLite 后端（rusqlite）
//!
//! WAL + `synchronous=FULL`，每次追加一个事务；同步连接放在 `spawn_blocking` 中使用。
//! 检查点的 `seq` 为自增主键，保证同一 Agent 内写入顺序不受墙钟时间影响。

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use uuid::Uuid;

use crate::tree::model::{
    AgentCheckpoint, AgentId, AgentTreeNode, CheckpointId, CheckpointKind, NewNode, NodeCounters,
    NodeStatus,
};
use crate::tree::store::{apply_transition, check_mutable, check_transition, StoreError, TreeStore};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS agent_nodes (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL,
    parent_id TEXT REFERENCES agent_nodes(id),
    agent_type TEXT NOT NULL,
    name TEXT NOT NULL,
    depth INTEGER NOT NULL,
    status TEXT NOT NULL,
    iterations INTEGER NOT NULL DEFAULT 0,
    tool_calls INTEGER NOT NULL DEFAULT 0,
    tokens_used INTEGER NOT NULL DEFAULT 0,
    findings_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT,
    result_summary TEXT,
    failure_reason TEXT
);
CREATE INDEX IF NOT EXISTS idx_agent_nodes_task ON agent_nodes(task_id);

CREATE TABLE IF NOT EXISTS agent_checkpoints (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    agent_id TEXT NOT NULL REFERENCES agent_nodes(id),
    task_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    state TEXT NOT NULL,
    metadata TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_agent_checkpoints_agent ON agent_checkpoints(agent_id, seq);
";

const NODE_COLUMNS: &str = "id, task_id, parent_id, agent_type, name, depth, status, iterations, \
     tool_calls, tokens_used, findings_count, created_at, started_at, finished_at, \
     result_summary, failure_reason";

const CHECKPOINT_COLUMNS: &str = "seq, id, agent_id, task_id, kind, state, metadata, created_at";

pub struct SqliteTreeStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTreeStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Backend("tree store connection poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }
}

fn parse_col<T: std::str::FromStr<Err = StoreError>>(
    value: String,
    idx: usize,
) -> rusqlite::Result<T> {
    value.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn json_col(value: String, idx: usize) -> rusqlite::Result<Value> {
    serde_json::from_str(&value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<AgentTreeNode> {
    Ok(AgentTreeNode {
        id: row.get(0)?,
        task_id: row.get(1)?,
        parent_id: row.get(2)?,
        agent_type: parse_col(row.get(3)?, 3)?,
        name: row.get(4)?,
        depth: row.get(5)?,
        status: parse_col::<NodeStatus>(row.get(6)?, 6)?,
        counters: NodeCounters {
            iterations: row.get(7)?,
            tool_calls: row.get(8)?,
            tokens_used: row.get::<_, i64>(9)? as u64,
            findings_count: row.get(10)?,
        },
        created_at: row.get::<_, DateTime<Utc>>(11)?,
        started_at: row.get(12)?,
        finished_at: row.get(13)?,
        result_summary: row.get(14)?,
        failure_reason: row.get(15)?,
    })
}

fn checkpoint_from_row(row: &Row<'_>) -> rusqlite::Result<AgentCheckpoint> {
    Ok(AgentCheckpoint {
        sequence: row.get::<_, i64>(0)? as u64,
        id: row.get(1)?,
        agent_id: row.get(2)?,
        task_id: row.get(3)?,
        kind: parse_col::<CheckpointKind>(row.get(4)?, 4)?,
        state: json_col(row.get(5)?, 5)?,
        metadata: json_col(row.get(6)?, 6)?,
        created_at: row.get(7)?,
    })
}

fn load_node(conn: &Connection, node_id: &str) -> Result<Option<AgentTreeNode>, StoreError> {
    let sql = format!("SELECT {NODE_COLUMNS} FROM agent_nodes WHERE id = ?1");
    Ok(conn
        .query_row(&sql, params![node_id], node_from_row)
        .optional()?)
}

#[async_trait]
impl TreeStore for SqliteTreeStore {
    async fn create_node(&self, new: NewNode) -> Result<AgentId, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let depth = match &new.parent_id {
                None => 0,
                Some(parent_id) => {
                    let parent = load_node(&tx, parent_id)?
                        .ok_or_else(|| StoreError::NodeNotFound(parent_id.clone()))?;
                    if parent.task_id != new.task_id {
                        return Err(StoreError::ParentTaskMismatch {
                            parent: parent_id.clone(),
                            task: new.task_id.clone(),
                        });
                    }
                    parent.depth + 1
                }
            };
            let id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO agent_nodes (id, task_id, parent_id, agent_type, name, depth, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id,
                    new.task_id,
                    new.parent_id,
                    new.agent_type.to_string(),
                    new.name,
                    depth,
                    NodeStatus::Created.as_str(),
                    Utc::now(),
                ],
            )?;
            tx.commit()?;
            Ok(id)
        })
        .await
    }

    async fn update_status(
        &self,
        node_id: &str,
        status: NodeStatus,
        note: Option<String>,
    ) -> Result<bool, StoreError> {
        let node_id = node_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut node = load_node(&tx, &node_id)?
                .ok_or_else(|| StoreError::NodeNotFound(node_id.clone()))?;
            if !check_transition(&node, status)? {
                return Ok(false);
            }
            apply_transition(&mut node, status, note);
            tx.execute(
                "UPDATE agent_nodes SET status = ?2, started_at = ?3, finished_at = ?4,
                 result_summary = ?5, failure_reason = ?6 WHERE id = ?1",
                params![
                    node.id,
                    node.status.as_str(),
                    node.started_at,
                    node.finished_at,
                    node.result_summary,
                    node.failure_reason,
                ],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn update_counters(
        &self,
        node_id: &str,
        counters: NodeCounters,
    ) -> Result<(), StoreError> {
        let node_id = node_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let node = load_node(&tx, &node_id)?
                .ok_or_else(|| StoreError::NodeNotFound(node_id.clone()))?;
            check_mutable(&node)?;
            tx.execute(
                "UPDATE agent_nodes SET iterations = ?2, tool_calls = ?3, tokens_used = ?4,
                 findings_count = ?5 WHERE id = ?1",
                params![
                    node_id,
                    counters.iterations,
                    counters.tool_calls,
                    counters.tokens_used as i64,
                    counters.findings_count,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn record_checkpoint(
        &self,
        agent_id: &str,
        state: Value,
        kind: CheckpointKind,
        metadata: Value,
    ) -> Result<CheckpointId, StoreError> {
        let agent_id = agent_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let node = load_node(&tx, &agent_id)?
                .ok_or_else(|| StoreError::NodeNotFound(agent_id.clone()))?;
            let id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO agent_checkpoints (id, agent_id, task_id, kind, state, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id,
                    agent_id,
                    node.task_id,
                    kind.as_str(),
                    state.to_string(),
                    metadata.to_string(),
                    Utc::now(),
                ],
            )?;
            tx.commit()?;
            Ok(id)
        })
        .await
    }

    async fn latest_checkpoint(
        &self,
        agent_id: &str,
    ) -> Result<Option<AgentCheckpoint>, StoreError> {
        let agent_id = agent_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {CHECKPOINT_COLUMNS} FROM agent_checkpoints WHERE agent_id = ?1 ORDER BY seq DESC LIMIT 1"
            );
            Ok(conn
                .query_row(&sql, params![agent_id], checkpoint_from_row)
                .optional()?)
        })
        .await
    }

    async fn checkpoints(&self, agent_id: &str) -> Result<Vec<AgentCheckpoint>, StoreError> {
        let agent_id = agent_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {CHECKPOINT_COLUMNS} FROM agent_checkpoints WHERE agent_id = ?1 ORDER BY seq ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![agent_id], checkpoint_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn node(&self, node_id: &str) -> Result<Option<AgentTreeNode>, StoreError> {
        let node_id = node_id.to_string();
        self.with_conn(move |conn| load_node(conn, &node_id)).await
    }

    async fn task_nodes(&self, task_id: &str) -> Result<Vec<AgentTreeNode>, StoreError> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {NODE_COLUMNS} FROM agent_nodes WHERE task_id = ?1 ORDER BY rowid");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![task_id], node_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }
}
