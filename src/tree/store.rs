//! Agent 树与检查点存储抽象
//!
//! 所有写操作在返回前落盘（或写入内存结构），调用方拿到 Ok 即视为持久。

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::tree::model::{
    AgentCheckpoint, AgentId, AgentTreeNode, CheckpointId, CheckpointKind, NewNode, NodeCounters,
    NodeStatus, TreeView,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("node not found: {0}")]
    NodeNotFound(AgentId),

    #[error("parent {parent} does not belong to task {task}")]
    ParentTaskMismatch { parent: AgentId, task: String },

    #[error("node {node} is already {status} and cannot change")]
    TerminalStatus { node: AgentId, status: String },

    #[error("invalid status transition for {node}: {from} -> {to}")]
    InvalidTransition {
        node: AgentId,
        from: String,
        to: String,
    },

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

#[async_trait]
pub trait TreeStore: Send + Sync {
    /// 创建节点；父节点必须存在于同一任务内，depth 自动取 `parent.depth + 1`
    async fn create_node(&self, new: NewNode) -> Result<AgentId, StoreError>;

    /// 推进状态；发生变化返回 true，对同一终态的重放返回 false
    async fn update_status(
        &self,
        node_id: &str,
        status: NodeStatus,
        note: Option<String>,
    ) -> Result<bool, StoreError>;

    async fn update_counters(&self, node_id: &str, counters: NodeCounters)
        -> Result<(), StoreError>;

    async fn record_checkpoint(
        &self,
        agent_id: &str,
        state: Value,
        kind: CheckpointKind,
        metadata: Value,
    ) -> Result<CheckpointId, StoreError>;

    async fn latest_checkpoint(&self, agent_id: &str)
        -> Result<Option<AgentCheckpoint>, StoreError>;

    /// 按写入顺序返回
    async fn checkpoints(&self, agent_id: &str) -> Result<Vec<AgentCheckpoint>, StoreError>;

    async fn node(&self, node_id: &str) -> Result<Option<AgentTreeNode>, StoreError>;

    /// 按创建顺序返回任务下的所有节点
    async fn task_nodes(&self, task_id: &str) -> Result<Vec<AgentTreeNode>, StoreError>;

    async fn subtree(&self, task_id: &str) -> Result<Vec<TreeView>, StoreError> {
        Ok(TreeView::build(self.task_nodes(task_id).await?))
    }
}

/// 校验状态变化：`Ok(false)` 表示无需写入（同状态重放）
pub(crate) fn check_transition(node: &AgentTreeNode, next: NodeStatus) -> Result<bool, StoreError> {
    if node.status == next {
        return Ok(false);
    }
    if node.status.is_terminal() {
        return Err(StoreError::TerminalStatus {
            node: node.id.clone(),
            status: node.status.as_str().to_string(),
        });
    }
    if !node.status.can_transition_to(next) {
        return Err(StoreError::InvalidTransition {
            node: node.id.clone(),
            from: node.status.as_str().to_string(),
            to: next.as_str().to_string(),
        });
    }
    Ok(true)
}

/// 终态节点拒绝计数器更新
pub(crate) fn check_mutable(node: &AgentTreeNode) -> Result<(), StoreError> {
    if node.status.is_terminal() {
        return Err(StoreError::TerminalStatus {
            node: node.id.clone(),
            status: node.status.as_str().to_string(),
        });
    }
    Ok(())
}

/// 把状态变化应用到节点（时间戳、摘要或失败原因）
pub(crate) fn apply_transition(node: &mut AgentTreeNode, next: NodeStatus, note: Option<String>) {
    let now = chrono::Utc::now();
    if next == NodeStatus::Running && node.started_at.is_none() {
        node.started_at = Some(now);
    }
    if next.is_terminal() {
        node.finished_at = Some(now);
    }
    if next.is_failure() {
        node.failure_reason = note;
    } else if note.is_some() {
        node.result_summary = note;
    }
    node.status = next;
}

/// 两个后端共用的行为测试
#[cfg(test)]
pub(crate) mod contract {
    use super::*;
    use crate::tree::model::AgentType;
    use serde_json::json;

    pub async fn depth_follows_parent(store: &dyn TreeStore) {
        let root = store
            .create_node(NewNode::root(AgentType::Recon, "recon", "t1"))
            .await
            .unwrap();
        let child = store
            .create_node(NewNode::child(&root, AgentType::Analysis, "auth", "t1"))
            .await
            .unwrap();
        let grandchild = store
            .create_node(NewNode::child(&child, AgentType::Verification, "verify", "t1"))
            .await
            .unwrap();

        assert_eq!(store.node(&root).await.unwrap().unwrap().depth, 0);
        assert_eq!(store.node(&child).await.unwrap().unwrap().depth, 1);
        assert_eq!(store.node(&grandchild).await.unwrap().unwrap().depth, 2);

        let missing = store
            .create_node(NewNode::child("nope", AgentType::Analysis, "x", "t1"))
            .await;
        assert!(matches!(missing, Err(StoreError::NodeNotFound(_))));

        let cross_task = store
            .create_node(NewNode::child(&root, AgentType::Analysis, "x", "t2"))
            .await;
        assert!(matches!(cross_task, Err(StoreError::ParentTaskMismatch { .. })));

        let views = store.subtree("t1").await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].node_count(), 3);
    }

    pub async fn terminal_status_is_idempotent(store: &dyn TreeStore) {
        let id = store
            .create_node(NewNode::root(AgentType::Recon, "recon", "t1"))
            .await
            .unwrap();
        assert!(store.update_status(&id, NodeStatus::Running, None).await.unwrap());
        assert!(store
            .update_status(&id, NodeStatus::Completed, Some("done".into()))
            .await
            .unwrap());
        let finished = store.node(&id).await.unwrap().unwrap();

        assert!(!store
            .update_status(&id, NodeStatus::Completed, Some("again".into()))
            .await
            .unwrap());
        let replayed = store.node(&id).await.unwrap().unwrap();
        assert_eq!(replayed, finished);
        assert_eq!(replayed.result_summary.as_deref(), Some("done"));

        assert!(matches!(
            store.update_status(&id, NodeStatus::Failed, None).await,
            Err(StoreError::TerminalStatus { .. })
        ));
        assert!(matches!(
            store.update_counters(&id, NodeCounters::default()).await,
            Err(StoreError::TerminalStatus { .. })
        ));
    }

    pub async fn checkpoints_are_ordered(store: &dyn TreeStore) {
        let id = store
            .create_node(NewNode::root(AgentType::Recon, "recon", "t1"))
            .await
            .unwrap();
        assert!(store.latest_checkpoint(&id).await.unwrap().is_none());

        for i in 1..=3 {
            store
                .record_checkpoint(&id, json!({ "iteration": i }), CheckpointKind::Automatic, json!({}))
                .await
                .unwrap();
        }
        store
            .record_checkpoint(&id, json!({ "iteration": 3 }), CheckpointKind::Final, json!({"status": "completed"}))
            .await
            .unwrap();

        let all = store.checkpoints(&id).await.unwrap();
        assert_eq!(all.len(), 4);
        assert!(all.windows(2).all(|w| w[0].sequence < w[1].sequence));
        let latest = store.latest_checkpoint(&id).await.unwrap().unwrap();
        assert_eq!(latest.kind, CheckpointKind::Final);
        assert_eq!(latest.task_id, "t1");

        let missing = store
            .record_checkpoint("nope", json!({}), CheckpointKind::Manual, json!({}))
            .await;
        assert!(matches!(missing, Err(StoreError::NodeNotFound(_))));
    }

    pub async fn failure_reason_recorded(store: &dyn TreeStore) {
        let id = store
            .create_node(NewNode::root(AgentType::Recon, "recon", "t1"))
            .await
            .unwrap();
        store.update_status(&id, NodeStatus::Running, None).await.unwrap();
        store
            .update_counters(
                &id,
                NodeCounters {
                    iterations: 4,
                    tool_calls: 3,
                    tokens_used: 900,
                    findings_count: 0,
                },
            )
            .await
            .unwrap();
        store
            .update_status(&id, NodeStatus::Failed, Some("iteration limit".into()))
            .await
            .unwrap();
        let node = store.node(&id).await.unwrap().unwrap();
        assert_eq!(node.failure_reason.as_deref(), Some("iteration limit"));
        assert_eq!(node.counters.iterations, 4);
        assert!(node.started_at.is_some() && node.finished_at.is_some());
    }
}
