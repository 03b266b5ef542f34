//! 内存后端（测试与单进程运行）

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::tree::model::{
    AgentCheckpoint, AgentId, AgentTreeNode, CheckpointId, CheckpointKind, NewNode, NodeCounters,
    NodeStatus,
};
use crate::tree::store::{apply_transition, check_mutable, check_transition, StoreError, TreeStore};

#[derive(Default)]
struct State {
    nodes: HashMap<AgentId, AgentTreeNode>,
    /// 创建顺序
    order: Vec<AgentId>,
    checkpoints: HashMap<AgentId, Vec<AgentCheckpoint>>,
    next_sequence: u64,
}

#[derive(Default)]
pub struct InMemoryTreeStore {
    state: RwLock<State>,
}

impl InMemoryTreeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TreeStore for InMemoryTreeStore {
    async fn create_node(&self, new: NewNode) -> Result<AgentId, StoreError> {
        let mut state = self.state.write().await;
        let depth = match &new.parent_id {
            None => 0,
            Some(parent_id) => {
                let parent = state
                    .nodes
                    .get(parent_id)
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
        let node = AgentTreeNode {
            id: id.clone(),
            parent_id: new.parent_id,
            agent_type: new.agent_type,
            name: new.name,
            depth,
            task_id: new.task_id,
            status: NodeStatus::Created,
            counters: NodeCounters::default(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result_summary: None,
            failure_reason: None,
        };
        state.nodes.insert(id.clone(), node);
        state.order.push(id.clone());
        Ok(id)
    }

    async fn update_status(
        &self,
        node_id: &str,
        status: NodeStatus,
        note: Option<String>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let node = state
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| StoreError::NodeNotFound(node_id.to_string()))?;
        if !check_transition(node, status)? {
            return Ok(false);
        }
        apply_transition(node, status, note);
        Ok(true)
    }

    async fn update_counters(
        &self,
        node_id: &str,
        counters: NodeCounters,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let node = state
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| StoreError::NodeNotFound(node_id.to_string()))?;
        check_mutable(node)?;
        node.counters = counters;
        Ok(())
    }

    async fn record_checkpoint(
        &self,
        agent_id: &str,
        state_blob: Value,
        kind: CheckpointKind,
        metadata: Value,
    ) -> Result<CheckpointId, StoreError> {
        let mut state = self.state.write().await;
        let task_id = state
            .nodes
            .get(agent_id)
            .map(|n| n.task_id.clone())
            .ok_or_else(|| StoreError::NodeNotFound(agent_id.to_string()))?;
        state.next_sequence += 1;
        let checkpoint = AgentCheckpoint {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            task_id,
            sequence: state.next_sequence,
            kind,
            state: state_blob,
            metadata,
            created_at: Utc::now(),
        };
        let id = checkpoint.id.clone();
        state
            .checkpoints
            .entry(agent_id.to_string())
            .or_default()
            .push(checkpoint);
        Ok(id)
    }

    async fn latest_checkpoint(
        &self,
        agent_id: &str,
    ) -> Result<Option<AgentCheckpoint>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .checkpoints
            .get(agent_id)
            .and_then(|list| list.last().cloned()))
    }

    async fn checkpoints(&self, agent_id: &str) -> Result<Vec<AgentCheckpoint>, StoreError> {
        let state = self.state.read().await;
        Ok(state.checkpoints.get(agent_id).cloned().unwrap_or_default())
    }

    async fn node(&self, node_id: &str) -> Result<Option<AgentTreeNode>, StoreError> {
        Ok(self.state.read().await.nodes.get(node_id).cloned())
    }

    async fn task_nodes(&self, task_id: &str) -> Result<Vec<AgentTreeNode>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.nodes.get(id))
            .filter(|n| n.task_id == task_id)
            .cloned()
            .collect())
    }
}
