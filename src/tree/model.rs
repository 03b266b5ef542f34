//! Agent 树与检查点数据模型
//!
//! 一个审计任务对应一棵树：Recon 为根，Analysis 为其子节点，Verification 挂在产出该发现的 Analysis 下。
//! 节点状态单调推进：`created → running → completed | failed | cancelled`，终态节点不可再修改。

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::AgentPhase;
use crate::tree::StoreError;

pub type AgentId = String;
pub type TaskId = String;
pub type CheckpointId = String;

/// Agent 类型；`custom:<name>` 供扩展
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum AgentType {
    Recon,
    Analysis,
    Verification,
    Custom(String),
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentType::Recon => f.write_str("recon"),
            AgentType::Analysis => f.write_str("analysis"),
            AgentType::Verification => f.write_str("verification"),
            AgentType::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

impl FromStr for AgentType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recon" => Ok(AgentType::Recon),
            "analysis" => Ok(AgentType::Analysis),
            "verification" => Ok(AgentType::Verification),
            other => match other.strip_prefix("custom:") {
                Some(name) if !name.is_empty() => Ok(AgentType::Custom(name.to_string())),
                _ => Err(StoreError::Corrupt(format!("unknown agent type '{other}'"))),
            },
        }
    }
}

impl From<AgentType> for String {
    fn from(t: AgentType) -> Self {
        t.to_string()
    }
}

impl TryFrom<String> for AgentType {
    type Error = StoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Created => "created",
            NodeStatus::Running => "running",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
            NodeStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Cancelled
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, NodeStatus::Failed | NodeStatus::Cancelled)
    }

    /// 仅允许向前推进；`created` 可直接进入终态（如启动前被取消）
    pub fn can_transition_to(&self, next: NodeStatus) -> bool {
        match self {
            NodeStatus::Created => next != NodeStatus::Created,
            NodeStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl FromStr for NodeStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(NodeStatus::Created),
            "running" => Ok(NodeStatus::Running),
            "completed" => Ok(NodeStatus::Completed),
            "failed" => Ok(NodeStatus::Failed),
            "cancelled" => Ok(NodeStatus::Cancelled),
            other => Err(StoreError::Corrupt(format!("unknown node status '{other}'"))),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCounters {
    pub iterations: u32,
    pub tool_calls: u32,
    pub tokens_used: u64,
    pub findings_count: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentTreeNode {
    pub id: AgentId,
    pub parent_id: Option<AgentId>,
    pub agent_type: AgentType,
    pub name: String,
    pub depth: u32,
    pub task_id: TaskId,
    pub status: NodeStatus,
    pub counters: NodeCounters,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result_summary: Option<String>,
    pub failure_reason: Option<String>,
}

/// 创建节点的参数
#[derive(Clone, Debug)]
pub struct NewNode {
    pub parent_id: Option<AgentId>,
    pub agent_type: AgentType,
    pub name: String,
    pub task_id: TaskId,
}

impl NewNode {
    pub fn root(agent_type: AgentType, name: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            parent_id: None,
            agent_type,
            name: name.into(),
            task_id: task_id.into(),
        }
    }

    pub fn child(
        parent_id: impl Into<String>,
        agent_type: AgentType,
        name: impl Into<String>,
        task_id: impl Into<String>,
    ) -> Self {
        Self {
            parent_id: Some(parent_id.into()),
            agent_type,
            name: name.into(),
            task_id: task_id.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    Automatic,
    Manual,
    Final,
}

impl CheckpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointKind::Automatic => "automatic",
            CheckpointKind::Manual => "manual",
            CheckpointKind::Final => "final",
        }
    }
}

impl FromStr for CheckpointKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "automatic" => Ok(CheckpointKind::Automatic),
            "manual" => Ok(CheckpointKind::Manual),
            "final" => Ok(CheckpointKind::Final),
            other => Err(StoreError::Corrupt(format!("unknown checkpoint kind '{other}'"))),
        }
    }
}

/// 检查点：追加写入，同一 Agent 内按 `sequence` 严格递增
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentCheckpoint {
    pub id: CheckpointId,
    pub agent_id: AgentId,
    pub task_id: TaskId,
    pub sequence: u64,
    pub kind: CheckpointKind,
    pub state: Value,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// 对话在缓存中的位置
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRef {
    pub session_id: String,
    pub agent_id: AgentId,
}

/// 检查点中的运行时状态
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentStateSnapshot {
    /// 已完成的迭代数
    pub iteration: u32,
    pub conversation: ConversationRef,
    #[serde(default)]
    pub findings: Vec<Value>,
    #[serde(default)]
    pub scratch: BTreeMap<String, Value>,
    pub tool_calls: u32,
    pub tokens_used: u64,
    pub parse_failures: u32,
    pub phase: AgentPhase,
}

impl AgentStateSnapshot {
    pub fn from_checkpoint(checkpoint: &AgentCheckpoint) -> Result<Self, StoreError> {
        serde_json::from_value(checkpoint.state.clone())
            .map_err(|e| StoreError::Corrupt(format!("checkpoint {}: {e}", checkpoint.id)))
    }
}

/// 嵌套视图
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TreeView {
    pub node: AgentTreeNode,
    pub children: Vec<TreeView>,
}

impl TreeView {
    /// 把同一任务的节点组装为森林，根节点在前，兄弟按创建顺序
    pub fn build(mut nodes: Vec<AgentTreeNode>) -> Vec<TreeView> {
        nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.depth.cmp(&b.depth)));
        let mut children: BTreeMap<Option<AgentId>, Vec<AgentTreeNode>> = BTreeMap::new();
        for node in nodes {
            children.entry(node.parent_id.clone()).or_default().push(node);
        }
        fn assemble(
            parent: Option<AgentId>,
            children: &mut BTreeMap<Option<AgentId>, Vec<AgentTreeNode>>,
        ) -> Vec<TreeView> {
            children
                .remove(&parent)
                .unwrap_or_default()
                .into_iter()
                .map(|node| {
                    let kids = assemble(Some(node.id.clone()), children);
                    TreeView {
                        node,
                        children: kids,
                    }
                })
                .collect()
        }
        assemble(None, &mut children)
    }

    /// 前序遍历
    pub fn walk(&self) -> Vec<&AgentTreeNode> {
        let mut out = vec![&self.node];
        for child in &self.children {
            out.extend(child.walk());
        }
        out
    }

    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(TreeView::node_count).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, parent: Option<&str>, depth: u32) -> AgentTreeNode {
        AgentTreeNode {
            id: id.into(),
            parent_id: parent.map(String::from),
            agent_type: AgentType::Analysis,
            name: id.into(),
            depth,
            task_id: "t".into(),
            status: NodeStatus::Created,
            counters: NodeCounters::default(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result_summary: None,
            failure_reason: None,
        }
    }

    #[test]
    fn test_agent_type_string_form() {
        assert_eq!(AgentType::Custom("sca".into()).to_string(), "custom:sca");
        assert_eq!("recon".parse::<AgentType>().unwrap(), AgentType::Recon);
        assert!("custom:".parse::<AgentType>().is_err());
        let json = serde_json::to_string(&AgentType::Verification).unwrap();
        assert_eq!(json, "\"verification\"");
    }

    #[test]
    fn test_status_is_monotonic() {
        assert!(NodeStatus::Created.can_transition_to(NodeStatus::Running));
        assert!(NodeStatus::Created.can_transition_to(NodeStatus::Cancelled));
        assert!(NodeStatus::Running.can_transition_to(NodeStatus::Failed));
        assert!(!NodeStatus::Running.can_transition_to(NodeStatus::Created));
        assert!(!NodeStatus::Completed.can_transition_to(NodeStatus::Failed));
    }

    #[test]
    fn test_build_nests_children() {
        let views = TreeView::build(vec![
            node("b", Some("a"), 1),
            node("a", None, 0),
            node("c", Some("b"), 2),
        ]);
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].node.id, "a");
        assert_eq!(views[0].node_count(), 3);
        let ids: Vec<_> = views[0].walk().iter().map(|n| n.id.clone()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
