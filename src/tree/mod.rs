//! Agent 树与检查点：数据模型、存储抽象、内存 / SQLite 后端

pub mod memory;
pub mod model;
pub mod sqlite;
pub mod store;

pub use memory::InMemoryTreeStore;
pub use model::{
    AgentCheckpoint, AgentId, AgentStateSnapshot, AgentTreeNode, AgentType, CheckpointId,
    CheckpointKind, ConversationRef, NewNode, NodeCounters, NodeStatus, TaskId, TreeView,
};
pub use sqlite::SqliteTreeStore;
pub use store::{StoreError, TreeStore};
