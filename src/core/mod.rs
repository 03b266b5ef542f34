//! 核心层：错误与恢复策略、Agent 阶段状态机、优雅关闭、组件构建

pub mod builder;
pub mod error;
pub mod recovery;
pub mod shutdown;
pub mod state;

pub use builder::{AuditBuilder, AuditComponents, SANDBOX_GUARD};
pub use error::{AgentError, RecoveryAction};
pub use recovery::RecoveryEngine;
pub use shutdown::ShutdownManager;
pub use state::AgentPhase;
